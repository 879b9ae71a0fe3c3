//! Types de données pour le système audio
//!
//! Ce module définit les structures qui circulent dans la chaîne audio :
//! - SampleBuffer : buffer brut livré par la capture
//! - WireFrame : buffer encodé prêt à partir sur le réseau
//! - PlaybackFragment : fragment audio reçu, en attente de lecture

use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Type pour un échantillon audio
///
/// Valeurs nominales entre -1.0 et +1.0, 0.0 = silence.
pub type Sample = f32;

/// Buffer d'échantillons livré par la capture
///
/// Créé à chaque callback du périphérique puis consommé immédiatement
/// par l'encodeur. Sa longueur est constante pendant une session
/// (`AudioConfig::buffer_size`).
#[derive(Clone, Debug, PartialEq)]
pub struct SampleBuffer {
    /// Échantillons mono à `sample_rate`
    pub samples: Vec<Sample>,

    /// Fréquence d'échantillonnage des échantillons
    pub sample_rate: u32,

    /// Instant de livraison par le périphérique
    pub captured_at: Instant,
}

impl SampleBuffer {
    /// Crée un nouveau buffer horodaté maintenant
    ///
    /// # Example
    /// ```rust
    /// use audio::SampleBuffer;
    ///
    /// let buffer = SampleBuffer::new(vec![0.1, 0.2, -0.1, 0.0], 24000);
    /// assert_eq!(buffer.len(), 4);
    /// ```
    pub fn new(samples: Vec<Sample>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            captured_at: Instant::now(),
        }
    }

    /// Crée un buffer de silence
    pub fn silence(sample_count: usize, sample_rate: u32) -> Self {
        Self::new(vec![0.0; sample_count], sample_rate)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Durée de ce buffer en millisecondes
    pub fn duration_ms(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        (self.samples.len() as f32 / self.sample_rate as f32) * 1000.0
    }

    /// Calcule le niveau sonore RMS (Root Mean Square)
    ///
    /// Retourne une valeur entre 0.0 et 1.0
    pub fn rms_level(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }

        let sum_squares: f32 = self.samples.iter().map(|&s| s * s).sum();

        (sum_squares / self.samples.len() as f32).sqrt()
    }
}

/// Buffer encodé, prêt pour `input_audio_buffer.append`
///
/// `audio` contient le PCM16 little-endian encodé en base64 (alphabet standard).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireFrame {
    /// Charge utile base64
    pub audio: String,

    /// Nombre d'échantillons du buffer source
    pub sample_count: usize,
}

impl WireFrame {
    /// Taille des données PCM16 avant base64
    pub fn pcm_bytes(&self) -> usize {
        self.sample_count * 2
    }
}

/// Fragment audio reçu du service distant
///
/// La charge utile reste brute (base64 PCM16) jusqu'à son tour de lecture :
/// le décodage a lieu dans la tâche de lecture, jamais à la réception.
#[derive(Clone, Debug, PartialEq)]
pub struct PlaybackFragment {
    /// PCM16 little-endian encodé en base64
    pub payload: String,

    /// Rang d'arrivée, attribué par la file de lecture
    pub sequence: u64,
}

impl PlaybackFragment {
    pub fn new(payload: impl Into<String>, sequence: u64) -> Self {
        Self {
            payload: payload.into(),
            sequence,
        }
    }
}

/// Statistiques audio pour le monitoring
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioStats {
    /// Nombre de fragments mis en file
    pub fragments_enqueued: u64,

    /// Nombre de fragments joués jusqu'au bout
    pub fragments_played: u64,

    /// Nombre de fragments abandonnés (décodage ou rendu en échec)
    pub fragments_dropped: u64,
}

impl AudioStats {
    /// Calcule le pourcentage de fragments abandonnés
    pub fn drop_percentage(&self) -> f32 {
        if self.fragments_enqueued == 0 {
            return 0.0;
        }
        (self.fragments_dropped as f32 / self.fragments_enqueued as f32) * 100.0
    }

    /// Fragments encore en attente de lecture
    pub fn pending(&self) -> u64 {
        self.fragments_enqueued
            .saturating_sub(self.fragments_played + self.fragments_dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_buffer_creation() {
        let samples = vec![0.1, -0.2, 0.3, 0.0];
        let buffer = SampleBuffer::new(samples.clone(), 24000);

        assert_eq!(buffer.samples, samples);
        assert_eq!(buffer.sample_rate, 24000);
        assert!(buffer.captured_at.elapsed().as_millis() < 100); // Créé récemment
    }

    #[test]
    fn test_buffer_duration() {
        let buffer = SampleBuffer::silence(2400, 24000);
        assert!((buffer.duration_ms() - 100.0).abs() < 0.01);
        assert_eq!(buffer.rms_level(), 0.0);
    }

    #[test]
    fn test_rms_calculation() {
        let buffer = SampleBuffer::new(vec![0.5, -0.5, 0.5, -0.5], 24000);
        assert!((buffer.rms_level() - 0.5).abs() < 0.001);
    }

    #[test]
    fn test_stats_percentages() {
        let stats = AudioStats {
            fragments_enqueued: 20,
            fragments_played: 15,
            fragments_dropped: 1,
        };

        assert_eq!(stats.drop_percentage(), 5.0);
        assert_eq!(stats.pending(), 4);
    }
}
