//! Configuration audio pour le client vocal
//!
//! Ce module définit les paramètres de capture et de lecture.
//! Le format est imposé par le service distant : PCM16 mono à 24 kHz.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration principale pour tout le système audio
///
/// Cette structure contient les paramètres nécessaires pour configurer :
/// - La capture audio (microphone) et son moniteur de niveau
/// - La lecture des fragments reçus (haut-parleurs)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AudioConfig {
    /// Fréquence d'échantillonnage en Hz
    ///
    /// 24000 Hz est le format attendu par le service distant,
    /// en entrée comme en sortie.
    pub sample_rate: u32,

    /// Nombre de canaux audio livrés à l'encodeur
    ///
    /// Toujours 1 : les micros multi-canaux sont mixés en mono.
    pub channels: u16,

    /// Nombre d'échantillons par buffer livré au callback de capture
    ///
    /// 4096 échantillons à 24 kHz = ~170ms d'audio par trame envoyée
    pub buffer_size: usize,

    /// Demande l'annulation d'écho au système hôte
    pub echo_cancellation: bool,

    /// Demande la réduction de bruit au système hôte
    pub noise_suppression: bool,

    /// Demande le contrôle automatique du gain au système hôte
    pub auto_gain_control: bool,

    /// Période de publication du niveau micro
    ///
    /// ~16ms, soit la cadence d'une frame d'animation à 60 Hz
    #[serde(with = "duration_ms")]
    pub level_interval: Duration,
}

impl Default for AudioConfig {
    /// Configuration par défaut attendue par le service de conversation vocale
    fn default() -> Self {
        Self {
            sample_rate: 24000,      // 24 kHz - format du service
            channels: 1,             // Mono pour la voix
            buffer_size: 4096,       // ~170ms par buffer
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            level_interval: Duration::from_millis(16),
        }
    }
}

impl AudioConfig {
    /// Durée couverte par un buffer de capture
    ///
    /// Formule : buffer_size / sample_rate
    /// Exemple : 4096 / 24000 = ~170ms
    pub fn buffer_duration(&self) -> Duration {
        Duration::from_secs_f64(self.buffer_size as f64 / self.sample_rate as f64)
    }

    /// Taille en bytes d'un buffer une fois encodé en PCM16 (avant base64)
    pub fn encoded_buffer_bytes(&self) -> usize {
        self.buffer_size * self.channels as usize * 2
    }

    /// Valide que la configuration est cohérente
    pub fn validate(&self) -> Result<(), String> {
        if self.sample_rate < 8000 || self.sample_rate > 48000 {
            return Err(format!("Sample rate invalide: {} (doit être entre 8000 et 48000)", self.sample_rate));
        }

        if self.channels != 1 {
            return Err(format!("Nombre de canaux invalide: {} (seul le mono est supporté)", self.channels));
        }

        if self.buffer_size == 0 || self.buffer_size > 16384 {
            return Err(format!("Taille de buffer invalide: {} (doit être entre 1 et 16384)", self.buffer_size));
        }

        if self.level_interval.is_zero() {
            return Err("Intervalle du moniteur de niveau nul".to_string());
        }

        Ok(())
    }

    /// Configuration sans traitement côté hôte (signal brut)
    pub fn raw() -> Self {
        Self {
            echo_cancellation: false,
            noise_suppression: false,
            auto_gain_control: false,
            ..Default::default()
        }
    }

    /// Configuration pour les tests : petits buffers, cadence rapide
    pub fn test_config() -> Self {
        Self {
            buffer_size: 240,    // 10ms à 24 kHz
            ..Default::default()
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AudioConfig::default();

        assert_eq!(config.sample_rate, 24000);
        assert_eq!(config.buffer_size, 4096);
        assert_eq!(config.encoded_buffer_bytes(), 8192);
        assert_eq!(config.buffer_duration().as_millis(), 170);

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_config() {
        let mut config = AudioConfig::default();

        config.sample_rate = 1000; // Trop bas
        assert!(config.validate().is_err());

        config.sample_rate = 24000;
        config.channels = 2; // Stéréo non supporté
        assert!(config.validate().is_err());

        config.channels = 1;
        config.buffer_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_preset_configs() {
        let raw = AudioConfig::raw();
        assert!(!raw.echo_cancellation);
        assert!(raw.validate().is_ok());

        let test = AudioConfig::test_config();
        assert_eq!(test.buffer_size, 240);
        assert!(test.validate().is_ok());
    }
}
