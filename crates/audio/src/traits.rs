//! Traits abstraits pour le système audio
//!
//! Ce module définit les interfaces que doivent implémenter
//! les composants audio. Cela permet d'avoir du code modulaire
//! et testable sans matériel :
//! - CpalCapture / SyntheticCapture pour la capture
//! - CpalSink / MemorySink pour le rendu

use async_trait::async_trait;
use tokio::sync::watch;

use crate::{AudioResult, SampleBuffer};

/// Callback appelé pour chaque buffer capturé
///
/// Appelé depuis le thread du périphérique : il doit rendre la main vite
/// (encoder puis pousser dans un canal).
pub type SampleCallback = Box<dyn FnMut(SampleBuffer) + Send + 'static>;

/// Trait pour capturer l'audio depuis un périphérique d'entrée
///
/// `#[async_trait]` permet d'avoir des fonctions async dans les traits.
#[async_trait]
pub trait AudioCapture: Send + Sync {
    /// Démarre la capture audio
    ///
    /// Acquiert le périphérique puis livre des buffers de taille constante
    /// à `on_buffer` jusqu'à `stop()`.
    ///
    /// # Erreurs
    /// - `AudioError::CaptureUnavailable` : pas de micro, permission refusée,
    ///   format non supporté. Renvoyé avant toute livraison de buffer.
    async fn start(&mut self, on_buffer: SampleCallback) -> AudioResult<()>;

    /// Arrête la capture audio
    ///
    /// Idempotent : appelable dans n'importe quel état, y compris avant
    /// `start()`. Aucun callback n'est livré après le retour.
    async fn stop(&mut self) -> AudioResult<()>;

    /// Vérifie si la capture est active
    fn is_recording(&self) -> bool;

    /// Niveau micro courant (0-100), publié à cadence fixe
    ///
    /// `None` tant que la capture n'a pas démarré.
    fn level(&self) -> Option<watch::Receiver<u8>>;

    /// Retourne des informations sur le périphérique utilisé
    fn device_info(&self) -> String {
        "Périphérique inconnu".to_string()
    }
}

/// Trait pour rendre des échantillons sur une sortie audio
///
/// `render` ne rend la main qu'une fois les échantillons consommés par le
/// périphérique : la file de lecture s'en sert pour enchaîner les fragments
/// sans chevauchement.
#[async_trait]
pub trait AudioSink: Send {
    /// Joue des échantillons mono à `sample_rate`
    async fn render(&mut self, samples: &[f32], sample_rate: u32) -> AudioResult<()>;

    /// Retourne des informations sur le périphérique de sortie
    fn device_info(&self) -> String {
        "Périphérique de sortie inconnu".to_string()
    }
}

/// Fabrique de sorties audio
///
/// Permet de créer la sortie à la demande (à la première connexion ouverte),
/// jamais avant.
pub trait SinkFactory: Send + Sync {
    fn create(&self) -> AudioResult<Box<dyn AudioSink>>;
}
