//! Gestion d'erreurs pour le système audio
//!
//! Ce module définit toutes les erreurs possibles dans la chaîne audio :
//! capture micro, encodage PCM16, décodage des fragments reçus et lecture.

use thiserror::Error;

/// Énumération de toutes les erreurs possibles dans le système audio
#[derive(Error, Debug)]
pub enum AudioError {
    /// Microphone absent, permission refusée ou format non supporté
    ///
    /// Fatal pour la capture uniquement : remonté avant toute livraison de buffer,
    /// sans nouvelle tentative.
    #[error("Microphone inaccessible: {0}")]
    CaptureUnavailable(String),

    /// Buffer d'échantillons invalide (vide, NaN, infini)
    ///
    /// Le buffer est abandonné, la capture continue.
    #[error("Échec d'encodage: {0}")]
    EncodeFailure(String),

    /// Fragment audio reçu mal formé (base64 invalide, longueur impaire...)
    ///
    /// Le fragment est abandonné, la file de lecture continue.
    #[error("Échec de décodage: {0}")]
    DecodeFailure(String),

    /// Aucun périphérique de sortie (haut-parleurs) n'a été trouvé
    #[error("Aucun périphérique de sortie trouvé")]
    NoOutputDevice,

    /// Erreur lors de la configuration des paramètres audio
    #[error("Erreur de configuration audio: {0}")]
    ConfigError(String),

    /// Erreur remontée par le stream de sortie pendant la lecture
    #[error("Erreur de lecture: {0}")]
    PlaybackError(String),

    /// La file de lecture a été arrêtée
    #[error("File de lecture arrêtée")]
    QueueClosed,
}

/// Conversion des erreurs cpal::BuildStreamError
impl From<cpal::BuildStreamError> for AudioError {
    fn from(err: cpal::BuildStreamError) -> Self {
        AudioError::ConfigError(format!("Erreur construction stream: {:?}", err))
    }
}

/// Conversion des erreurs cpal::PlayStreamError
impl From<cpal::PlayStreamError> for AudioError {
    fn from(err: cpal::PlayStreamError) -> Self {
        AudioError::ConfigError(format!("Erreur démarrage stream: {:?}", err))
    }
}

/// Conversion des erreurs cpal::SupportedStreamConfigsError
impl From<cpal::SupportedStreamConfigsError> for AudioError {
    fn from(err: cpal::SupportedStreamConfigsError) -> Self {
        AudioError::ConfigError(format!("Configs supportées indisponibles: {:?}", err))
    }
}

impl From<hound::Error> for AudioError {
    fn from(err: hound::Error) -> Self {
        AudioError::DecodeFailure(format!("Conteneur WAV invalide: {}", err))
    }
}

impl AudioError {
    /// Vérifie si l'erreur ne concerne qu'un seul buffer ou fragment
    ///
    /// Ces erreurs se récupèrent localement (abandon puis on continue).
    pub fn is_recoverable(&self) -> bool {
        matches!(self, AudioError::EncodeFailure(_) | AudioError::DecodeFailure(_))
    }
}

/// Type Result personnalisé pour notre crate
pub type AudioResult<T> = Result<T, AudioError>;
