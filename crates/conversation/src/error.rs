//! Gestion d'erreurs pour la conversation
//!
//! Les erreurs audio et réseau sont enveloppées telles quelles. Les erreurs
//! de persistance ne sortent jamais de `ConversationState` : elles sont
//! journalisées puis ignorées.

use thiserror::Error;

use audio::AudioError;
use network::NetworkError;

#[derive(Error, Debug)]
pub enum ConversationError {
    #[error(transparent)]
    Audio(#[from] AudioError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    /// Historique enregistré illisible ou au mauvais format
    #[error("Historique corrompu: {0}")]
    PersistenceCorrupt(String),

    #[error("Erreur d'entrée/sortie: {0}")]
    Io(#[from] std::io::Error),

    /// Service externe (notifications, médicaments) en échec
    #[error("Service {service} en échec: {reason}")]
    Collaborator { service: String, reason: String },

    /// Arguments d'un appel d'outil invalides
    #[error("Arguments invalides pour {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("Outil inconnu: {0}")]
    UnknownTool(String),
}

impl From<serde_json::Error> for ConversationError {
    fn from(err: serde_json::Error) -> Self {
        ConversationError::PersistenceCorrupt(err.to_string())
    }
}

impl ConversationError {
    pub fn collaborator(service: &str, reason: impl std::fmt::Display) -> Self {
        Self::Collaborator {
            service: service.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Erreur à renvoyer au modèle plutôt qu'à l'utilisateur
    pub fn is_tool_error(&self) -> bool {
        matches!(
            self,
            ConversationError::Collaborator { .. }
                | ConversationError::InvalidArguments { .. }
                | ConversationError::UnknownTool(_)
        )
    }
}

pub type ConversationResult<T> = Result<T, ConversationError>;
