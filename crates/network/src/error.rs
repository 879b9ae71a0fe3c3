//! Gestion d'erreurs pour le système réseau
//!
//! Ce module définit les erreurs de la session WebSocket avec le service
//! de conversation. Il suit les mêmes patterns que le module audio pour
//! la cohérence du code.

use thiserror::Error;

/// Catégorie d'une erreur signalée par le service distant
///
/// Décide de la réaction de la session :
/// - `RateLimited` : notification seulement, pas de nouvelle tentative
/// - `ServiceUnavailable` : reconnexion planifiée
/// - `Generic` : notification seulement
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportErrorKind {
    RateLimited,
    ServiceUnavailable,
    Generic,
}

impl TransportErrorKind {
    /// Classe une erreur d'après son `code` et son `type`
    pub fn classify(code: Option<&str>, error_type: Option<&str>) -> Self {
        let code = code.unwrap_or_default();
        let error_type = error_type.unwrap_or_default();

        if code.contains("rate_limit") || error_type.contains("rate_limit") {
            TransportErrorKind::RateLimited
        } else if matches!(code, "service_unavailable" | "server_overloaded" | "overloaded")
            || error_type == "service_unavailable_error"
        {
            TransportErrorKind::ServiceUnavailable
        } else {
            TransportErrorKind::Generic
        }
    }
}

/// Énumération de toutes les erreurs possibles dans le système réseau
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Échec de l'ouverture du WebSocket
    #[error("Connexion à {url} impossible: {reason}")]
    ConnectionFailed { url: String, reason: String },

    /// Timeout lors de l'ouverture du WebSocket
    #[error("Timeout de connexion vers {url} après {timeout_ms}ms")]
    ConnectionTimeout { url: String, timeout_ms: u64 },

    /// La connexion s'est fermée anormalement
    #[error("Connexion perdue (code {code}): {reason}")]
    ConnectionLost { code: u16, reason: String },

    /// Erreur signalée par le service distant (message `error`)
    #[error("Erreur du service ({kind:?}): {message}")]
    Transport { kind: TransportErrorKind, message: String },

    /// Envoi tenté alors que la connexion n'est pas ouverte
    #[error("Non connecté")]
    NotConnected,

    /// La tâche de session est arrêtée
    #[error("Session arrêtée")]
    SessionClosed,

    /// Erreur du protocole WebSocket
    #[error("Erreur WebSocket: {0}")]
    WebSocket(String),

    /// Erreur lors de la sérialisation/désérialisation des messages JSON
    #[error("Erreur de sérialisation: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// URL ou en-tête invalide fourni par l'utilisateur
    #[error("Adresse invalide: {0}")]
    InvalidUrl(String),

    /// Erreur de configuration réseau
    #[error("Configuration réseau invalide: {0}")]
    ConfigError(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for NetworkError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        NetworkError::WebSocket(err.to_string())
    }
}

/// Type Result personnalisé pour notre crate network
pub type NetworkResult<T> = Result<T, NetworkError>;

/// Fonctions utilitaires pour créer des erreurs communes
impl NetworkError {
    /// Crée une erreur d'ouverture avec contexte
    pub fn connection_failed(url: &str, cause: impl std::fmt::Display) -> Self {
        Self::ConnectionFailed {
            url: url.to_string(),
            reason: cause.to_string(),
        }
    }

    /// Crée une erreur de fermeture anormale
    pub fn connection_lost(code: u16, reason: impl Into<String>) -> Self {
        Self::ConnectionLost {
            code,
            reason: reason.into(),
        }
    }

    /// Crée une erreur de service
    pub fn transport(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self::Transport {
            kind,
            message: message.into(),
        }
    }

    /// Vérifie si l'erreur nécessite une reconnexion
    pub fn requires_reconnection(&self) -> bool {
        matches!(
            self,
            NetworkError::ConnectionFailed { .. }
                | NetworkError::ConnectionTimeout { .. }
                | NetworkError::ConnectionLost { .. }
                | NetworkError::WebSocket(_)
                | NetworkError::Transport { kind: TransportErrorKind::ServiceUnavailable, .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = NetworkError::connection_failed("wss://exemple", "refusée");
        assert!(error.to_string().contains("wss://exemple"));
        assert!(error.to_string().contains("refusée"));

        let lost = NetworkError::connection_lost(1006, "EOF");
        assert_eq!(lost.to_string(), "Connexion perdue (code 1006): EOF");
    }

    #[test]
    fn test_classify_transport_errors() {
        assert_eq!(
            TransportErrorKind::classify(Some("rate_limit_exceeded"), None),
            TransportErrorKind::RateLimited
        );
        assert_eq!(
            TransportErrorKind::classify(None, Some("rate_limit_error")),
            TransportErrorKind::RateLimited
        );
        assert_eq!(
            TransportErrorKind::classify(Some("service_unavailable"), Some("server_error")),
            TransportErrorKind::ServiceUnavailable
        );
        assert_eq!(
            TransportErrorKind::classify(Some("invalid_value"), Some("invalid_request_error")),
            TransportErrorKind::Generic
        );
        assert_eq!(TransportErrorKind::classify(None, None), TransportErrorKind::Generic);
    }

    #[test]
    fn test_error_requires_reconnection() {
        assert!(NetworkError::connection_lost(1011, "erreur serveur").requires_reconnection());
        assert!(
            NetworkError::transport(TransportErrorKind::ServiceUnavailable, "surcharge")
                .requires_reconnection()
        );
        assert!(!NetworkError::transport(TransportErrorKind::RateLimited, "lent").requires_reconnection());
        assert!(!NetworkError::NotConnected.requires_reconnection());
    }
}
