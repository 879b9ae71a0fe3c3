//! Crate network - Session temps réel avec le service de conversation vocale
//!
//! Ce crate maintient une connexion WebSocket vers le service, envoie l'audio
//! du micro et les messages texte, et remonte les réponses (transcription,
//! audio, appels d'outils) sous forme d'événements.
//!
//! # Architecture
//!
//! Le crate est organisé en plusieurs modules :
//!
//! - `error` : Gestion d'erreurs et classification des erreurs du service
//! - `types` : États de connexion, qualité, configuration, événements
//! - `protocol` : Messages JSON échangés avec le service
//! - `traits` : Traits abstraits pour les connexions (émission, réception)
//! - `transport` : Implémentations WebSocket (réelle et simulée)
//! - `session` : Tâche de session avec reconnexion et lecture audio
//!
//! # Examples
//!
//! ## Session réelle
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use network::{NetworkConfig, TransportSession, WsConnector};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = NetworkConfig::default();
//! config.api_key = Some("sk-...".to_string());
//!
//! let connector = Arc::new(WsConnector::new(config.clone()));
//! let (session, mut events) = TransportSession::new(config, connector).spawn();
//!
//! session.connect()?;
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Tests et simulation
//!
//! ```rust
//! use std::sync::Arc;
//! use network::{NetworkConfig, SimulatedConnector, TransportSession};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Service simulé, sans réseau
//! let connector = SimulatedConnector::failing_first(1);
//! let (session, _events) =
//!     TransportSession::new(NetworkConfig::test_config(), Arc::new(connector.clone())).spawn();
//!
//! session.connect()?;
//! # Ok(())
//! # }
//! ```

// Modules internes
mod error;
mod types;
mod protocol;
mod traits;
mod transport;
mod session;

// Re-exports publics
pub use error::{NetworkError, NetworkResult, TransportErrorKind};

pub use types::{
    CloseReason, ConnectionQuality, ConnectionState, ConnectionStatus, InputTranscription,
    LatencyWindow, NetworkConfig, SessionEvent, SessionNotice, SessionOptions, ToolDefinition,
    TurnDetection,
};

pub use protocol::{ClientEvent, ConversationItem, ContentPart, ErrorPayload, ServerEvent};

pub use traits::{CLOSE_ABNORMAL, CLOSE_NORMAL, Connection, Connector, Frame, FrameSink, FrameStream};

pub use transport::{SimulatedConnector, WsConnector};

pub use session::{SessionHandle, TransportSession};

// Re-exports depuis le crate audio (pour simplicité d'utilisation)
pub use audio::WireFrame;

/// Version du crate network
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Fonctions utilitaires pour l'utilisateur final
pub mod utils {
    use std::time::Duration;

    /// Formate une durée en millisecondes de façon lisible
    ///
    /// # Example
    /// ```rust
    /// use network::utils;
    /// use std::time::Duration;
    ///
    /// assert_eq!(utils::format_duration(Duration::from_millis(1234)), "1.23s");
    /// assert_eq!(utils::format_duration(Duration::from_millis(56)), "56ms");
    /// ```
    pub fn format_duration(duration: Duration) -> String {
        let ms = duration.as_millis();

        if ms >= 1000 {
            format!("{:.2}s", ms as f64 / 1000.0)
        } else {
            format!("{}ms", ms)
        }
    }

    /// Moyenne lisible d'une série de latences
    ///
    /// ```rust
    /// use network::utils;
    ///
    /// assert_eq!(utils::format_latency(&[50, 70]), "60ms");
    /// assert_eq!(utils::format_latency(&[]), "n/a");
    /// ```
    pub fn format_latency(samples_ms: &[u64]) -> String {
        if samples_ms.is_empty() {
            return "n/a".to_string();
        }
        let mean = samples_ms.iter().sum::<u64>() / samples_ms.len() as u64;
        format_duration(Duration::from_millis(mean))
    }
}

/// Tests d'intégration du crate complet
#[cfg(test)]
mod integration_tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_initial_failures() {
        let connector = SimulatedConnector::failing_first(2);
        let (session, mut events) =
            TransportSession::new(NetworkConfig::test_config(), Arc::new(connector.clone())).spawn();

        session.connect().unwrap();
        let mut state = session.subscribe();
        state.wait_for(|s| s.status.is_open()).await.unwrap();

        // Première ouverture + deux reconnexions (1s puis 2s)
        let attempts = connector.connect_attempts();
        assert_eq!(attempts.len(), 3);
        assert_eq!(attempts[2] - attempts[0], Duration::from_secs(3));

        // Ouverture après des tentatives en échec : avis de reconnexion
        assert_eq!(events.try_recv().unwrap(), SessionEvent::Notice(SessionNotice::Reconnected));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_error_types() {
        let lost = NetworkError::connection_lost(1011, "erreur serveur");
        assert!(lost.requires_reconnection());
        assert!(NetworkError::WebSocket("reset".to_string()).requires_reconnection());
        assert!(!NetworkError::NotConnected.requires_reconnection());
        assert!(!NetworkError::InvalidUrl("ftp://x".to_string()).requires_reconnection());
    }

    #[test]
    fn test_utility_functions() {
        assert_eq!(utils::format_duration(Duration::from_millis(1500)), "1.50s");
        assert_eq!(utils::format_latency(&[400, 500]), "450ms");
    }
}
