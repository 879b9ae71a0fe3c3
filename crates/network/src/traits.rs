//! Traits abstraits pour le transport réseau
//!
//! Une connexion est coupée en deux moitiés indépendantes :
//! - `FrameSink` : envoi de trames texte, fermeture
//! - `FrameStream` : réception des trames, lue par une tâche dédiée
//!
//! La session garde la moitié émettrice et confie la moitié réceptrice à un
//! lecteur qui lui renvoie les trames par canal. Le WebSocket réel
//! (`WsConnector`) et le simulateur (`SimulatedConnector`) implémentent
//! les mêmes traits.

use async_trait::async_trait;

use crate::error::NetworkResult;

/// Code de fermeture normale (RFC 6455)
pub const CLOSE_NORMAL: u16 = 1000;

/// Code utilisé quand le flux se termine sans trame de fermeture
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Trame reçue, réduite à ce qui intéresse la session
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// Trame texte (un message JSON)
    Text(String),
    /// Trame de fermeture, `code` absent si le pair n'en a pas donné
    Close { code: Option<u16>, reason: String },
}

/// Moitié émettrice d'une connexion
#[async_trait]
pub trait FrameSink: Send {
    /// Envoie une trame texte
    async fn send_text(&mut self, text: String) -> NetworkResult<()>;

    /// Ferme la connexion avec le code donné
    async fn close(&mut self, code: u16) -> NetworkResult<()>;
}

/// Moitié réceptrice d'une connexion
#[async_trait]
pub trait FrameStream: Send {
    /// Prochaine trame utile
    ///
    /// `None` : le flux est terminé (sans trame de fermeture s'il n'y en a
    /// pas eu avant).
    async fn next_frame(&mut self) -> Option<NetworkResult<Frame>>;
}

/// Connexion ouverte, coupée en deux moitiés
pub struct Connection {
    pub sink: Box<dyn FrameSink>,
    pub stream: Box<dyn FrameStream>,
}

/// Ouvre des connexions vers le service
///
/// `Send + Sync` : partagé entre la session et ses tâches d'ouverture.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> NetworkResult<Connection>;

    /// Description de la cible, pour les logs
    fn target(&self) -> String {
        "cible inconnue".to_string()
    }
}
