//! Implémentations du transport
//!
//! - `WsConnector` : WebSocket réel (tokio-tungstenite), authentifié par clé d'API
//! - `SimulatedConnector` : connexion en mémoire scriptée, pour les tests
//!   et le développement sans réseau

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, trace};

use crate::error::{NetworkError, NetworkResult};
use crate::traits::{CLOSE_ABNORMAL, Connection, Connector, Frame, FrameSink, FrameStream};
use crate::types::NetworkConfig;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connecteur WebSocket vers le service temps réel
///
/// Envoie `Authorization: Bearer <clé>` et `OpenAI-Beta: realtime=v1`.
#[derive(Clone, Debug)]
pub struct WsConnector {
    config: NetworkConfig,
}

impl WsConnector {
    pub fn new(config: NetworkConfig) -> Self {
        Self { config }
    }

    /// Construit la requête d'ouverture avec ses en-têtes
    fn build_request(
        &self,
        url: &str,
    ) -> NetworkResult<tokio_tungstenite::tungstenite::handshake::client::Request> {
        let mut request = url
            .into_client_request()
            .map_err(|e| NetworkError::InvalidUrl(format!("{}: {}", url, e)))?;

        let headers = request.headers_mut();
        if let Some(key) = &self.config.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {}", key))
                .map_err(|_| NetworkError::ConfigError("clé d'API invalide".to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }
        headers.insert("openai-beta", HeaderValue::from_static("realtime=v1"));

        Ok(request)
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> NetworkResult<Connection> {
        let url = self.config.endpoint();
        let request = self.build_request(&url)?;
        let timeout = self.config.connection_timeout;

        let (socket, response) = tokio::time::timeout(timeout, connect_async(request))
            .await
            .map_err(|_| NetworkError::ConnectionTimeout {
                url: url.clone(),
                timeout_ms: timeout.as_millis() as u64,
            })?
            .map_err(|e| NetworkError::connection_failed(&url, e))?;

        debug!(status = %response.status(), url = %url, "websocket ouvert");

        let (sink, stream) = socket.split();
        Ok(Connection {
            sink: Box::new(WsSink { sink }),
            stream: Box::new(WsFrames { stream }),
        })
    }

    fn target(&self) -> String {
        self.config.endpoint()
    }
}

struct WsSink {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_text(&mut self, text: String) -> NetworkResult<()> {
        self.sink.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn close(&mut self, code: u16) -> NetworkResult<()> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: "".into(),
        };
        self.sink.send(Message::Close(Some(frame))).await?;
        self.sink.close().await?;
        Ok(())
    }
}

struct WsFrames {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl FrameStream for WsFrames {
    async fn next_frame(&mut self) -> Option<NetworkResult<Frame>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(e.into())),
            };

            match message {
                Message::Text(text) => return Some(Ok(Frame::Text(text))),
                Message::Close(frame) => {
                    let (code, reason) = match frame {
                        Some(frame) => (Some(u16::from(frame.code)), frame.reason.to_string()),
                        None => (None, String::new()),
                    };
                    return Some(Ok(Frame::Close { code, reason }));
                }
                Message::Binary(bytes) => {
                    debug!(len = bytes.len(), "trame binaire ignorée");
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {
                    trace!("trame de contrôle");
                }
            }
        }
    }
}

type ServerSender = mpsc::UnboundedSender<NetworkResult<Frame>>;

#[derive(Default)]
struct SimulatedState {
    /// Toutes les ouvertures échouent
    always_fail: bool,

    /// Nombre d'ouvertures qui échoueront encore
    failures_remaining: usize,

    /// Durée d'ouverture fixe
    open_latency: Duration,

    /// Durée d'ouverture aléatoire (min, max) en ms, prioritaire si définie
    latency_range_ms: Option<(u64, u64)>,

    /// Instants de chaque tentative d'ouverture
    attempts: Vec<Instant>,

    /// Trames texte envoyées par le client, toutes connexions confondues
    sent: Vec<String>,

    /// Codes de fermeture envoyés par le client
    close_codes: Vec<u16>,

    /// La fermeture ne se termine jamais (pair muet)
    close_hangs: bool,

    /// Côté serveur de la connexion courante
    server: Option<ServerSender>,
}

/// Connecteur simulé, entièrement en mémoire
///
/// Les clones partagent le même état : le test garde un clone pour jouer le
/// rôle du serveur (`push_text`, `drop_connection`) et inspecter ce que le
/// client a envoyé.
///
/// # Example
/// ```rust
/// use network::SimulatedConnector;
///
/// let connector = SimulatedConnector::failing_first(2);
/// assert!(connector.connect_attempts().is_empty());
/// ```
#[derive(Clone, Default)]
pub struct SimulatedConnector {
    state: Arc<Mutex<SimulatedState>>,
}

impl SimulatedConnector {
    /// Ouvertures instantanées et toujours réussies
    pub fn new() -> Self {
        Self::default()
    }

    /// Ouvertures toujours en échec
    pub fn always_failing() -> Self {
        let connector = Self::default();
        connector.with_state(|state| state.always_fail = true);
        connector
    }

    /// Les `count` premières ouvertures échouent
    pub fn failing_first(count: usize) -> Self {
        let connector = Self::default();
        connector.with_state(|state| state.failures_remaining = count);
        connector
    }

    /// Durée fixe de chaque ouverture
    pub fn with_open_latency(self, latency: Duration) -> Self {
        self.with_state(|state| state.open_latency = latency);
        self
    }

    /// Durée d'ouverture tirée au hasard entre `min_ms` et `max_ms`
    pub fn with_random_latency(self, min_ms: u64, max_ms: u64) -> Self {
        self.with_state(|state| state.latency_range_ms = Some((min_ms, max_ms.max(min_ms))));
        self
    }

    /// Le serveur n'acquitte jamais la fermeture
    pub fn with_hanging_close(self) -> Self {
        self.with_state(|state| state.close_hangs = true);
        self
    }

    /// Fait échouer (ou réussir) les prochaines ouvertures
    pub fn set_failing(&self, failing: bool) {
        self.with_state(|state| state.always_fail = failing);
    }

    /// Envoie une trame texte au client sur la connexion courante
    ///
    /// Retourne `false` s'il n'y a pas de connexion ouverte.
    pub fn push_text(&self, text: impl Into<String>) -> bool {
        let text = text.into();
        self.with_state(|state| match &state.server {
            Some(server) => server.send(Ok(Frame::Text(text))).is_ok(),
            None => false,
        })
    }

    /// Envoie un message JSON au client
    pub fn push_event(&self, event: serde_json::Value) -> bool {
        self.push_text(event.to_string())
    }

    /// Coupe la connexion courante côté serveur
    ///
    /// `Some(code)` envoie une trame de fermeture, `None` termine le flux
    /// sans trame (coupure réseau).
    pub fn drop_connection(&self, code: Option<u16>) {
        self.with_state(|state| {
            if let Some(server) = state.server.take() {
                if let Some(code) = code {
                    let _ = server.send(Ok(Frame::Close {
                        code: Some(code),
                        reason: "fermeture serveur".to_string(),
                    }));
                }
            }
        });
    }

    /// Termine la connexion courante sur une erreur de flux
    pub fn fail_stream(&self, message: &str) {
        self.with_state(|state| {
            if let Some(server) = state.server.take() {
                let _ = server.send(Err(NetworkError::WebSocket(message.to_string())));
            }
        });
    }

    pub fn connect_attempts(&self) -> Vec<Instant> {
        self.with_state(|state| state.attempts.clone())
    }

    pub fn sent_messages(&self) -> Vec<String> {
        self.with_state(|state| state.sent.clone())
    }

    /// Valeur du champ `type` de chaque message envoyé
    pub fn sent_types(&self) -> Vec<String> {
        self.sent_messages()
            .iter()
            .filter_map(|text| serde_json::from_str::<serde_json::Value>(text).ok())
            .filter_map(|value| value["type"].as_str().map(str::to_string))
            .collect()
    }

    pub fn close_codes(&self) -> Vec<u16> {
        self.with_state(|state| state.close_codes.clone())
    }

    pub fn is_connected(&self) -> bool {
        self.with_state(|state| state.server.as_ref().is_some_and(|server| !server.is_closed()))
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut SimulatedState) -> R) -> R {
        match self.state.lock() {
            Ok(mut state) => f(&mut state),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

#[async_trait]
impl Connector for SimulatedConnector {
    async fn connect(&self) -> NetworkResult<Connection> {
        let (fail, latency) = self.with_state(|state| {
            state.attempts.push(Instant::now());

            let fail = if state.always_fail {
                true
            } else if state.failures_remaining > 0 {
                state.failures_remaining -= 1;
                true
            } else {
                false
            };

            let latency = match state.latency_range_ms {
                Some((min, max)) => Duration::from_millis(fastrand::u64(min..=max)),
                None => state.open_latency,
            };
            (fail, latency)
        });

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if fail {
            return Err(NetworkError::connection_failed("sim://realtime", "refus simulé"));
        }

        let (server, client) = mpsc::unbounded_channel();
        let weak = server.downgrade();
        self.with_state(|state| state.server = Some(server));
        info!(latency_ms = latency.as_millis() as u64, "connexion simulée ouverte");

        Ok(Connection {
            sink: Box::new(SimulatedSink {
                connector: self.clone(),
                server: weak,
            }),
            stream: Box::new(SimulatedFrames { frames: client }),
        })
    }

    fn target(&self) -> String {
        "sim://realtime".to_string()
    }
}

struct SimulatedSink {
    connector: SimulatedConnector,
    server: mpsc::WeakUnboundedSender<NetworkResult<Frame>>,
}

#[async_trait]
impl FrameSink for SimulatedSink {
    async fn send_text(&mut self, text: String) -> NetworkResult<()> {
        if self.server.upgrade().is_none() {
            return Err(NetworkError::connection_lost(CLOSE_ABNORMAL, "connexion simulée coupée"));
        }
        self.connector.with_state(|state| state.sent.push(text));
        Ok(())
    }

    async fn close(&mut self, code: u16) -> NetworkResult<()> {
        let server = self.server.upgrade();
        let hangs = self.connector.with_state(|state| {
            state.close_codes.push(code);
            let current = match (&state.server, &server) {
                (Some(current), Some(ours)) => current.same_channel(ours),
                _ => false,
            };
            if current {
                state.server = None;
            }
            state.close_hangs
        });
        if hangs {
            std::future::pending::<()>().await;
        }
        if let Some(server) = server {
            let _ = server.send(Ok(Frame::Close {
                code: Some(code),
                reason: String::new(),
            }));
        }
        Ok(())
    }
}

struct SimulatedFrames {
    frames: mpsc::UnboundedReceiver<NetworkResult<Frame>>,
}

#[async_trait]
impl FrameStream for SimulatedFrames {
    async fn next_frame(&mut self) -> Option<NetworkResult<Frame>> {
        self.frames.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::CLOSE_NORMAL;

    #[tokio::test]
    async fn test_simulated_round_trip() {
        let connector = SimulatedConnector::new();
        let mut connection = connector.connect().await.unwrap();
        assert!(connector.is_connected());

        connection.sink.send_text("{\"type\":\"ping\"}".to_string()).await.unwrap();
        assert_eq!(connector.sent_types(), vec!["ping"]);

        assert!(connector.push_text("bonjour"));
        assert_eq!(
            connection.stream.next_frame().await.unwrap().unwrap(),
            Frame::Text("bonjour".to_string())
        );
    }

    #[tokio::test]
    async fn test_simulated_failures() {
        let connector = SimulatedConnector::failing_first(1);

        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_ok());
        assert_eq!(connector.connect_attempts().len(), 2);

        connector.set_failing(true);
        assert!(connector.connect().await.is_err());
    }

    #[tokio::test]
    async fn test_simulated_drop_without_close_frame() {
        let connector = SimulatedConnector::new();
        let mut connection = connector.connect().await.unwrap();

        connector.drop_connection(None);
        assert!(connection.stream.next_frame().await.is_none());
        assert!(connection.sink.send_text("x".to_string()).await.is_err());
    }

    #[tokio::test]
    async fn test_simulated_client_close() {
        let connector = SimulatedConnector::new();
        let mut connection = connector.connect().await.unwrap();

        connection.sink.close(CLOSE_NORMAL).await.unwrap();
        assert_eq!(connector.close_codes(), vec![CLOSE_NORMAL]);
        assert!(!connector.is_connected());
        assert_eq!(
            connection.stream.next_frame().await.unwrap().unwrap(),
            Frame::Close { code: Some(CLOSE_NORMAL), reason: String::new() }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_random_latency() {
        let connector = SimulatedConnector::new().with_random_latency(50, 80);
        let started = Instant::now();
        connector.connect().await.unwrap();

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed <= Duration::from_millis(81));
    }

    #[test]
    fn test_ws_request_headers() {
        let mut config = NetworkConfig::default();
        config.api_key = Some("sk-test".to_string());
        let connector = WsConnector::new(config);

        let request = connector.build_request(&connector.target()).unwrap();
        assert_eq!(request.headers()[AUTHORIZATION], "Bearer sk-test");
        assert_eq!(request.headers()["openai-beta"], "realtime=v1");
        assert!(request.uri().to_string().contains("model=gpt-4o-realtime-preview"));
    }

    #[test]
    fn test_ws_request_rejects_bad_url() {
        let connector = WsConnector::new(NetworkConfig::default());
        assert!(matches!(
            connector.build_request("pas une url"),
            Err(NetworkError::InvalidUrl(_))
        ));
    }
}
