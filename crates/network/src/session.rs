//! Session temps réel avec le service de conversation vocale
//!
//! `TransportSession` est une tâche unique qui possède tout l'état de la
//! connexion. Le reste de l'application lui parle via un `SessionHandle`
//! clonable (commandes par canal) et l'écoute via :
//! - un canal `watch` pour l'état de connexion
//! - un canal d'événements (`SessionEvent`) pour les transcriptions,
//!   les appels d'outils et les notifications
//!
//! La boucle de la tâche attend à la fois les commandes, les trames reçues,
//! le minuteur de reconnexion et le minuteur de qualité. Chaque ouverture
//! reçoit un numéro de génération : les trames et résultats d'une génération
//! périmée sont ignorés.

use std::sync::Arc;
use std::time::Duration;

use audio::{AudioConfig, AudioStats, PlaybackQueue, SinkFactory, WireFrame};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, sleep_until, timeout};
use tracing::{debug, error, info, trace, warn};

use crate::error::{NetworkError, NetworkResult, TransportErrorKind};
use crate::protocol::{ClientEvent, ServerEvent};
use crate::traits::{CLOSE_ABNORMAL, CLOSE_NORMAL, Connection, Connector, Frame, FrameSink, FrameStream};
use crate::types::{
    CloseReason, ConnectionState, ConnectionStatus, LatencyWindow, NetworkConfig, SessionEvent,
    SessionNotice,
};

/// Code de fermeture quand le pair n'en donne pas (RFC 6455)
const CLOSE_NO_STATUS: u16 = 1005;

/// Commandes envoyées par les `SessionHandle`
enum Command {
    Connect,
    Disconnect { reply: oneshot::Sender<()> },
    SendAudio(WireFrame),
    SendText { text: String, reply: oneshot::Sender<NetworkResult<()>> },
    SendFunctionOutput {
        call_id: String,
        output: String,
        reply: oneshot::Sender<NetworkResult<()>>,
    },
    PlaybackStats { reply: oneshot::Sender<Option<AudioStats>> },
    Shutdown,
}

/// Messages internes renvoyés par les tâches d'ouverture et de lecture
enum Internal {
    Opened {
        generation: u64,
        latency: Duration,
        result: NetworkResult<Connection>,
    },
    Frame {
        generation: u64,
        frame: Option<NetworkResult<Frame>>,
    },
}

/// Poignée clonable vers la session
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl SessionHandle {
    /// Demande l'ouverture de la connexion
    ///
    /// Sans effet si la connexion est déjà ouverte ou en cours d'ouverture.
    /// Après un échec définitif (`Failed`), relance une série de tentatives.
    pub fn connect(&self) -> NetworkResult<()> {
        self.command(Command::Connect)
    }

    /// Ferme proprement la connexion et annule toute reconnexion prévue
    pub async fn disconnect(&self) -> NetworkResult<()> {
        let (reply, done) = oneshot::channel();
        self.command(Command::Disconnect { reply })?;
        done.await.map_err(|_| NetworkError::SessionClosed)
    }

    /// Envoie un buffer audio encodé
    ///
    /// Non bloquant, appelable depuis le callback de capture. Si la connexion
    /// n'est pas ouverte, le buffer est ignoré.
    pub fn send_audio_chunk(&self, frame: WireFrame) {
        if self.commands.send(Command::SendAudio(frame)).is_err() {
            trace!("session arrêtée, audio ignoré");
        }
    }

    /// Envoie un message texte puis demande une réponse
    ///
    /// # Erreurs
    /// - `NetworkError::NotConnected` : la connexion n'est pas ouverte
    pub async fn send_text(&self, text: impl Into<String>) -> NetworkResult<()> {
        let (reply, done) = oneshot::channel();
        self.command(Command::SendText { text: text.into(), reply })?;
        done.await.map_err(|_| NetworkError::SessionClosed)?
    }

    /// Renvoie le résultat d'un appel d'outil puis demande une réponse
    pub async fn send_function_output(
        &self,
        call_id: impl Into<String>,
        output: impl Into<String>,
    ) -> NetworkResult<()> {
        let (reply, done) = oneshot::channel();
        self.command(Command::SendFunctionOutput {
            call_id: call_id.into(),
            output: output.into(),
            reply,
        })?;
        done.await.map_err(|_| NetworkError::SessionClosed)?
    }

    /// Statistiques de la file de lecture, si elle existe
    pub async fn playback_stats(&self) -> Option<AudioStats> {
        let (reply, done) = oneshot::channel();
        self.command(Command::PlaybackStats { reply }).ok()?;
        done.await.ok().flatten()
    }

    /// Arrête la tâche de session
    pub fn shutdown(&self) {
        let _ = self.command(Command::Shutdown);
    }

    /// Copie de l'état courant
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn is_open(&self) -> bool {
        self.state.borrow().status.is_open()
    }

    /// Abonnement aux changements d'état
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    fn command(&self, command: Command) -> NetworkResult<()> {
        self.commands
            .send(command)
            .map_err(|_| NetworkError::SessionClosed)
    }
}

/// Paramètres de construction de la session
pub struct TransportSession {
    config: NetworkConfig,
    connector: Arc<dyn Connector>,
    sink_factory: Option<Arc<dyn SinkFactory>>,
    audio_config: AudioConfig,
}

impl TransportSession {
    pub fn new(config: NetworkConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            sink_factory: None,
            audio_config: AudioConfig::default(),
        }
    }

    /// Sortie audio pour les réponses, créée à la première ouverture
    pub fn with_audio_output(mut self, factory: Arc<dyn SinkFactory>, audio_config: AudioConfig) -> Self {
        self.sink_factory = Some(factory);
        self.audio_config = audio_config;
        self
    }

    /// Lance la tâche de session
    ///
    /// Doit être appelé depuis un runtime tokio.
    pub fn spawn(self) -> (SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::default());

        let actor = SessionActor {
            latency: LatencyWindow::new(self.config.latency_window),
            config: self.config,
            connector: self.connector,
            sink_factory: self.sink_factory,
            audio_config: self.audio_config,
            commands,
            internal_tx,
            internal_rx,
            events: events_tx,
            state: state_tx,
            sink: None,
            reader: None,
            connecting: None,
            generation: 0,
            attempt: 0,
            reconnect_at: None,
            attempts_started: 0,
            playback: None,
        };
        tokio::spawn(actor.run());

        (SessionHandle { commands: commands_tx, state }, events)
    }
}

/// État possédé par la tâche de session
struct SessionActor {
    config: NetworkConfig,
    connector: Arc<dyn Connector>,
    sink_factory: Option<Arc<dyn SinkFactory>>,
    audio_config: AudioConfig,

    commands: mpsc::UnboundedReceiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    events: mpsc::UnboundedSender<SessionEvent>,
    state: watch::Sender<ConnectionState>,

    /// Moitié émettrice de la connexion ouverte
    sink: Option<Box<dyn FrameSink>>,
    /// Tâche de lecture de la connexion ouverte
    reader: Option<JoinHandle<()>>,
    /// Tâche d'ouverture en cours
    connecting: Option<JoinHandle<()>>,

    /// Génération de la connexion courante
    generation: u64,
    /// Tentative de reconnexion en cours (0 = première ouverture)
    attempt: u32,
    /// Échéance de la prochaine tentative
    reconnect_at: Option<Instant>,
    /// Tentatives d'ouverture lancées depuis la création de la session
    attempts_started: u64,

    latency: LatencyWindow,
    playback: Option<PlaybackQueue>,
}

impl SessionActor {
    async fn run(mut self) {
        let mut quality = tokio::time::interval(self.config.quality_interval);
        quality.set_missed_tick_behavior(MissedTickBehavior::Skip);
        quality.tick().await;

        loop {
            let reconnect_at = self.reconnect_at;

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(message) = self.internal_rx.recv() => self.handle_internal(message).await,
                _ = sleep_until(reconnect_at.unwrap_or_else(Instant::now)), if reconnect_at.is_some() => {
                    self.reconnect_at = None;
                    self.begin_connect();
                }
                _ = quality.tick() => self.refresh_quality(),
            }
        }

        self.close_connection().await;
        debug!("tâche de session terminée");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.connect(),
            Command::Disconnect { reply } => {
                self.disconnect().await;
                let _ = reply.send(());
            }
            Command::SendAudio(frame) => self.send_audio(frame).await,
            Command::SendText { text, reply } => {
                let result = self.send_text(text).await;
                let _ = reply.send(result);
            }
            Command::SendFunctionOutput { call_id, output, reply } => {
                let result = self.send_pair(ClientEvent::function_output(call_id, output)).await;
                let _ = reply.send(result);
            }
            Command::PlaybackStats { reply } => {
                let _ = reply.send(self.playback.as_ref().map(PlaybackQueue::stats));
            }
            Command::Shutdown => {}
        }
    }

    async fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::Opened { generation, latency, result } => {
                if generation != self.generation {
                    trace!(generation, "ouverture périmée");
                    if let Ok(mut connection) = result {
                        tokio::spawn(async move {
                            let _ = connection.sink.close(CLOSE_NORMAL).await;
                        });
                    }
                    return;
                }
                self.connecting = None;

                match result {
                    Ok(connection) => self.on_open(connection, latency).await,
                    Err(e) => {
                        warn!(error = %e, attempt = self.attempt, "échec d'ouverture");
                        self.set_status(ConnectionStatus::Closed(CloseReason::ConnectFailed(e.to_string())));
                        self.schedule_reconnect();
                    }
                }
            }
            Internal::Frame { generation, frame } => {
                if generation != self.generation {
                    trace!(generation, "trame périmée ignorée");
                    return;
                }

                match frame {
                    Some(Ok(Frame::Text(text))) => self.dispatch(&text).await,
                    Some(Ok(Frame::Close { code, reason })) => {
                        let code = code.unwrap_or(CLOSE_NO_STATUS);
                        if code == CLOSE_NORMAL {
                            info!("connexion fermée par le service");
                            self.drop_connection();
                            self.set_status(ConnectionStatus::Closed(CloseReason::Normal));
                        } else {
                            self.connection_error(&NetworkError::connection_lost(code, reason));
                        }
                    }
                    Some(Err(e)) => self.connection_error(&e),
                    None => self.connection_error(&NetworkError::connection_lost(
                        CLOSE_ABNORMAL,
                        "flux terminé sans trame de fermeture",
                    )),
                }
            }
        }
    }

    fn connect(&mut self) {
        let status = self.state.borrow().status.clone();
        if status.is_open() || status.is_connecting() {
            debug!(status = %status, "connexion déjà active");
            return;
        }

        self.attempt = 0;
        self.reconnect_at = None;
        self.begin_connect();
    }

    /// Lance une tentative d'ouverture dans une tâche séparée
    fn begin_connect(&mut self) {
        self.generation += 1;
        self.attempts_started += 1;
        let generation = self.generation;
        self.set_status(ConnectionStatus::Connecting { attempt: self.attempt });
        info!(url = %self.connector.target(), attempt = self.attempt, "ouverture de la connexion");

        let connector = Arc::clone(&self.connector);
        let internal = self.internal_tx.clone();
        self.connecting = Some(tokio::spawn(async move {
            let started = Instant::now();
            let result = connector.connect().await;
            let _ = internal.send(Internal::Opened {
                generation,
                latency: started.elapsed(),
                result,
            });
        }));
    }

    async fn on_open(&mut self, connection: Connection, latency: Duration) {
        self.latency.push(latency);
        self.sink = Some(connection.sink);
        self.reader = Some(spawn_reader(connection.stream, self.generation, self.internal_tx.clone()));

        let reconnected = self.attempts_started > 1;
        self.attempt = 0;
        self.ensure_playback();
        self.set_status(ConnectionStatus::Open);

        info!(latency_ms = latency.as_millis() as u64, reconnected, "connexion ouverte");
        if reconnected {
            self.emit(SessionEvent::Notice(SessionNotice::Reconnected));
        }

        let update = ClientEvent::SessionUpdate { session: self.config.session.clone() };
        if let Err(e) = self.send_event(&update).await {
            warn!(error = %e, "session.update non envoyé");
        }
    }

    /// Crée la file de lecture à la première ouverture
    fn ensure_playback(&mut self) {
        if self.playback.is_some() {
            return;
        }
        let Some(factory) = &self.sink_factory else {
            return;
        };

        match factory.create() {
            Ok(sink) => self.playback = Some(PlaybackQueue::new(sink, &self.audio_config)),
            Err(e) => warn!(error = %e, "sortie audio indisponible, réponses audio ignorées"),
        }
    }

    async fn disconnect(&mut self) {
        self.reconnect_at = None;
        self.close_connection().await;
        self.attempt = 0;
        self.latency.clear();
        self.state.send_replace(ConnectionState::default());
        info!("déconnecté");
    }

    /// Ferme proprement la connexion courante et invalide sa génération
    async fn close_connection(&mut self) {
        if let Some(task) = self.connecting.take() {
            task.abort();
        }
        self.generation += 1;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(mut sink) = self.sink.take() {
            match timeout(self.config.connection_timeout, sink.close(CLOSE_NORMAL)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "fermeture de la connexion"),
                Err(_) => warn!(
                    timeout_ms = self.config.connection_timeout.as_millis() as u64,
                    "fermeture non acquittée, connexion abandonnée"
                ),
            }
        }
    }

    /// Abandonne la connexion courante sans attendre
    fn drop_connection(&mut self) {
        self.generation += 1;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(mut sink) = self.sink.take() {
            let limit = self.config.connection_timeout;
            tokio::spawn(async move {
                let _ = timeout(limit, sink.close(CLOSE_NORMAL)).await;
            });
        }
    }

    /// Traite une erreur survenue sur la connexion ouverte
    ///
    /// Les erreurs qui exigent une reconnexion abandonnent la connexion et
    /// planifient une tentative. Les autres deviennent un avis.
    fn connection_error(&mut self, failure: &NetworkError) {
        if !failure.requires_reconnection() {
            warn!(error = %failure, "erreur du service");
            self.emit(SessionEvent::Notice(notice_for(failure)));
            return;
        }

        let reason = match failure {
            NetworkError::ConnectionLost { code, .. } => CloseReason::Abnormal { code: *code },
            NetworkError::Transport { .. } => CloseReason::ServiceUnavailable,
            _ => CloseReason::Abnormal { code: CLOSE_ABNORMAL },
        };
        warn!(error = %failure, "connexion perdue");
        self.drop_connection();
        self.set_status(ConnectionStatus::Closed(reason));
        self.schedule_reconnect();
    }

    /// Planifie la prochaine tentative, ou abandonne si le budget est épuisé
    fn schedule_reconnect(&mut self) {
        if self.attempt >= self.config.max_retry_attempts {
            error!(attempts = self.attempt, "reconnexion abandonnée");
            self.reconnect_at = None;
            self.set_status(ConnectionStatus::Failed);
            self.emit(SessionEvent::Notice(SessionNotice::ReconnectManually));
            return;
        }

        self.attempt += 1;
        let delay = self.config.next_delay(self.attempt);
        info!(attempt = self.attempt, delay_ms = delay.as_millis() as u64, "reconnexion planifiée");
        self.reconnect_at = Some(Instant::now() + delay);
    }

    /// Aiguille un message reçu
    async fn dispatch(&mut self, text: &str) {
        let event = match ServerEvent::parse(text) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "message illisible ignoré");
                return;
            }
        };

        match event {
            ServerEvent::AudioDelta { delta } => self.play(delta),
            ServerEvent::TranscriptDelta { delta } => self.emit(SessionEvent::TranscriptDelta(delta)),
            ServerEvent::TranscriptDone { transcript } => {
                self.emit(SessionEvent::TranscriptDone { transcript })
            }
            ServerEvent::ResponseDone { .. } => {
                debug!("réponse terminée");
                self.emit(SessionEvent::ResponseDone);
            }
            ServerEvent::InputTranscriptionCompleted { transcript } => {
                self.emit(SessionEvent::UserTranscript(transcript))
            }
            ServerEvent::FunctionCallArgumentsDone { call_id, name, arguments } => {
                info!(name = %name, call_id = %call_id, "appel d'outil demandé");
                self.emit(SessionEvent::FunctionCall { call_id, name, arguments });
            }
            ServerEvent::SessionCreated { .. } => debug!("session créée"),
            ServerEvent::SessionUpdated { .. } => debug!("session mise à jour"),
            ServerEvent::Error { error } => {
                debug!(code = ?error.code, "message d'erreur reçu");
                self.connection_error(&NetworkError::transport(error.kind(), error.describe()));
            }
            ServerEvent::Other => trace!("message ignoré"),
        }
    }

    fn play(&mut self, payload: String) {
        match &self.playback {
            Some(queue) => {
                if let Err(e) = queue.enqueue(payload) {
                    warn!(error = %e, "fragment audio perdu");
                }
            }
            None => debug!("aucune sortie audio, fragment ignoré"),
        }
    }

    async fn send_audio(&mut self, frame: WireFrame) {
        if !self.is_open() {
            debug!(samples = frame.sample_count, "connexion fermée, audio ignoré");
            return;
        }
        let event = ClientEvent::InputAudioBufferAppend { audio: frame.audio };
        if let Err(e) = self.send_event(&event).await {
            debug!(error = %e, "audio non envoyé");
        }
    }

    async fn send_text(&mut self, text: String) -> NetworkResult<()> {
        self.send_pair(ClientEvent::user_text(text)).await
    }

    /// Envoie un élément de conversation suivi de `response.create`
    async fn send_pair(&mut self, item: ClientEvent) -> NetworkResult<()> {
        self.send_event(&item).await?;
        self.send_event(&ClientEvent::ResponseCreate).await
    }

    async fn send_event(&mut self, event: &ClientEvent) -> NetworkResult<()> {
        if !self.is_open() {
            return Err(NetworkError::NotConnected);
        }
        let Some(sink) = self.sink.as_mut() else {
            return Err(NetworkError::NotConnected);
        };

        let text = event.to_json()?;
        match sink.send_text(text).await {
            Ok(()) => {
                trace!(kind = event.kind(), "message envoyé");
                Ok(())
            }
            Err(e) => {
                if e.requires_reconnection() {
                    self.connection_error(&e);
                }
                Err(e)
            }
        }
    }

    /// Recalcule la qualité à partir des dernières latences
    fn refresh_quality(&mut self) {
        if !self.is_open() {
            return;
        }
        let quality = self.latency.quality();
        let samples = self.latency.samples();
        self.state.send_if_modified(|state| {
            let changed = state.quality != quality || state.latency_samples != samples;
            state.quality = quality;
            state.latency_samples = samples;
            changed
        });
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        let samples = self.latency.samples();
        self.state.send_modify(|state| {
            state.status = status;
            state.latency_samples = samples;
        });
    }

    fn is_open(&self) -> bool {
        self.state.borrow().status.is_open()
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            trace!("aucun abonné aux événements de session");
        }
    }
}

/// Avis présenté pour une erreur qui ne coupe pas la connexion
fn notice_for(failure: &NetworkError) -> SessionNotice {
    match failure {
        NetworkError::Transport { kind: TransportErrorKind::RateLimited, message } => {
            SessionNotice::RateLimited(message.clone())
        }
        NetworkError::Transport { message, .. } => SessionNotice::ConnectionError(message.clone()),
        other => SessionNotice::ConnectionError(other.to_string()),
    }
}

/// Lit les trames d'une connexion et les renvoie à la session
fn spawn_reader(
    mut stream: Box<dyn FrameStream>,
    generation: u64,
    internal: mpsc::UnboundedSender<Internal>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let frame = stream.next_frame().await;
            let last = !matches!(frame, Some(Ok(Frame::Text(_))));
            if internal.send(Internal::Frame { generation, frame }).is_err() || last {
                break;
            }
        }
    })
}
