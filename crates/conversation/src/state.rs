//! État de la conversation vocale
//!
//! `ConversationState` tient le journal des messages, la réponse en cours de
//! transcription et l'enregistrement micro. Il consomme les `SessionEvent`
//! de la session et remonte des `Notice` vers l'interface.
//!
//! Chaque modification du journal est recopiée dans le `HistoryStore`.
//! Les erreurs de persistance sont journalisées puis ignorées : la
//! conversation continue en mémoire.

use audio::{AudioCapture, SampleBuffer, SampleEncoder};
use network::{NetworkError, SessionEvent, SessionHandle, SessionNotice};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::{ConversationError, ConversationResult};
use crate::message::ConversationMessage;
use crate::store::HistoryStore;
use crate::tools::ToolRegistry;

/// Notification destinée à l'interface
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notice {
    /// Notification remontée par la session
    Session(SessionNotice),
    /// Le micro n'a pas pu être ouvert
    MicrophoneUnavailable(String),
    /// Action impossible sans connexion ouverte
    NotConnected,
}

impl Notice {
    pub fn message(&self) -> String {
        match self {
            Notice::Session(notice) => notice.message(),
            Notice::MicrophoneUnavailable(reason) => {
                format!("Impossible d'accéder au microphone ({}). Vérifiez les permissions.", reason)
            }
            Notice::NotConnected => "Non connecté au service vocal.".to_string(),
        }
    }
}

pub struct ConversationState {
    messages: Vec<ConversationMessage>,
    /// Réponse de l'assistant en cours de transcription
    pending: Option<ConversationMessage>,
    store: Box<dyn HistoryStore>,
    session: SessionHandle,
    capture: Box<dyn AudioCapture>,
    tools: ToolRegistry,
    notices: mpsc::UnboundedSender<Notice>,
}

impl ConversationState {
    /// Crée l'état et recharge l'historique enregistré
    ///
    /// Un historique illisible donne un journal vide.
    pub fn new(
        session: SessionHandle,
        capture: Box<dyn AudioCapture>,
        store: Box<dyn HistoryStore>,
    ) -> (Self, mpsc::UnboundedReceiver<Notice>) {
        let (notices, notices_rx) = mpsc::unbounded_channel();
        let messages = restore(store.as_ref());

        let state = Self {
            messages,
            pending: None,
            store,
            session,
            capture,
            tools: ToolRegistry::new(),
            notices,
        };
        (state, notices_rx)
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    /// Journal finalisé, dans l'ordre
    pub fn messages(&self) -> &[ConversationMessage] {
        &self.messages
    }

    /// Transcription partielle de la réponse en cours
    pub fn current_transcript(&self) -> Option<&str> {
        self.pending.as_ref().map(|message| message.content.as_str())
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    pub fn is_recording(&self) -> bool {
        self.capture.is_recording()
    }

    /// Niveau du micro (0-100) pendant l'enregistrement
    pub fn level(&self) -> Option<watch::Receiver<u8>> {
        self.capture.level()
    }

    /// Envoie un message texte
    ///
    /// Le message n'entre dans le journal qu'une fois envoyé.
    pub async fn send_text(&mut self, text: &str) -> ConversationResult<()> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }

        match self.session.send_text(text).await {
            Ok(()) => {
                self.push(ConversationMessage::user(text));
                Ok(())
            }
            Err(NetworkError::NotConnected) => {
                self.notify(Notice::NotConnected);
                Err(NetworkError::NotConnected.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Démarre l'envoi du micro vers la session
    ///
    /// # Erreurs
    /// - `AudioError::CaptureUnavailable` : micro absent ou refusé, signalé
    ///   aussi par `Notice::MicrophoneUnavailable`
    pub async fn start_recording(&mut self) -> ConversationResult<()> {
        if self.capture.is_recording() {
            debug!("enregistrement déjà actif");
            return Ok(());
        }

        let session = self.session.clone();
        let encoder = SampleEncoder::new();
        let on_buffer = Box::new(move |buffer: SampleBuffer| match encoder.encode(&buffer) {
            Ok(frame) => session.send_audio_chunk(frame),
            Err(e) => warn!(error = %e, "buffer micro ignoré"),
        });

        if let Err(e) = self.capture.start(on_buffer).await {
            warn!(error = %e, "micro indisponible");
            self.notify(Notice::MicrophoneUnavailable(e.to_string()));
            return Err(e.into());
        }

        info!(device = %self.capture.device_info(), "enregistrement démarré");
        Ok(())
    }

    pub async fn stop_recording(&mut self) -> ConversationResult<()> {
        self.capture.stop().await?;
        info!("enregistrement arrêté");
        Ok(())
    }

    /// Vide le journal, en mémoire et sur disque
    pub fn clear_history(&mut self) {
        self.messages.clear();
        self.pending = None;
        if let Err(e) = self.store.clear() {
            warn!(error = %e, "effacement de l'historique impossible");
        }
        info!("historique effacé");
    }

    /// Traite un événement de la session
    pub async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::TranscriptDelta(delta) => {
                self.pending
                    .get_or_insert_with(|| ConversationMessage::assistant_audio(""))
                    .append(&delta);
            }
            SessionEvent::TranscriptDone { .. } => self.finalize(),
            SessionEvent::ResponseDone => self.finalize(),
            SessionEvent::UserTranscript(transcript) => {
                let transcript = transcript.trim();
                if !transcript.is_empty() {
                    let mut message = ConversationMessage::user(transcript);
                    message.is_audio = true;
                    self.push(message);
                }
            }
            SessionEvent::FunctionCall { call_id, name, arguments } => {
                let output = self.tools.dispatch(&name, &arguments).await;
                if let Err(e) = self.session.send_function_output(call_id, output).await {
                    warn!(tool = %name, error = %e, "résultat d'outil non envoyé");
                }
            }
            SessionEvent::Notice(notice) => self.notify(Notice::Session(notice)),
        }
    }

    /// Passe la réponse en cours dans le journal
    ///
    /// Sans réponse en cours, ne fait rien : le texte final d'un `done`
    /// n'est pas repris, seuls les fragments accumulés comptent.
    fn finalize(&mut self) {
        if let Some(message) = self.pending.take() {
            self.push(message);
        }
    }

    fn push(&mut self, message: ConversationMessage) {
        self.messages.push(message);
        self.persist();
    }

    fn persist(&self) {
        if let Err(e) = self.store.save(&self.messages) {
            warn!(error = %e, "historique non enregistré");
        }
    }

    fn notify(&self, notice: Notice) {
        if self.notices.send(notice).is_err() {
            debug!("aucun abonné aux notifications");
        }
    }
}

fn restore(store: &dyn HistoryStore) -> Vec<ConversationMessage> {
    match store.load() {
        Ok(messages) => {
            debug!(count = messages.len(), "historique rechargé");
            messages
        }
        Err(ConversationError::PersistenceCorrupt(reason)) => {
            warn!(reason = %reason, "historique illisible, journal vide");
            Vec::new()
        }
        Err(e) => {
            warn!(error = %e, "historique inaccessible, journal vide");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use audio::{AudioConfig, AudioError, SyntheticCapture};
    use network::{ConnectionStatus, NetworkConfig, SimulatedConnector, TransportSession};
    use serde_json::{Value, json};

    use crate::message::Role;
    use crate::store::{JsonFileStore, MemoryStore};
    use crate::tools::{LOOKUP_MEDICATION, MedicationLookup};

    struct Fixture {
        state: ConversationState,
        notices: mpsc::UnboundedReceiver<Notice>,
        connector: SimulatedConnector,
        store: MemoryStore,
    }

    fn fixture_with(store: MemoryStore, capture: SyntheticCapture) -> Fixture {
        let connector = SimulatedConnector::new();
        let (session, _events) =
            TransportSession::new(NetworkConfig::test_config(), Arc::new(connector.clone())).spawn();
        let (state, notices) = ConversationState::new(session, Box::new(capture), Box::new(store.clone()));
        Fixture { state, notices, connector, store }
    }

    fn fixture() -> Fixture {
        fixture_with(MemoryStore::new(), SyntheticCapture::new(AudioConfig::test_config()))
    }

    async fn open(fixture: &Fixture) {
        fixture.state.session().connect().unwrap();
        fixture
            .state
            .session()
            .subscribe()
            .wait_for(|state| state.status == ConnectionStatus::Open)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_transcript_accumulation() {
        let mut f = fixture();

        f.state.handle_event(SessionEvent::TranscriptDelta("Hel".to_string())).await;
        assert_eq!(f.state.current_transcript(), Some("Hel"));
        f.state.handle_event(SessionEvent::TranscriptDelta("lo".to_string())).await;
        assert_eq!(f.state.current_transcript(), Some("Hello"));
        assert!(f.state.messages().is_empty());

        f.state
            .handle_event(SessionEvent::TranscriptDone { transcript: Some("Hello".to_string()) })
            .await;
        assert_eq!(f.state.current_transcript(), None);
        assert_eq!(f.state.messages().len(), 1);
        assert_eq!(f.state.messages()[0].content, "Hello");
        assert_eq!(f.state.messages()[0].role(), Role::Assistant);
        assert!(f.state.messages()[0].is_audio);

        // Une fin sans réponse en cours ne fait rien
        f.state.handle_event(SessionEvent::TranscriptDone { transcript: None }).await;
        f.state.handle_event(SessionEvent::ResponseDone).await;
        assert_eq!(f.state.messages().len(), 1);

        assert_eq!(f.store.load().unwrap(), f.state.messages());
    }

    #[tokio::test]
    async fn test_done_without_deltas_adds_nothing() {
        let mut f = fixture();

        f.state
            .handle_event(SessionEvent::TranscriptDone { transcript: Some("Bonjour".to_string()) })
            .await;
        assert!(f.state.messages().is_empty());
        assert!(f.store.load().unwrap().is_empty());

        // Seuls les fragments reçus forment le message
        f.state.handle_event(SessionEvent::TranscriptDelta("Bon".to_string())).await;
        f.state
            .handle_event(SessionEvent::TranscriptDone { transcript: Some("Bonjour !".to_string()) })
            .await;
        assert_eq!(f.state.messages().len(), 1);
        assert_eq!(f.state.messages()[0].content, "Bon");
    }

    #[tokio::test]
    async fn test_corrupt_history_starts_empty() {
        let store = MemoryStore::with_raw("{{{ pas du json");
        let mut f = fixture_with(store, SyntheticCapture::new(AudioConfig::test_config()));
        assert!(f.state.messages().is_empty());

        f.state.handle_event(SessionEvent::UserTranscript("Bonjour".to_string())).await;
        assert_eq!(f.state.messages().len(), 1);
        assert_eq!(f.store.load().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_history_restored_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let connector = SimulatedConnector::new();
        let (session, _events) =
            TransportSession::new(NetworkConfig::test_config(), Arc::new(connector)).spawn();
        let capture = || Box::new(SyntheticCapture::new(AudioConfig::test_config()));

        let (mut state, _notices) =
            ConversationState::new(session.clone(), capture(), Box::new(JsonFileStore::in_dir(dir.path())));
        state.handle_event(SessionEvent::UserTranscript("Rappelle-moi à 20h".to_string())).await;
        state.handle_event(SessionEvent::TranscriptDelta("C'est noté.".to_string())).await;
        state.handle_event(SessionEvent::ResponseDone).await;
        let saved = state.messages().to_vec();
        drop(state);

        let (restored, _notices) =
            ConversationState::new(session, capture(), Box::new(JsonFileStore::in_dir(dir.path())));
        assert_eq!(restored.messages(), saved.as_slice());
    }

    #[tokio::test]
    async fn test_clear_history() {
        let mut f = fixture();
        f.state.handle_event(SessionEvent::UserTranscript("Salut".to_string())).await;
        f.state.handle_event(SessionEvent::TranscriptDelta("Bon".to_string())).await;

        f.state.clear_history();
        assert!(f.state.messages().is_empty());
        assert_eq!(f.state.current_transcript(), None);
        assert_eq!(f.store.raw(), None);
    }

    #[tokio::test]
    async fn test_microphone_unavailable() {
        let capture = SyntheticCapture::unavailable(AudioConfig::test_config(), "permission refusée");
        let mut f = fixture_with(MemoryStore::new(), capture);

        let result = f.state.start_recording().await;
        assert!(matches!(
            result,
            Err(ConversationError::Audio(AudioError::CaptureUnavailable(_)))
        ));
        assert!(!f.state.is_recording());
        assert!(matches!(f.notices.try_recv(), Ok(Notice::MicrophoneUnavailable(_))));
    }

    #[tokio::test]
    async fn test_send_text_requires_connection() {
        let mut f = fixture();

        let result = f.state.send_text("Bonjour").await;
        assert!(matches!(result, Err(ConversationError::Network(NetworkError::NotConnected))));
        assert!(f.state.messages().is_empty());
        assert_eq!(f.notices.try_recv().unwrap(), Notice::NotConnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_text_logs_message() {
        let mut f = fixture();
        open(&f).await;

        f.state.send_text("  Ai-je pris mes médicaments ?  ").await.unwrap();
        f.state.send_text("   ").await.unwrap();

        assert_eq!(f.state.messages().len(), 1);
        assert_eq!(f.state.messages()[0].content, "Ai-je pris mes médicaments ?");
        assert_eq!(
            f.connector.sent_types(),
            vec!["session.update", "conversation.item.create", "response.create"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_recording_streams_audio() {
        let mut f = fixture();
        open(&f).await;

        f.state.start_recording().await.unwrap();
        assert!(f.state.is_recording());
        tokio::time::sleep(Duration::from_millis(100)).await;
        f.state.stop_recording().await.unwrap();
        f.state.stop_recording().await.unwrap();
        assert!(!f.state.is_recording());

        let appended = f
            .connector
            .sent_messages()
            .iter()
            .filter_map(|m| serde_json::from_str::<Value>(m).ok())
            .filter(|v| v["type"] == "input_audio_buffer.append")
            .count();
        assert!(appended >= 5, "{} buffers envoyés", appended);

        // Laisse la session vider les buffers déjà reçus
        tokio::time::sleep(Duration::from_millis(10)).await;
        let sent = f.connector.sent_messages().len();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(f.connector.sent_messages().len(), sent);
    }

    struct StaticLookup;

    #[async_trait]
    impl MedicationLookup for StaticLookup {
        async fn lookup_medication(&self, name: &str) -> ConversationResult<Value> {
            Ok(json!({"name": name, "dosage": "500 mg"}))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_function_call_answered() {
        let f = fixture();
        let Fixture { state, connector, .. } = f;
        let mut state = state.with_tools(ToolRegistry::new().with_lookup(Arc::new(StaticLookup)));
        state.session().connect().unwrap();
        state
            .session()
            .subscribe()
            .wait_for(|s| s.status == ConnectionStatus::Open)
            .await
            .unwrap();

        state
            .handle_event(SessionEvent::FunctionCall {
                call_id: "call_7".to_string(),
                name: LOOKUP_MEDICATION.to_string(),
                arguments: r#"{"name":"Doliprane"}"#.to_string(),
            })
            .await;

        let sent = connector.sent_messages();
        let output: Value = serde_json::from_str(&sent[1]).unwrap();
        assert_eq!(output["item"]["type"], "function_call_output");
        assert_eq!(output["item"]["call_id"], "call_7");
        let result: Value = serde_json::from_str(output["item"]["output"].as_str().unwrap()).unwrap();
        assert_eq!(result["dosage"], "500 mg");
        assert_eq!(connector.sent_types()[2], "response.create");
    }

    #[tokio::test]
    async fn test_session_notices_forwarded() {
        let mut f = fixture();
        f.state
            .handle_event(SessionEvent::Notice(SessionNotice::ReconnectManually))
            .await;

        let notice = f.notices.try_recv().unwrap();
        assert_eq!(notice, Notice::Session(SessionNotice::ReconnectManually));
        assert!(!notice.message().is_empty());
    }
}
