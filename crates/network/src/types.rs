//! Types de données pour le système réseau
//!
//! Ce module définit :
//! - ConnectionStatus / ConnectionState : état observable de la session
//! - ConnectionQuality : qualité dérivée des latences d'ouverture
//! - NetworkConfig / SessionOptions : configuration de la connexion
//! - SessionEvent / SessionNotice : ce que la session remonte au reste de l'application

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Raison de la dernière fermeture
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// Fermeture normale (code 1000)
    Normal,
    /// Fermeture anormale : code != 1000, erreur de flux ou fin sans trame de fermeture
    Abnormal { code: u16 },
    /// Le service a signalé son indisponibilité
    ServiceUnavailable,
    /// L'ouverture a échoué
    ConnectFailed(String),
}

/// État de la connexion avec le service
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Aucune connexion, pas de reconnexion prévue
    Disconnected,

    /// Ouverture en cours (`attempt` = 0 pour la première, puis 1..=3)
    Connecting { attempt: u32 },

    /// Connexion ouverte, prête à émettre
    Open,

    /// Connexion fermée, éventuellement en attente de reconnexion
    Closed(CloseReason),

    /// Budget de reconnexion épuisé, reconnexion manuelle nécessaire
    Failed,
}

impl ConnectionStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionStatus::Open)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, ConnectionStatus::Connecting { .. })
    }

    /// Description textuelle de l'état pour l'UI
    pub fn description(&self) -> String {
        match self {
            ConnectionStatus::Disconnected => "Déconnecté".to_string(),
            ConnectionStatus::Connecting { attempt: 0 } => "Connexion...".to_string(),
            ConnectionStatus::Connecting { attempt } => {
                format!("Reconnexion (tentative {})", attempt)
            }
            ConnectionStatus::Open => "Connecté".to_string(),
            ConnectionStatus::Closed(CloseReason::Normal) => "Fermé".to_string(),
            ConnectionStatus::Closed(CloseReason::Abnormal { code }) => {
                format!("Connexion perdue (code {})", code)
            }
            ConnectionStatus::Closed(CloseReason::ServiceUnavailable) => {
                "Service indisponible".to_string()
            }
            ConnectionStatus::Closed(CloseReason::ConnectFailed(reason)) => {
                format!("Échec de connexion: {}", reason)
            }
            ConnectionStatus::Failed => "Échec, reconnectez-vous manuellement".to_string(),
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description())
    }
}

/// Qualité de connexion, dérivée de la latence moyenne d'ouverture
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    /// Moyenne < 100ms
    Excellent,
    /// Moyenne < 300ms
    Good,
    /// Moyenne >= 300ms
    Poor,
}

impl ConnectionQuality {
    /// Classe une latence moyenne
    pub fn from_mean(mean: Duration) -> Self {
        match mean.as_millis() {
            0..=99 => ConnectionQuality::Excellent,
            100..=299 => ConnectionQuality::Good,
            _ => ConnectionQuality::Poor,
        }
    }

    /// Classe un ensemble d'échantillons de latence (en ms)
    ///
    /// Fonction pure : sans échantillon, la qualité est `Excellent`.
    pub fn from_samples(samples_ms: &[u64]) -> Self {
        if samples_ms.is_empty() {
            return ConnectionQuality::Excellent;
        }
        let mean = samples_ms.iter().sum::<u64>() as f64 / samples_ms.len() as f64;
        Self::from_mean(Duration::from_secs_f64(mean / 1000.0))
    }

    /// Description textuelle pour l'UI
    pub fn description(&self) -> &'static str {
        match self {
            ConnectionQuality::Excellent => "Excellente",
            ConnectionQuality::Good => "Bonne",
            ConnectionQuality::Poor => "Mauvaise",
        }
    }

    /// Pastille de couleur pour l'affichage console
    pub fn indicator(&self) -> &'static str {
        match self {
            ConnectionQuality::Excellent => "🟢",
            ConnectionQuality::Good => "🟠",
            ConnectionQuality::Poor => "🔴",
        }
    }
}

/// Fenêtre glissante des latences d'ouverture
#[derive(Clone, Debug)]
pub struct LatencyWindow {
    samples: VecDeque<u64>,
    capacity: usize,
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Ajoute une latence, en oubliant la plus ancienne si la fenêtre est pleine
    pub fn push(&mut self, latency: Duration) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(latency.as_millis() as u64);
    }

    pub fn samples(&self) -> Vec<u64> {
        self.samples.iter().copied().collect()
    }

    pub fn quality(&self) -> ConnectionQuality {
        ConnectionQuality::from_samples(&self.samples())
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

/// État observable de la connexion
///
/// Diffusé via `watch` : statut, dernières latences et qualité courante.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub latency_samples: Vec<u64>,
    pub quality: ConnectionQuality,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            latency_samples: Vec::new(),
            quality: ConnectionQuality::Excellent,
        }
    }
}

/// Détection de tour de parole côté serveur
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: String,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

impl Default for TurnDetection {
    fn default() -> Self {
        Self {
            kind: "server_vad".to_string(),
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 500,
        }
    }
}

/// Transcription de l'audio de l'utilisateur
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InputTranscription {
    pub model: String,
}

/// Déclaration d'un outil appelable par le modèle
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    pub fn function(name: &str, description: &str, parameters: serde_json::Value) -> Self {
        Self {
            kind: "function".to_string(),
            name: name.to_string(),
            description: description.to_string(),
            parameters,
        }
    }
}

/// Paramètres de session envoyés à chaque ouverture (`session.update`)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionOptions {
    pub modalities: Vec<String>,
    pub instructions: String,
    pub voice: String,
    pub input_audio_format: String,
    pub output_audio_format: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<InputTranscription>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_detection: Option<TurnDetection>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tools: Vec<ToolDefinition>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            modalities: vec!["text".to_string(), "audio".to_string()],
            instructions: "Tu es l'assistant vocal d'une application de suivi des médicaments. \
                           Réponds brièvement, en français, et aide l'utilisateur à suivre ses prises, \
                           ses rendez-vous et à prévenir sa famille si besoin."
                .to_string(),
            voice: "alloy".to_string(),
            input_audio_format: "pcm16".to_string(),
            output_audio_format: "pcm16".to_string(),
            input_audio_transcription: Some(InputTranscription {
                model: "whisper-1".to_string(),
            }),
            turn_detection: Some(TurnDetection::default()),
            tools: Vec::new(),
        }
    }
}

/// Configuration du système réseau
///
/// Centralise tous les paramètres de la session WebSocket.
#[derive(Clone)]
pub struct NetworkConfig {
    /// URL du service temps réel (ws:// ou wss://)
    pub url: String,

    /// Modèle demandé, ajouté en paramètre `model` de l'URL
    pub model: String,

    /// Clé d'API envoyée en `Authorization: Bearer`
    pub api_key: Option<String>,

    /// Timeout pour l'ouverture du WebSocket (défaut: 10s)
    pub connection_timeout: Duration,

    /// Nombre maximum de tentatives de reconnexion (défaut: 3)
    pub max_retry_attempts: u32,

    /// Délai de base entre tentatives : la tentative n attend n × base (défaut: 1s)
    pub retry_base_delay: Duration,

    /// Période de recalcul de la qualité (défaut: 5s)
    pub quality_interval: Duration,

    /// Nombre de latences gardées pour la qualité (défaut: 10)
    pub latency_window: usize,

    /// Paramètres envoyés dans `session.update`
    pub session: SessionOptions,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            url: "wss://api.openai.com/v1/realtime".to_string(),
            model: "gpt-4o-realtime-preview".to_string(),
            api_key: None,
            connection_timeout: Duration::from_secs(10),
            max_retry_attempts: 3,
            retry_base_delay: Duration::from_secs(1),
            quality_interval: Duration::from_secs(5),
            latency_window: 10,
            session: SessionOptions::default(),
        }
    }
}

impl fmt::Debug for NetworkConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkConfig")
            .field("url", &self.url)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("connection_timeout", &self.connection_timeout)
            .field("max_retry_attempts", &self.max_retry_attempts)
            .field("retry_base_delay", &self.retry_base_delay)
            .field("quality_interval", &self.quality_interval)
            .field("latency_window", &self.latency_window)
            .finish()
    }
}

impl NetworkConfig {
    /// Délai avant la tentative `attempt` (1-based) : attempt × base
    pub fn next_delay(&self, attempt: u32) -> Duration {
        self.retry_base_delay * attempt
    }

    /// URL complète, modèle inclus
    pub fn endpoint(&self) -> String {
        if self.model.is_empty() {
            return self.url.clone();
        }
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}model={}", self.url, separator, self.model)
    }

    /// Valide que la configuration est cohérente
    pub fn validate(&self) -> Result<(), String> {
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(format!("URL invalide: {} (doit commencer par ws:// ou wss://)", self.url));
        }

        if self.max_retry_attempts > 10 {
            return Err(format!(
                "Nombre de tentatives invalide: {} (10 maximum)",
                self.max_retry_attempts
            ));
        }

        if self.retry_base_delay.is_zero() {
            return Err("Délai de reconnexion nul".to_string());
        }

        if self.quality_interval.is_zero() {
            return Err("Intervalle de qualité nul".to_string());
        }

        if self.latency_window == 0 {
            return Err("Fenêtre de latence vide".to_string());
        }

        Ok(())
    }

    /// Configuration pour un serveur local (sans TLS, sans clé)
    pub fn local(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            model: String::new(),
            connection_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    /// Configuration pour tests
    pub fn test_config() -> Self {
        Self {
            url: "ws://127.0.0.1:0/realtime".to_string(),
            model: "test".to_string(),
            connection_timeout: Duration::from_millis(500),
            ..Default::default()
        }
    }
}

/// Notification destinée à l'utilisateur
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionNotice {
    /// Reconnexion réussie après une perte de connexion
    Reconnected,
    /// Le service limite le débit de requêtes
    RateLimited(String),
    /// Erreur signalée par le service
    ConnectionError(String),
    /// Reconnexion automatique abandonnée
    ReconnectManually,
}

impl SessionNotice {
    /// Message affichable
    pub fn message(&self) -> String {
        match self {
            SessionNotice::Reconnected => "Reconnecté au service vocal".to_string(),
            SessionNotice::RateLimited(detail) => {
                format!("Trop de requêtes, patientez avant de réessayer ({})", detail)
            }
            SessionNotice::ConnectionError(detail) => format!("Erreur de connexion: {}", detail),
            SessionNotice::ReconnectManually => {
                "Connexion perdue. Reconnectez-vous manuellement.".to_string()
            }
        }
    }
}

/// Événement remonté par la session
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    /// Fragment de la transcription de la réponse en cours
    TranscriptDelta(String),
    /// Fin de la transcription de la réponse
    TranscriptDone { transcript: Option<String> },
    /// Fin de la réponse
    ResponseDone,
    /// Transcription de ce que l'utilisateur a dit
    UserTranscript(String),
    /// Le modèle demande l'exécution d'un outil
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    /// Notification pour l'utilisateur
    Notice(SessionNotice),
}
