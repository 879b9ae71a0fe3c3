//! Messages JSON échangés avec le service temps réel
//!
//! Chaque trame texte du WebSocket contient un objet JSON dont le champ
//! `type` désigne le message. Les messages entrants inconnus sont
//! désérialisés en `ServerEvent::Other` et ignorés.

use serde::{Deserialize, Serialize};

use crate::error::TransportErrorKind;
use crate::types::SessionOptions;

/// Message émis par le client
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Ajoute de l'audio (PCM16 base64) au buffer d'entrée du service
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },

    /// Ajoute un élément à la conversation
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },

    /// Demande une réponse au modèle
    #[serde(rename = "response.create")]
    ResponseCreate,

    /// Met à jour les paramètres de la session
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionOptions },
}

impl ClientEvent {
    /// Message utilisateur en texte
    pub fn user_text(text: impl Into<String>) -> Self {
        ClientEvent::ConversationItemCreate {
            item: ConversationItem::Message {
                role: "user".to_string(),
                content: vec![ContentPart::InputText { text: text.into() }],
            },
        }
    }

    /// Résultat d'un appel d'outil
    pub fn function_output(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        ClientEvent::ConversationItemCreate {
            item: ConversationItem::FunctionCallOutput {
                call_id: call_id.into(),
                output: output.into(),
            },
        }
    }

    /// Sérialise le message pour une trame texte
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Nom du message, pour les logs
    pub fn kind(&self) -> &'static str {
        match self {
            ClientEvent::InputAudioBufferAppend { .. } => "input_audio_buffer.append",
            ClientEvent::ConversationItemCreate { .. } => "conversation.item.create",
            ClientEvent::ResponseCreate => "response.create",
            ClientEvent::SessionUpdate { .. } => "session.update",
        }
    }
}

/// Élément de conversation créé par le client
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationItem {
    Message { role: String, content: Vec<ContentPart> },
    FunctionCallOutput { call_id: String, output: String },
}

/// Contenu d'un message
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    InputText { text: String },
}

/// Détail d'un message `error`
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct ErrorPayload {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default, rename = "type")]
    pub error_type: Option<String>,
}

impl ErrorPayload {
    pub fn kind(&self) -> TransportErrorKind {
        TransportErrorKind::classify(self.code.as_deref(), self.error_type.as_deref())
    }

    /// Texte à montrer à l'utilisateur
    pub fn describe(&self) -> String {
        match (&self.code, self.message.is_empty()) {
            (_, false) => self.message.clone(),
            (Some(code), true) => code.clone(),
            (None, true) => "erreur inconnue".to_string(),
        }
    }
}

/// Message reçu du service
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// Fragment audio (PCM16 base64) de la réponse
    #[serde(rename = "response.audio.delta")]
    AudioDelta { delta: String },

    /// Fragment de transcription de la réponse
    #[serde(rename = "response.audio_transcript.delta")]
    TranscriptDelta { delta: String },

    /// Fin de la transcription de la réponse
    #[serde(rename = "response.audio_transcript.done")]
    TranscriptDone {
        #[serde(default)]
        transcript: Option<String>,
    },

    /// Fin de la réponse
    #[serde(rename = "response.done")]
    ResponseDone {
        #[serde(default)]
        response: Option<serde_json::Value>,
    },

    /// Transcription de l'audio envoyé par l'utilisateur
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptionCompleted { transcript: String },

    /// Arguments complets d'un appel d'outil
    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallArgumentsDone {
        call_id: String,
        name: String,
        arguments: String,
    },

    #[serde(rename = "session.created")]
    SessionCreated {
        #[serde(default)]
        session: Option<serde_json::Value>,
    },

    #[serde(rename = "session.updated")]
    SessionUpdated {
        #[serde(default)]
        session: Option<serde_json::Value>,
    },

    /// Erreur signalée par le service
    #[serde(rename = "error")]
    Error { error: ErrorPayload },

    /// Tout autre message, ignoré
    #[serde(other)]
    Other,
}

impl ServerEvent {
    /// Désérialise une trame texte
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}
