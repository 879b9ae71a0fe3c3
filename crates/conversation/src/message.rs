//! Messages du journal de conversation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Auteur d'un message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Role::User => "Vous",
            Role::Assistant => "Assistant",
            Role::System => "Système",
        };
        write!(f, "{}", label)
    }
}

/// Entrée du journal
///
/// Format persisté : `{id, type, content, timestamp, audio?}`, horodatage
/// RFC 3339. Le rôle ne change jamais après création.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: String,
    #[serde(rename = "type")]
    role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "audio", default, skip_serializing_if = "std::ops::Not::not")]
    pub is_audio: bool,
}

impl ConversationMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            is_audio: false,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Réponse vocale de l'assistant (transcription)
    pub fn assistant_audio(content: impl Into<String>) -> Self {
        Self {
            is_audio: true,
            ..Self::new(Role::Assistant, content)
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Ajoute un fragment au contenu
    pub fn append(&mut self, fragment: &str) {
        self.content.push_str(fragment);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_persisted_shape() {
        let message = ConversationMessage::assistant_audio("Bonjour");
        let value = serde_json::to_value(&message).unwrap();

        assert_eq!(value["type"], "assistant");
        assert_eq!(value["content"], "Bonjour");
        assert_eq!(value["audio"], true);
        assert!(value["timestamp"].as_str().unwrap().contains('T'));
        assert!(Uuid::parse_str(value["id"].as_str().unwrap()).is_ok());

        let text = serde_json::to_value(ConversationMessage::user("Salut")).unwrap();
        assert!(text.get("audio").is_none());
    }

    #[test]
    fn test_reads_stored_message() {
        let message: ConversationMessage = serde_json::from_value(json!({
            "id": "m1",
            "type": "user",
            "content": "J'ai pris mon Doliprane",
            "timestamp": "2025-03-01T08:30:00Z"
        }))
        .unwrap();

        assert_eq!(message.role(), Role::User);
        assert!(!message.is_audio);
        assert_eq!(message.timestamp.to_rfc3339(), "2025-03-01T08:30:00+00:00");
    }

    #[test]
    fn test_unique_ids() {
        let a = ConversationMessage::system("a");
        let b = ConversationMessage::system("a");
        assert_ne!(a.id, b.id);
    }
}
