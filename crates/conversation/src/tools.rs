//! Outils exposés au modèle
//!
//! Le modèle peut demander deux actions au reste de l'application :
//! prévenir un groupe familial et consulter la fiche d'un médicament.
//! Ces services sont fournis de l'extérieur via `FamilyNotifier` et
//! `MedicationLookup`. Un nom d'outil inconnu ou des arguments invalides
//! produisent une réponse d'erreur renvoyée au modèle.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use network::ToolDefinition;

use crate::error::{ConversationError, ConversationResult};

pub const SEND_FAMILY_NOTIFICATION: &str = "send_family_notification";
pub const LOOKUP_MEDICATION: &str = "lookup_medication";

/// Envoi de notifications aux membres d'un groupe familial
#[async_trait]
pub trait FamilyNotifier: Send + Sync {
    async fn send_family_notification(
        &self,
        group_id: &str,
        message: &str,
        category: &str,
        priority: &str,
    ) -> ConversationResult<Value>;
}

/// Recherche d'informations sur un médicament
#[async_trait]
pub trait MedicationLookup: Send + Sync {
    async fn lookup_medication(&self, name: &str) -> ConversationResult<Value>;
}

#[derive(Debug, Deserialize)]
struct NotificationArgs {
    group_id: String,
    message: String,
    #[serde(default = "default_category")]
    category: String,
    #[serde(default = "default_priority")]
    priority: String,
}

fn default_category() -> String {
    "general".to_string()
}

fn default_priority() -> String {
    "normal".to_string()
}

#[derive(Debug, Deserialize)]
struct LookupArgs {
    name: String,
}

/// Aiguillage des appels d'outils vers les services configurés
#[derive(Clone, Default)]
pub struct ToolRegistry {
    notifier: Option<Arc<dyn FamilyNotifier>>,
    lookup: Option<Arc<dyn MedicationLookup>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn FamilyNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_lookup(mut self, lookup: Arc<dyn MedicationLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    /// Déclarations à envoyer dans `session.update`
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut tools = Vec::new();

        if self.notifier.is_some() {
            tools.push(ToolDefinition::function(
                SEND_FAMILY_NOTIFICATION,
                "Envoie une notification aux membres d'un groupe familial",
                json!({
                    "type": "object",
                    "properties": {
                        "group_id": {"type": "string"},
                        "message": {"type": "string"},
                        "category": {"type": "string", "enum": ["general", "medication", "appointment", "emergency"]},
                        "priority": {"type": "string", "enum": ["low", "normal", "high", "urgent"]}
                    },
                    "required": ["group_id", "message"]
                }),
            ));
        }

        if self.lookup.is_some() {
            tools.push(ToolDefinition::function(
                LOOKUP_MEDICATION,
                "Donne les informations connues sur un médicament",
                json!({
                    "type": "object",
                    "properties": {"name": {"type": "string"}},
                    "required": ["name"]
                }),
            ));
        }

        tools
    }

    /// Exécute un appel et produit la sortie à renvoyer au modèle
    ///
    /// Ne panique jamais : toute erreur devient `{"error": "..."}`.
    pub async fn dispatch(&self, name: &str, arguments: &str) -> String {
        match self.call(name, arguments).await {
            Ok(result) => {
                info!(tool = name, "outil exécuté");
                result.to_string()
            }
            Err(e) => {
                warn!(tool = name, error = %e, "appel d'outil en échec");
                json!({ "error": e.to_string() }).to_string()
            }
        }
    }

    async fn call(&self, name: &str, arguments: &str) -> ConversationResult<Value> {
        match name {
            SEND_FAMILY_NOTIFICATION => {
                let notifier = self
                    .notifier
                    .as_ref()
                    .ok_or_else(|| ConversationError::UnknownTool(name.to_string()))?;
                let args: NotificationArgs = parse_args(name, arguments)?;
                notifier
                    .send_family_notification(&args.group_id, &args.message, &args.category, &args.priority)
                    .await
            }
            LOOKUP_MEDICATION => {
                let lookup = self
                    .lookup
                    .as_ref()
                    .ok_or_else(|| ConversationError::UnknownTool(name.to_string()))?;
                let args: LookupArgs = parse_args(name, arguments)?;
                lookup.lookup_medication(&args.name).await
            }
            other => Err(ConversationError::UnknownTool(other.to_string())),
        }
    }
}

fn parse_args<T: for<'de> Deserialize<'de>>(tool: &str, arguments: &str) -> ConversationResult<T> {
    serde_json::from_str(arguments).map_err(|e| ConversationError::InvalidArguments {
        tool: tool.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<(String, String, String, String)>>,
    }

    #[async_trait]
    impl FamilyNotifier for RecordingNotifier {
        async fn send_family_notification(
            &self,
            group_id: &str,
            message: &str,
            category: &str,
            priority: &str,
        ) -> ConversationResult<Value> {
            self.sent.lock().unwrap().push((
                group_id.to_string(),
                message.to_string(),
                category.to_string(),
                priority.to_string(),
            ));
            Ok(json!({"sent": true}))
        }
    }

    struct FailingLookup;

    #[async_trait]
    impl MedicationLookup for FailingLookup {
        async fn lookup_medication(&self, _name: &str) -> ConversationResult<Value> {
            Err(ConversationError::collaborator("médicaments", "hors ligne"))
        }
    }

    #[tokio::test]
    async fn test_notification_dispatch() {
        let notifier = Arc::new(RecordingNotifier::default());
        let registry = ToolRegistry::new().with_notifier(notifier.clone());

        let output = registry
            .dispatch(SEND_FAMILY_NOTIFICATION, r#"{"group_id":"g1","message":"Dose oubliée"}"#)
            .await;

        assert_eq!(output, r#"{"sent":true}"#);
        let sent = notifier.sent.lock().unwrap();
        assert_eq!(
            sent[0],
            ("g1".to_string(), "Dose oubliée".to_string(), "general".to_string(), "normal".to_string())
        );
    }

    #[tokio::test]
    async fn test_errors_become_outputs() {
        let registry = ToolRegistry::new()
            .with_notifier(Arc::new(RecordingNotifier::default()))
            .with_lookup(Arc::new(FailingLookup));

        let unknown: Value = serde_json::from_str(&registry.dispatch("delete_everything", "{}").await).unwrap();
        assert_eq!(unknown["error"], "Outil inconnu: delete_everything");

        let malformed: Value =
            serde_json::from_str(&registry.dispatch(SEND_FAMILY_NOTIFICATION, "{\"group_id\":").await).unwrap();
        assert!(malformed["error"].as_str().unwrap().starts_with("Arguments invalides"));

        let failed: Value =
            serde_json::from_str(&registry.dispatch(LOOKUP_MEDICATION, r#"{"name":"Doliprane"}"#).await).unwrap();
        assert_eq!(failed["error"], "Service médicaments en échec: hors ligne");
    }

    #[tokio::test]
    async fn test_unconfigured_tool() {
        let registry = ToolRegistry::new();
        let output: Value =
            serde_json::from_str(&registry.dispatch(LOOKUP_MEDICATION, r#"{"name":"x"}"#).await).unwrap();
        assert!(output.get("error").is_some());
        assert!(registry.definitions().is_empty());
    }

    #[test]
    fn test_definitions() {
        let registry = ToolRegistry::new()
            .with_notifier(Arc::new(RecordingNotifier::default()))
            .with_lookup(Arc::new(FailingLookup));

        let names: Vec<String> = registry.definitions().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec![SEND_FAMILY_NOTIFICATION, LOOKUP_MEDICATION]);
    }
}
