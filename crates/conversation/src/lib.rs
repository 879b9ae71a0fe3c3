//! Crate conversation - Journal de la conversation vocale
//!
//! Ce crate relie la capture micro et la session réseau :
//! - `state` : état de la conversation (journal, transcription en cours,
//!   enregistrement, appels d'outils)
//! - `message` : messages du journal
//! - `store` : persistance de l'historique
//! - `tools` : outils exposés au modèle (famille, médicaments)
//! - `error` : gestion d'erreurs

mod error;
mod message;
mod state;
mod store;
mod tools;

pub use error::{ConversationError, ConversationResult};
pub use message::{ConversationMessage, Role};
pub use state::{ConversationState, Notice};
pub use store::{HISTORY_KEY, HistoryStore, JsonFileStore, MemoryStore};
pub use tools::{
    FamilyNotifier, LOOKUP_MEDICATION, MedicationLookup, SEND_FAMILY_NOTIFICATION, ToolRegistry,
};
