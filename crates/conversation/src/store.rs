//! Persistance de l'historique de conversation
//!
//! L'historique complet est réécrit à chaque modification, sous une clé
//! unique (`conversation_history.json`). Un contenu illisible est signalé
//! par `ConversationError::PersistenceCorrupt`; c'est l'appelant qui décide
//! de repartir d'un journal vide.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::ConversationResult;
use crate::message::ConversationMessage;

/// Nom du fichier d'historique
pub const HISTORY_KEY: &str = "conversation_history.json";

/// Stockage durable du journal
pub trait HistoryStore: Send {
    /// Charge le journal enregistré (vide s'il n'y en a pas)
    fn load(&self) -> ConversationResult<Vec<ConversationMessage>>;

    /// Remplace le journal enregistré
    fn save(&self, messages: &[ConversationMessage]) -> ConversationResult<()>;

    /// Supprime le journal enregistré
    fn clear(&self) -> ConversationResult<()>;
}

/// Historique dans un fichier JSON
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    /// Fichier `conversation_history.json` dans le répertoire donné
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(HISTORY_KEY),
        }
    }

    /// Répertoire de données de l'utilisateur, `.` à défaut
    pub fn default_dir() -> PathBuf {
        directories::BaseDirs::new()
            .map_or_else(|| PathBuf::from("."), |d| d.data_dir().to_path_buf())
            .join("medvoice")
    }

    pub fn at_default_location() -> Self {
        Self::in_dir(Self::default_dir())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl HistoryStore for JsonFileStore {
    fn load(&self) -> ConversationResult<Vec<ConversationMessage>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&raw)?)
    }

    fn save(&self, messages: &[ConversationMessage]) -> ConversationResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Écriture puis renommage : pas de fichier à moitié écrit
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(messages)?)?;
        fs::rename(&tmp, &self.path)?;

        debug!(count = messages.len(), path = %self.path.display(), "historique enregistré");
        Ok(())
    }

    fn clear(&self) -> ConversationResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Historique en mémoire, au même format JSON que le fichier
///
/// Les clones partagent le même contenu.
#[derive(Clone, Default)]
pub struct MemoryStore {
    raw: Arc<Mutex<Option<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stockage pré-rempli avec un contenu brut (éventuellement invalide)
    pub fn with_raw(raw: impl Into<String>) -> Self {
        Self {
            raw: Arc::new(Mutex::new(Some(raw.into()))),
        }
    }

    /// Contenu brut enregistré
    pub fn raw(&self) -> Option<String> {
        self.with_raw_slot(|slot| slot.clone())
    }

    fn with_raw_slot<R>(&self, f: impl FnOnce(&mut Option<String>) -> R) -> R {
        match self.raw.lock() {
            Ok(mut slot) => f(&mut slot),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

impl HistoryStore for MemoryStore {
    fn load(&self) -> ConversationResult<Vec<ConversationMessage>> {
        match self.raw() {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    fn save(&self, messages: &[ConversationMessage]) -> ConversationResult<()> {
        let raw = serde_json::to_string(messages)?;
        self.with_raw_slot(|slot| *slot = Some(raw));
        Ok(())
    }

    fn clear(&self) -> ConversationResult<()> {
        self.with_raw_slot(|slot| *slot = None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConversationError;
    use crate::message::Role;

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::in_dir(dir.path().join("profil"));

        assert!(store.load().unwrap().is_empty());

        let messages = vec![
            ConversationMessage::user("Quand dois-je prendre mon traitement ?"),
            ConversationMessage::assistant_audio("À 8h et à 20h."),
        ];
        store.save(&messages).unwrap();
        assert!(store.path().ends_with(HISTORY_KEY));

        let loaded = store.load().unwrap();
        assert_eq!(loaded, messages);
        assert_eq!(loaded[1].role(), Role::Assistant);

        store.clear().unwrap();
        assert!(!store.path().exists());
        store.clear().unwrap();
    }

    #[test]
    fn test_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::in_dir(dir.path());
        fs::write(store.path(), "{\"pas\": \"une liste\"").unwrap();

        assert!(matches!(store.load(), Err(ConversationError::PersistenceCorrupt(_))));
    }

    #[test]
    fn test_schema_mismatch() {
        let store = MemoryStore::with_raw(r#"[{"id": 3, "type": "robot"}]"#);
        assert!(matches!(store.load(), Err(ConversationError::PersistenceCorrupt(_))));

        store.save(&[ConversationMessage::system("ok")]).unwrap();
        assert_eq!(store.load().unwrap().len(), 1);
    }

    #[test]
    fn test_default_location() {
        let store = JsonFileStore::at_default_location();
        assert!(store.path().ends_with(Path::new("medvoice").join(HISTORY_KEY)));
    }
}
