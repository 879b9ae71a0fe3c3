// Réglages du client vocal
//
// Ordre de priorité (du plus fort au plus faible) :
// 1. Options de la ligne de commande
// 2. Variables d'environnement `VOICE_*` (`VOICE_API_KEY`, `VOICE_AUDIO__SAMPLE_RATE`...)
//    et `OPENAI_API_KEY` pour la clé
// 3. Fichier TOML (`voice-client.toml` ou `--config`)
// 4. Valeurs par défaut

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use audio::AudioConfig;
use network::{NetworkConfig, SessionOptions};
use serde::{Deserialize, Serialize};

#[derive(Clone, Serialize, Deserialize)]
pub struct Settings {
    pub url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub voice: String,
    pub max_retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub connect_timeout_ms: u64,
    /// Répertoire de l'historique (défaut : répertoire de données utilisateur)
    pub history_dir: Option<PathBuf>,
    pub audio: AudioConfig,
}

impl Default for Settings {
    fn default() -> Self {
        let network = NetworkConfig::default();
        Self {
            url: network.url,
            model: network.model,
            api_key: None,
            voice: network.session.voice,
            max_retry_attempts: network.max_retry_attempts,
            retry_base_delay_ms: network.retry_base_delay.as_millis() as u64,
            connect_timeout_ms: network.connection_timeout.as_millis() as u64,
            history_dir: None,
            audio: AudioConfig::default(),
        }
    }
}

impl Settings {
    /// Charge les réglages depuis les défauts, le fichier et l'environnement
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Settings::default())?);

        builder = match file {
            Some(path) => builder.add_source(config::File::from(path)),
            None => builder.add_source(config::File::with_name("voice-client").required(false)),
        };

        builder = builder.add_source(
            config::Environment::with_prefix("VOICE")
                .prefix_separator("_")
                .separator("__"),
        );

        if env::var("VOICE_API_KEY").is_err() {
            if let Ok(key) = env::var("OPENAI_API_KEY") {
                builder = builder.set_override("api_key", key)?;
            }
        }

        let settings: Settings = builder
            .build()
            .context("lecture des réglages")?
            .try_deserialize()
            .context("réglages invalides")?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        self.audio.validate().map_err(|e| anyhow!(e))?;
        self.network_config(Vec::new()).validate().map_err(|e| anyhow!(e))?;
        Ok(())
    }

    /// Configuration réseau, avec les outils à déclarer au modèle
    pub fn network_config(&self, tools: Vec<network::ToolDefinition>) -> NetworkConfig {
        let defaults = NetworkConfig::default();
        NetworkConfig {
            url: self.url.clone(),
            model: self.model.clone(),
            api_key: self.api_key.clone(),
            connection_timeout: Duration::from_millis(self.connect_timeout_ms),
            max_retry_attempts: self.max_retry_attempts,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
            session: SessionOptions {
                voice: self.voice.clone(),
                tools,
                ..defaults.session.clone()
            },
            ..defaults
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_defaults_match_network() {
        let settings = Settings::default();
        let network = settings.network_config(Vec::new());

        assert_eq!(network.max_retry_attempts, 3);
        assert_eq!(network.retry_base_delay, Duration::from_secs(1));
        assert_eq!(network.session.voice, "alloy");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("voice.toml");
        fs::write(
            &path,
            "url = \"ws://127.0.0.1:8080/realtime\"\nmodel = \"\"\nvoice = \"verse\"\n\n[audio]\nbuffer_size = 2048\n",
        )
        .unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.voice, "verse");
        assert_eq!(settings.audio.buffer_size, 2048);
        assert_eq!(settings.audio.sample_rate, 24000);
        assert_eq!(settings.network_config(Vec::new()).endpoint(), "ws://127.0.0.1:8080/realtime");
    }

    #[test]
    fn test_invalid_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("voice.toml");
        fs::write(&path, "url = \"http://exemple\"\n").unwrap();

        assert!(Settings::load(Some(&path)).is_err());
    }
}
