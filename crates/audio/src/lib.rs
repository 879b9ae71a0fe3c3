//! Crate audio du client vocal temps réel
//!
//! Ce crate gère toute la chaîne audio :
//! - Capture microphone avec cpal (et une capture synthétique sans matériel)
//! - Encodage PCM16 / base64 pour le réseau
//! - File de lecture ordonnée des fragments reçus

pub mod config;      // Configuration audio
pub mod types;       // Types de données (SampleBuffer, WireFrame, etc.)
pub mod traits;      // Traits abstraits
pub mod capture;     // Implémentation capture avec cpal
pub mod level;       // Moniteur de niveau micro
pub mod synthetic;   // Capture et sortie sans matériel
pub mod playback;    // File de lecture et sortie cpal
pub mod codec;       // Encodage PCM16 / base64 / WAV
pub mod error;       // Gestion d'erreurs

// Réexports pour faciliter l'utilisation
pub use config::*;
pub use types::*;
pub use traits::*;
pub use error::*;

// Réexports des implémentations principales
pub use capture::CpalCapture;
pub use codec::SampleEncoder;
pub use playback::{CpalSink, CpalSinkFactory, PlaybackQueue, PlaybackState};
pub use synthetic::{MemorySink, SyntheticCapture};
