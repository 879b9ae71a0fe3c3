//! Moniteur de niveau du microphone
//!
//! Analyse fréquentielle des derniers échantillons capturés, à la manière
//! d'un analyseur Web Audio : DFT sur 256 points, magnitudes converties en dB,
//! ramenées de [-100, -30] dB vers [0, 255], moyennées puis mises à l'échelle
//! 0-100. Le niveau est publié à cadence fixe via un canal `watch`,
//! indépendamment du callback de capture.

use std::collections::VecDeque;
use std::f32::consts::PI;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::trace;

/// Nombre de points de l'analyse
pub const ANALYSIS_WINDOW: usize = 256;

/// Bornes de la plage dB ramenée sur [0, 255]
pub const MIN_DECIBELS: f32 = -100.0;
pub const MAX_DECIBELS: f32 = -30.0;

/// Fenêtre glissante des derniers échantillons capturés
///
/// Partagée entre le callback du périphérique (écriture) et la tâche
/// d'analyse (lecture).
#[derive(Clone, Debug, Default)]
pub struct LevelWindow {
    samples: Arc<Mutex<VecDeque<f32>>>,
}

impl LevelWindow {
    pub fn new() -> Self {
        Self {
            samples: Arc::new(Mutex::new(VecDeque::with_capacity(ANALYSIS_WINDOW))),
        }
    }

    /// Ajoute des échantillons en ne gardant que les `ANALYSIS_WINDOW` derniers
    ///
    /// Appelé depuis le thread audio : n'attend jamais le verrou, les
    /// échantillons sont ignorés si l'analyse est en cours.
    pub fn push(&self, samples: &[f32]) {
        let Ok(mut window) = self.samples.try_lock() else {
            return;
        };

        let tail = &samples[samples.len().saturating_sub(ANALYSIS_WINDOW)..];
        window.extend(tail.iter().copied());

        let excess = window.len().saturating_sub(ANALYSIS_WINDOW);
        window.drain(..excess);
    }

    /// Copie des échantillons courants
    pub fn snapshot(&self) -> Vec<f32> {
        match self.samples.lock() {
            Ok(window) => window.iter().copied().collect(),
            Err(poisoned) => poisoned.into_inner().iter().copied().collect(),
        }
    }

    pub fn clear(&self) {
        if let Ok(mut window) = self.samples.lock() {
            window.clear();
        }
    }
}

/// Calcule le niveau (0-100) d'un bloc d'échantillons
///
/// Les blocs de moins de 256 échantillons sont complétés par du silence.
pub fn analyse_level(samples: &[f32]) -> u8 {
    let n = ANALYSIS_WINDOW;
    let start = samples.len().saturating_sub(n);
    let mut block = [0.0f32; ANALYSIS_WINDOW];
    for (slot, &sample) in block.iter_mut().zip(&samples[start..]) {
        *slot = if sample.is_finite() { sample } else { 0.0 };
    }

    // Fenêtre de Blackman
    for (i, value) in block.iter_mut().enumerate() {
        let phase = 2.0 * PI * i as f32 / n as f32;
        *value *= 0.42 - 0.5 * phase.cos() + 0.08 * (2.0 * phase).cos();
    }

    let bins = n / 2;
    let mut total = 0.0f32;
    for k in 0..bins {
        let (mut re, mut im) = (0.0f32, 0.0f32);
        for (i, &x) in block.iter().enumerate() {
            let angle = 2.0 * PI * (k * i % n) as f32 / n as f32;
            re += x * angle.cos();
            im -= x * angle.sin();
        }
        let magnitude = (re * re + im * im).sqrt() / n as f32;
        total += decibels_to_byte(20.0 * magnitude.log10());
    }

    let average = total / bins as f32;
    (average / 255.0 * 100.0).round().clamp(0.0, 100.0) as u8
}

/// Ramène une valeur en dB sur [0, 255]
fn decibels_to_byte(db: f32) -> f32 {
    if !db.is_finite() {
        return 0.0;
    }
    (255.0 * (db - MIN_DECIBELS) / (MAX_DECIBELS - MIN_DECIBELS)).clamp(0.0, 255.0)
}

/// Tâche de publication du niveau
///
/// La tâche est interrompue à la destruction du moniteur.
pub struct LevelMonitor {
    task: JoinHandle<()>,
    receiver: watch::Receiver<u8>,
}

impl LevelMonitor {
    /// Lance l'analyse périodique de `window`
    ///
    /// Doit être appelé depuis un runtime tokio.
    pub fn spawn(window: LevelWindow, interval: Duration) -> Self {
        let (sender, receiver) = watch::channel(0u8);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                let level = analyse_level(&window.snapshot());
                sender.send_if_modified(|current| {
                    if *current != level {
                        trace!(level, "niveau micro");
                        *current = level;
                        true
                    } else {
                        false
                    }
                });
            }
        });

        Self { task, receiver }
    }

    pub fn subscribe(&self) -> watch::Receiver<u8> {
        self.receiver.clone()
    }
}

impl Drop for LevelMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(amplitude: f32, frequency: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| amplitude * (2.0 * PI * frequency * i as f32 / 24000.0).sin())
            .collect()
    }

    #[test]
    fn test_silence_is_zero() {
        assert_eq!(analyse_level(&[0.0; 512]), 0);
        assert_eq!(analyse_level(&[]), 0);
    }

    #[test]
    fn test_louder_signal_reads_higher() {
        let quiet = analyse_level(&sine(0.01, 440.0, 512));
        let loud = analyse_level(&sine(0.9, 440.0, 512));

        assert!(quiet > 0);
        assert!(loud >= quiet, "loud={} quiet={}", loud, quiet);
        assert!(loud <= 100);
    }

    #[test]
    fn test_window_keeps_latest_samples() {
        let window = LevelWindow::new();
        window.push(&vec![1.0; 300]);
        window.push(&[0.5, 0.25]);

        let snapshot = window.snapshot();
        assert_eq!(snapshot.len(), ANALYSIS_WINDOW);
        assert_eq!(snapshot[ANALYSIS_WINDOW - 1], 0.25);

        window.clear();
        assert!(window.snapshot().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_publishes_level() {
        let window = LevelWindow::new();
        let monitor = LevelMonitor::spawn(window.clone(), Duration::from_millis(16));
        let mut level = monitor.subscribe();

        window.push(&sine(0.8, 1000.0, ANALYSIS_WINDOW));
        level.changed().await.unwrap();
        assert!(*level.borrow() > 0);

        drop(monitor);
        // La tâche est interrompue : le canal se ferme
        assert!(level.changed().await.is_err());
    }
}
