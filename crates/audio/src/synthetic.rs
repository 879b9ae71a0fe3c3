//! Implémentations audio sans matériel
//!
//! - `SyntheticCapture` : génère une sinusoïde à la cadence de la capture
//! - `MemorySink` : enregistre ce qui aurait été joué, avec une latence réglable
//!
//! Utilisées par les tests et par le mode `--synthetic` du client.

use std::collections::VecDeque;
use std::f32::consts::PI;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::level::{LevelMonitor, LevelWindow};
use crate::{
    AudioCapture, AudioConfig, AudioError, AudioResult, AudioSink, SampleBuffer, SampleCallback,
    SinkFactory,
};

/// Capture simulée : une sinusoïde découpée en buffers de taille constante
pub struct SyntheticCapture {
    config: AudioConfig,
    frequency: f32,
    amplitude: f32,

    /// Raison de refus simulée (permission refusée, pas de micro...)
    unavailable: Option<String>,

    active: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
    window: LevelWindow,
    monitor: Option<LevelMonitor>,
}

impl SyntheticCapture {
    /// Sinusoïde à 440 Hz, amplitude 0.3
    pub fn new(config: AudioConfig) -> Self {
        Self {
            config,
            frequency: 440.0,
            amplitude: 0.3,
            unavailable: None,
            active: Arc::new(AtomicBool::new(false)),
            task: None,
            window: LevelWindow::new(),
            monitor: None,
        }
    }

    pub fn with_tone(mut self, frequency: f32, amplitude: f32) -> Self {
        self.frequency = frequency;
        self.amplitude = amplitude.clamp(0.0, 1.0);
        self
    }

    /// Capture qui refuse de démarrer, comme un micro dont l'accès est refusé
    pub fn unavailable(config: AudioConfig, reason: impl Into<String>) -> Self {
        Self {
            unavailable: Some(reason.into()),
            ..Self::new(config)
        }
    }
}

#[async_trait]
impl AudioCapture for SyntheticCapture {
    async fn start(&mut self, mut on_buffer: SampleCallback) -> AudioResult<()> {
        if let Some(reason) = &self.unavailable {
            return Err(AudioError::CaptureUnavailable(reason.clone()));
        }
        if self.is_recording() {
            return Ok(());
        }

        let buffer_size = self.config.buffer_size;
        let sample_rate = self.config.sample_rate;
        let step = 2.0 * PI * self.frequency / sample_rate as f32;
        let amplitude = self.amplitude;
        let period = self.config.buffer_duration();
        let active = Arc::clone(&self.active);
        let window = self.window.clone();

        info!(
            frequency = self.frequency,
            buffer_size,
            period_ms = period.as_millis() as u64,
            "démarrage de la capture synthétique"
        );

        self.active.store(true, Ordering::Release);
        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut position: u64 = 0;

            loop {
                ticker.tick().await;
                if !active.load(Ordering::Acquire) {
                    break;
                }

                let samples: Vec<f32> = (0..buffer_size as u64)
                    .map(|i| amplitude * (step * (position + i) as f32).sin())
                    .collect();
                position += buffer_size as u64;

                window.push(&samples);
                on_buffer(SampleBuffer::new(samples, sample_rate));
            }
        }));
        self.monitor = Some(LevelMonitor::spawn(self.window.clone(), self.config.level_interval));

        Ok(())
    }

    async fn stop(&mut self) -> AudioResult<()> {
        self.active.store(false, Ordering::Release);
        self.monitor = None;

        if let Some(task) = self.task.take() {
            task.abort();
            // Attend la fin effective : aucun callback ne part après le retour
            let _ = task.await;
            debug!("capture synthétique arrêtée");
        }
        self.window.clear();
        Ok(())
    }

    fn is_recording(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn level(&self) -> Option<watch::Receiver<u8>> {
        self.monitor.as_ref().map(LevelMonitor::subscribe)
    }

    fn device_info(&self) -> String {
        format!("Sinusoïde {} Hz", self.frequency)
    }
}

/// Trace d'un rendu effectué par `MemorySink`
#[derive(Clone, Debug)]
pub struct RenderRecord {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub started: Instant,
    pub finished: Instant,
}

#[derive(Debug, Default)]
struct MemorySinkState {
    records: Vec<RenderRecord>,
    latencies: VecDeque<Duration>,
}

/// Sortie audio en mémoire
///
/// Les clones partagent le même journal : on garde un clone dans le test
/// et on donne l'autre (ou la fabrique) au code testé.
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    state: Arc<Mutex<MemorySinkState>>,
    realtime: bool,
    created: Arc<AtomicUsize>,
}

impl MemorySink {
    /// Rendu instantané
    pub fn new() -> Self {
        Self::default()
    }

    /// Rendu qui prend la durée réelle des échantillons
    pub fn realtime() -> Self {
        Self {
            realtime: true,
            ..Self::default()
        }
    }

    /// Durées de rendu imposées, une par appel, dans l'ordre
    pub fn with_latencies(latencies: impl IntoIterator<Item = Duration>) -> Self {
        let sink = Self::default();
        if let Ok(mut state) = sink.state.lock() {
            state.latencies = latencies.into_iter().collect();
        }
        sink
    }

    /// Copie du journal des rendus
    pub fn records(&self) -> Vec<RenderRecord> {
        self.state
            .lock()
            .map(|state| state.records.clone())
            .unwrap_or_default()
    }

    /// Nombre de sorties créées via `SinkFactory`
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    fn next_latency(&self, sample_count: usize, sample_rate: u32) -> Duration {
        let scripted = self
            .state
            .lock()
            .ok()
            .and_then(|mut state| state.latencies.pop_front());

        match scripted {
            Some(latency) => latency,
            None if self.realtime && sample_rate > 0 => {
                Duration::from_secs_f64(sample_count as f64 / sample_rate as f64)
            }
            None => Duration::ZERO,
        }
    }
}

#[async_trait]
impl AudioSink for MemorySink {
    async fn render(&mut self, samples: &[f32], sample_rate: u32) -> AudioResult<()> {
        let started = Instant::now();
        let latency = self.next_latency(samples.len(), sample_rate);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let record = RenderRecord {
            samples: samples.to_vec(),
            sample_rate,
            started,
            finished: Instant::now(),
        };
        self.state
            .lock()
            .map_err(|_| AudioError::PlaybackError("journal de rendu empoisonné".to_string()))?
            .records
            .push(record);
        Ok(())
    }

    fn device_info(&self) -> String {
        "Sortie mémoire".to_string()
    }
}

impl SinkFactory for MemorySink {
    fn create(&self) -> AudioResult<Box<dyn AudioSink>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn test_synthetic_capture_cadence() {
        let config = AudioConfig::test_config(); // 240 échantillons = 10ms
        let mut capture = SyntheticCapture::new(config);
        let (tx, mut rx) = mpsc::unbounded_channel();

        capture
            .start(Box::new(move |buffer| {
                let _ = tx.send(buffer);
            }))
            .await
            .unwrap();
        assert!(capture.is_recording());

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.len(), 240);
        assert_eq!(second.len(), 240);
        assert!(first.rms_level() > 0.1);

        capture.stop().await.unwrap();
        assert!(!capture.is_recording());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_buffer_after_stop() {
        let mut capture = SyntheticCapture::new(AudioConfig::test_config());
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&delivered);

        capture
            .start(Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(55)).await;
        capture.stop().await.unwrap();
        let at_stop = delivered.load(Ordering::SeqCst);
        assert!(at_stop >= 4);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(delivered.load(Ordering::SeqCst), at_stop);

        // Arrêts répétés sans effet
        capture.stop().await.unwrap();
        capture.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_tone() {
        let mut capture = SyntheticCapture::new(AudioConfig::test_config()).with_tone(1000.0, 2.0);
        assert_eq!(capture.device_info(), "Sinusoïde 1000 Hz");

        let (tx, mut rx) = mpsc::unbounded_channel();
        capture
            .start(Box::new(move |buffer| {
                let _ = tx.send(buffer);
            }))
            .await
            .unwrap();

        // Amplitude ramenée à 1.0 : RMS d'une sinusoïde pleine échelle
        let buffer = rx.recv().await.unwrap();
        assert!((buffer.rms_level() - std::f32::consts::FRAC_1_SQRT_2).abs() < 0.02);
        capture.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unavailable_capture_never_delivers() {
        let mut capture = SyntheticCapture::unavailable(AudioConfig::test_config(), "permission refusée");
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&delivered);

        let result = capture
            .start(Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .await;

        assert!(matches!(result, Err(AudioError::CaptureUnavailable(_))));
        assert!(!capture.is_recording());
        assert!(capture.level().is_none());
        assert_eq!(delivered.load(Ordering::SeqCst), 0);
        assert!(capture.stop().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_sink_latencies() {
        let sink = MemorySink::with_latencies([Duration::from_millis(30)]);
        let mut boxed = sink.create().unwrap();

        boxed.render(&[0.1, 0.2], 24000).await.unwrap();
        boxed.render(&[0.3], 24000).await.unwrap();

        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].finished - records[0].started, Duration::from_millis(30));
        assert_eq!(records[1].finished, records[1].started);
        assert_eq!(sink.created_count(), 1);
    }
}
