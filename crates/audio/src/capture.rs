//! Module de capture audio utilisant cpal
//!
//! Ce module implémente le trait AudioCapture en utilisant la librairie cpal
//! (Cross-Platform Audio Library) pour capturer l'audio depuis le microphone.
//!
//! Le périphérique n'est acquis qu'au démarrage de la capture : créer un
//! `CpalCapture` ne touche pas au matériel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample as _, SampleFormat, SizedSample, Stream, StreamConfig, SupportedStreamConfig};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::level::{LevelMonitor, LevelWindow};
use crate::{AudioCapture, AudioConfig, AudioError, AudioResult, SampleBuffer, SampleCallback};

/// Implémentation de capture audio avec cpal
///
/// Cette structure gère :
/// - La découverte du microphone au démarrage
/// - Le mixage mono et la conversion f32/i16/u16 vers f32
/// - Le découpage en buffers de taille constante
/// - Le moniteur de niveau
///
/// # Architecture thread
///
/// cpal fonctionne avec des callbacks sur un thread temps réel. Le callback
/// accumule les échantillons et appelle `on_buffer` pour chaque buffer complet,
/// après avoir vérifié un drapeau atomique : une fois `stop()` revenu, plus
/// aucun buffer n'est livré.
pub struct CpalCapture {
    /// Configuration audio de notre application
    config: AudioConfig,

    /// Stream audio actif (None si arrêté)
    stream: Option<Stream>,

    /// Drapeau vérifié par le callback avant chaque livraison
    active: Arc<AtomicBool>,

    /// Derniers échantillons pour le moniteur de niveau
    window: LevelWindow,

    /// Tâche de publication du niveau (None si arrêté)
    monitor: Option<LevelMonitor>,

    /// Nom du périphérique pour debug
    device_name: Option<String>,
}

impl CpalCapture {
    /// Crée une nouvelle instance de capture, sans ouvrir le périphérique
    pub fn new(config: AudioConfig) -> Self {
        Self {
            config,
            stream: None,
            active: Arc::new(AtomicBool::new(false)),
            window: LevelWindow::new(),
            monitor: None,
            device_name: None,
        }
    }

    /// Trouve le micro par défaut et une configuration compatible
    fn acquire_device(&self) -> AudioResult<(Device, SupportedStreamConfig)> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or_else(|| AudioError::CaptureUnavailable("aucun microphone".to_string()))?;

        let configs = device
            .supported_input_configs()
            .map_err(|e| AudioError::CaptureUnavailable(format!("configs indisponibles: {}", e)))?;

        let rate = self.config.sample_rate;
        let mut candidates: Vec<_> = configs
            .filter(|range| range.min_sample_rate() <= rate && rate <= range.max_sample_rate())
            .filter(|range| {
                matches!(
                    range.sample_format(),
                    SampleFormat::F32 | SampleFormat::I16 | SampleFormat::U16
                )
            })
            .collect();

        // Préfère le mono natif, sinon le moins de canaux possible
        candidates.sort_by_key(|range| range.channels());

        let supported = candidates
            .into_iter()
            .next()
            .map(|range| range.with_sample_rate(rate))
            .ok_or_else(|| {
                AudioError::CaptureUnavailable(format!("{} Hz non supporté par le microphone", rate))
            })?;

        Ok((device, supported))
    }

    /// Construit le stream selon le format d'échantillons du périphérique
    fn build_stream(
        &self,
        device: &Device,
        supported: &SupportedStreamConfig,
        on_buffer: SampleCallback,
    ) -> AudioResult<Stream> {
        let config = supported.config();
        let stream = match supported.sample_format() {
            SampleFormat::F32 => self.build_typed_stream::<f32>(device, &config, on_buffer),
            SampleFormat::I16 => self.build_typed_stream::<i16>(device, &config, on_buffer),
            SampleFormat::U16 => self.build_typed_stream::<u16>(device, &config, on_buffer),
            other => {
                return Err(AudioError::CaptureUnavailable(format!(
                    "format d'échantillon non supporté: {:?}",
                    other
                )));
            }
        };

        stream.map_err(|e| AudioError::CaptureUnavailable(format!("construction du stream: {}", e)))
    }

    fn build_typed_stream<T>(
        &self,
        device: &Device,
        config: &StreamConfig,
        mut on_buffer: SampleCallback,
    ) -> Result<Stream, cpal::BuildStreamError>
    where
        T: SizedSample,
        f32: FromSample<T>,
    {
        let channels = config.channels.max(1) as usize;
        let buffer_size = self.config.buffer_size;
        let sample_rate = self.config.sample_rate;
        let active = Arc::clone(&self.active);
        let window = self.window.clone();

        let mut pending: Vec<f32> = Vec::with_capacity(buffer_size);
        let mut mono: Vec<f32> = Vec::with_capacity(buffer_size);

        device.build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                if !active.load(Ordering::Acquire) {
                    pending.clear();
                    return;
                }

                // Mixage mono : moyenne des canaux de chaque frame
                mono.clear();
                mono.extend(data.chunks(channels).map(|frame| {
                    frame.iter().map(|&s| f32::from_sample(s)).sum::<f32>() / frame.len() as f32
                }));
                window.push(&mono);

                for &sample in &mono {
                    pending.push(sample);
                    if pending.len() == buffer_size {
                        let samples = std::mem::replace(&mut pending, Vec::with_capacity(buffer_size));
                        if active.load(Ordering::Acquire) {
                            on_buffer(SampleBuffer::new(samples, sample_rate));
                        }
                    }
                }
            },
            move |err| {
                warn!(error = %err, "erreur du stream de capture");
            },
            None,
        )
    }
}

#[async_trait]
impl AudioCapture for CpalCapture {
    async fn start(&mut self, on_buffer: SampleCallback) -> AudioResult<()> {
        if self.is_recording() {
            debug!("capture déjà active, nouveau callback ignoré");
            return Ok(());
        }

        let (device, supported) = self.acquire_device()?;
        let device_name = device
            .description()
            .ok()
            .map(|desc| desc.name().to_string())
            .unwrap_or_else(|| "Périphérique inconnu".to_string());

        info!(
            device = %device_name,
            sample_rate = self.config.sample_rate,
            device_channels = supported.channels(),
            format = ?supported.sample_format(),
            buffer_size = self.config.buffer_size,
            echo_cancellation = self.config.echo_cancellation,
            noise_suppression = self.config.noise_suppression,
            auto_gain_control = self.config.auto_gain_control,
            "démarrage de la capture audio"
        );

        let stream = self.build_stream(&device, &supported, on_buffer)?;

        self.active.store(true, Ordering::Release);
        if let Err(e) = stream.play() {
            self.active.store(false, Ordering::Release);
            return Err(AudioError::CaptureUnavailable(format!("démarrage du stream: {}", e)));
        }

        self.stream = Some(stream);
        self.monitor = Some(LevelMonitor::spawn(self.window.clone(), self.config.level_interval));
        self.device_name = Some(device_name);

        Ok(())
    }

    async fn stop(&mut self) -> AudioResult<()> {
        // Ferme la porte avant de relâcher le stream
        let was_active = self.active.swap(false, Ordering::AcqRel);

        self.monitor = None;
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                debug!(error = %e, "pause du stream de capture impossible");
            }
        }
        self.window.clear();

        if was_active {
            info!("capture audio arrêtée");
        }
        Ok(())
    }

    fn is_recording(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn level(&self) -> Option<watch::Receiver<u8>> {
        self.monitor.as_ref().map(LevelMonitor::subscribe)
    }

    fn device_info(&self) -> String {
        self.device_name
            .clone()
            .unwrap_or_else(|| "Microphone non ouvert".to_string())
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.active.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::{Duration, timeout};

    #[test]
    fn test_capture_creation_does_not_touch_device() {
        let capture = CpalCapture::new(AudioConfig::default());

        assert!(!capture.is_recording());
        assert!(capture.level().is_none());
        assert_eq!(capture.device_info(), "Microphone non ouvert");
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let mut capture = CpalCapture::new(AudioConfig::default());

        // Avant tout démarrage
        assert!(capture.stop().await.is_ok());
        assert!(capture.stop().await.is_ok());
        assert!(!capture.is_recording());
    }

    #[tokio::test]
    async fn test_capture_start_stop() {
        let mut capture = CpalCapture::new(AudioConfig::default());

        // Peut échouer si aucun microphone n'est disponible
        match capture.start(Box::new(|_| {})).await {
            Ok(()) => {
                assert!(capture.is_recording());
                assert!(capture.level().is_some());

                capture.stop().await.unwrap();
                capture.stop().await.unwrap();
                assert!(!capture.is_recording());
                assert!(capture.level().is_none());
            }
            Err(AudioError::CaptureUnavailable(reason)) => {
                // Acceptable dans un environnement de test sans audio
                println!("⚠️  Pas de microphone disponible pour le test: {}", reason);
                assert!(!capture.is_recording());
            }
            Err(e) => panic!("Erreur inattendue: {}", e),
        }
    }

    // Note: Ce test nécessite un vrai microphone
    #[tokio::test]
    #[ignore] // Ignore par défaut, lance avec --ignored pour tester
    async fn test_capture_delivers_fixed_size_buffers() {
        let mut capture = CpalCapture::new(AudioConfig::default());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&delivered);

        capture
            .start(Box::new(move |buffer| {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(buffer.len());
            }))
            .await
            .unwrap();

        let len = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(len, 4096);

        capture.stop().await.unwrap();
        let after_stop = delivered.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(delivered.load(Ordering::SeqCst), after_stop);
    }
}
