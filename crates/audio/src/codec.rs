//! Encodage PCM16 / base64 des échantillons audio
//!
//! Le service distant échange de l'audio PCM 16 bits little-endian, mono,
//! transporté en base64 dans des messages JSON. Ce module fait la conversion
//! dans les deux sens, et emballe les fragments reçus dans un conteneur WAV
//! minimal pour la lecture.
//!
//! Quantification (asymétrique, comme l'API Web Audio) :
//! - positif : `sample * 32767`
//! - négatif : `sample * 32768`

use std::io::{Cursor, Write};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use base64::write::EncoderStringWriter;

use crate::{AudioError, AudioResult, PlaybackFragment, SampleBuffer, WireFrame};

/// Taille des morceaux d'octets passés à l'encodeur base64
///
/// La conversion est faite par blocs pour borner la mémoire de travail,
/// quelle que soit la taille du buffer.
pub const ENCODE_CHUNK_BYTES: usize = 32 * 1024;

/// Convertit un échantillon flottant en entier 16 bits
///
/// L'échantillon est d'abord écrêté dans [-1, 1].
pub fn quantize(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

/// Conversion inverse de [`quantize`]
pub fn dequantize(value: i16) -> f32 {
    if value < 0 {
        value as f32 / 32768.0
    } else {
        value as f32 / 32767.0
    }
}

/// Encodeur sans état des buffers de capture
///
/// `Copy`, `Send` et `Sync` : une instance peut être déplacée dans le
/// callback de capture sans synchronisation.
#[derive(Clone, Copy, Debug, Default)]
pub struct SampleEncoder;

impl SampleEncoder {
    pub fn new() -> Self {
        Self
    }

    /// Encode un buffer en trame prête pour le réseau
    ///
    /// # Erreurs
    /// - `AudioError::EncodeFailure` : buffer vide ou échantillon non fini
    ///
    /// # Example
    /// ```rust
    /// use audio::{SampleBuffer, SampleEncoder};
    ///
    /// let buffer = SampleBuffer::new(vec![0.0, 1.0, -1.0], 24000);
    /// let frame = SampleEncoder::new().encode(&buffer).unwrap();
    /// assert_eq!(frame.audio, "AAD/fwCA");
    /// ```
    pub fn encode(&self, buffer: &SampleBuffer) -> AudioResult<WireFrame> {
        if buffer.is_empty() {
            return Err(AudioError::EncodeFailure("buffer vide".to_string()));
        }

        if let Some(index) = buffer.samples.iter().position(|s| !s.is_finite()) {
            return Err(AudioError::EncodeFailure(format!(
                "échantillon non fini à l'index {}",
                index
            )));
        }

        let mut writer = EncoderStringWriter::new(&STANDARD);
        let mut chunk = Vec::with_capacity(ENCODE_CHUNK_BYTES.min(buffer.len() * 2));

        for samples in buffer.samples.chunks(ENCODE_CHUNK_BYTES / 2) {
            chunk.clear();
            for &sample in samples {
                chunk.extend_from_slice(&quantize(sample).to_le_bytes());
            }
            writer
                .write_all(&chunk)
                .map_err(|e| AudioError::EncodeFailure(format!("base64: {}", e)))?;
        }

        Ok(WireFrame {
            audio: writer.into_inner(),
            sample_count: buffer.len(),
        })
    }
}

/// Décode une charge utile base64 en entiers PCM16
///
/// # Erreurs
/// - `AudioError::DecodeFailure` : base64 invalide ou nombre d'octets impair
pub fn decode_pcm16(payload: &str) -> AudioResult<Vec<i16>> {
    let bytes = STANDARD
        .decode(payload.trim())
        .map_err(|e| AudioError::DecodeFailure(format!("base64 invalide: {}", e)))?;

    if bytes.len() % 2 != 0 {
        return Err(AudioError::DecodeFailure(format!(
            "longueur PCM16 impaire: {} octets",
            bytes.len()
        )));
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Décode une charge utile base64 en échantillons flottants
pub fn decode_samples(payload: &str) -> AudioResult<Vec<f32>> {
    Ok(decode_pcm16(payload)?.into_iter().map(dequantize).collect())
}

/// Emballe des échantillons PCM16 dans un conteneur WAV mono 16 bits
pub fn wrap_wav(samples: &[i16], sample_rate: u32) -> AudioResult<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for &sample in samples {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
    }

    Ok(cursor.into_inner())
}

/// Chemin de décodage utilisé par la lecture : base64 → PCM16 → WAV
pub fn fragment_to_wav(fragment: &PlaybackFragment, sample_rate: u32) -> AudioResult<Vec<u8>> {
    let pcm = decode_pcm16(&fragment.payload)?;
    if pcm.is_empty() {
        return Err(AudioError::DecodeFailure(format!(
            "fragment #{} vide",
            fragment.sequence
        )));
    }
    wrap_wav(&pcm, sample_rate)
}

/// Relit un conteneur WAV mono 16 bits
///
/// Retourne les échantillons flottants et la fréquence déclarée par l'en-tête.
pub fn read_wav(bytes: &[u8]) -> AudioResult<(Vec<f32>, u32)> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();

    if spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
        return Err(AudioError::DecodeFailure(format!(
            "format WAV non supporté: {} bits",
            spec.bits_per_sample
        )));
    }

    let samples = reader
        .samples::<i16>()
        .map(|s| s.map(dequantize))
        .collect::<Result<Vec<_>, _>>()?;

    Ok((samples, spec.sample_rate))
}
