// src/encode/audio.rs
//! RIFF/WAVE PCM decoding and frame-level acoustic statistics.
//!
//! Only 8-bit unsigned and 16-bit signed PCM are accepted. Other containers
//! are refused up front rather than half-decoded.

use crate::config::InputLimits;
use crate::error::{RiskError, RiskResult};
use crate::request::AudioClip;

/// Analysis frame length in seconds.
const FRAME_SECS: f64 = 0.02;
/// Frame RMS below this counts as silence.
pub const SILENCE_RMS: f64 = 0.01;

const COMPRESSED_EXTENSIONS: &[&str] = &["mp3", "mp4", "m4a", "aac", "ogg", "oga", "opus", "flac", "webm", "amr", "wma"];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WavFormat {
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioFeatures {
    pub duration_secs: f64,
    pub rms_energy: f64,
    /// Variance of per-frame RMS.
    pub energy_variance: f64,
    pub zero_crossing_rate: f64,
    pub silence_ratio: f64,
}

fn unsupported(what: impl std::fmt::Display) -> RiskError {
    RiskError::MalformedInput(format!("unsupported codec: {what}"))
}

fn u16_le(b: &[u8], at: usize) -> Option<u16> {
    b.get(at..at + 2).map(|s| u16::from_le_bytes([s[0], s[1]]))
}

fn u32_le(b: &[u8], at: usize) -> Option<u32> {
    b.get(at..at + 4)
        .map(|s| u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
}

/// Walks the RIFF chunks and returns the format plus the raw `data` bytes.
pub fn parse_wav(bytes: &[u8]) -> RiskResult<(WavFormat, &[u8])> {
    if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return Err(unsupported("expected RIFF/WAVE audio"));
    }
    let mut format: Option<WavFormat> = None;
    let mut data: Option<&[u8]> = None;
    let mut at = 12;
    while at + 8 <= bytes.len() {
        let id = &bytes[at..at + 4];
        let size = u32_le(bytes, at + 4).unwrap_or(0) as usize;
        let body_start = at + 8;
        let body_end = body_start.saturating_add(size).min(bytes.len());
        let body = &bytes[body_start..body_end];
        match id {
            b"fmt " => {
                let audio_format = u16_le(body, 0)
                    .ok_or_else(|| RiskError::MalformedInput("truncated fmt chunk".into()))?;
                if audio_format != 1 {
                    return Err(unsupported(format!("wave format tag {audio_format}")));
                }
                format = Some(WavFormat {
                    channels: u16_le(body, 2).unwrap_or(0),
                    sample_rate: u32_le(body, 4).unwrap_or(0),
                    bits_per_sample: u16_le(body, 14).unwrap_or(0),
                });
            }
            b"data" => data = Some(body),
            _ => {}
        }
        // Chunks are word aligned.
        at = body_start.saturating_add(size).saturating_add(size & 1);
    }

    let format = format.ok_or_else(|| RiskError::MalformedInput("wav has no fmt chunk".into()))?;
    if format.channels == 0 || format.sample_rate == 0 {
        return Err(RiskError::MalformedInput("wav header is inconsistent".into()));
    }
    if !matches!(format.bits_per_sample, 8 | 16) {
        return Err(unsupported(format!("{}-bit PCM", format.bits_per_sample)));
    }
    let data = data.ok_or_else(|| RiskError::MalformedInput("wav has no data chunk".into()))?;
    Ok((format, data))
}

/// Mixes interleaved PCM down to mono samples in `[-1, 1]`.
pub fn decode_mono(format: &WavFormat, data: &[u8]) -> Vec<f64> {
    let width = usize::from(format.bits_per_sample / 8);
    let channels = usize::from(format.channels);
    data.chunks_exact(width * channels)
        .map(|frame| {
            let sum: f64 = frame
                .chunks_exact(width)
                .map(|s| match width {
                    1 => (f64::from(s[0]) - 128.0) / 128.0,
                    _ => f64::from(i16::from_le_bytes([s[0], s[1]])) / 32768.0,
                })
                .sum();
            sum / channels as f64
        })
        .collect()
}

fn rms(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|s| s * s).sum::<f64>() / samples.len() as f64).sqrt()
}

pub fn acoustic_features(samples: &[f64], sample_rate: u32) -> AudioFeatures {
    let frame_len = ((f64::from(sample_rate) * FRAME_SECS) as usize).max(1);
    let frame_rms: Vec<f64> = samples.chunks(frame_len).map(rms).collect();
    let frames = frame_rms.len().max(1) as f64;
    let mean = frame_rms.iter().sum::<f64>() / frames;
    let energy_variance = frame_rms.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / frames;
    let silent = frame_rms.iter().filter(|r| **r < SILENCE_RMS).count() as f64;

    let crossings = samples
        .windows(2)
        .filter(|w| (w[0] >= 0.0) != (w[1] >= 0.0))
        .count();
    let zero_crossing_rate = if samples.len() > 1 {
        crossings as f64 / (samples.len() - 1) as f64
    } else {
        0.0
    };

    AudioFeatures {
        duration_secs: samples.len() as f64 / f64::from(sample_rate),
        rms_energy: rms(samples),
        energy_variance,
        zero_crossing_rate,
        silence_ratio: silent / frames,
    }
}

fn extension(file_name: &str) -> Option<String> {
    file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
}

/// Validates limits and container, then computes the acoustic features.
pub fn analyze(clip: &AudioClip, limits: &InputLimits) -> RiskResult<AudioFeatures> {
    if clip.bytes.is_empty() {
        return Err(RiskError::MalformedInput("audio file is empty".into()));
    }
    if clip.bytes.len() > limits.max_audio_bytes {
        return Err(RiskError::MalformedInput(format!(
            "audio exceeds {} bytes",
            limits.max_audio_bytes
        )));
    }
    if let Some(ext) = extension(&clip.file_name) {
        if COMPRESSED_EXTENSIONS.contains(&ext.as_str()) {
            return Err(unsupported(ext));
        }
    }

    let (format, data) = parse_wav(&clip.bytes)?;
    let samples = decode_mono(&format, data);
    if samples.is_empty() {
        return Err(RiskError::MalformedInput("audio contains no samples".into()));
    }
    let duration = samples.len() as f64 / f64::from(format.sample_rate);
    if duration > limits.max_audio_secs {
        return Err(RiskError::MalformedInput(format!(
            "audio longer than {} seconds",
            limits.max_audio_secs
        )));
    }
    Ok(acoustic_features(&samples, format.sample_rate))
}
