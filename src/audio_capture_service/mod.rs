//! Exclusive microphone access for the pipeline.
//!
//! A single [`AudioSource`] is shared by the wake-word detector (continuous
//! stream) and the speaker verifier (fixed clips). The source admits at most
//! one open capture; the second caller gets [`ActivationError::RecordingConflict`].

pub mod cpal_backend;

use std::{fmt, sync::Arc};

use serde::Serialize;

use crate::error::ActivationError;

pub use cpal_backend::CpalAudioSource;

pub const TARGET_SAMPLE_RATE_HZ: u32 = 16_000;
pub const TARGET_CHANNELS: u16 = 1;

#[derive(Debug, Clone)]
pub struct AudioInputChunk {
    pub pcm16_mono_samples: Vec<i16>,
    pub sample_rate_hz: u32,
}

pub type AudioInputChunkCallback = Arc<dyn Fn(AudioInputChunk) + Send + Sync + 'static>;

#[derive(Clone)]
pub enum CaptureMode {
    /// Continuous 16 kHz mono chunks for keyword spotting; nothing is buffered.
    Stream(AudioInputChunkCallback),
    /// Buffered recording returned as WAV on stop.
    Clip,
}

impl CaptureMode {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Stream(_) => "stream",
            Self::Clip => "clip",
        }
    }
}

impl fmt::Debug for CaptureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioSessionOptions {
    pub allow_recording_in_silent_mode: bool,
    pub sample_rate_hz: u32,
    pub channels: u16,
}

impl Default for AudioSessionOptions {
    fn default() -> Self {
        Self {
            allow_recording_in_silent_mode: false,
            sample_rate_hz: TARGET_SAMPLE_RATE_HZ,
            channels: TARGET_CHANNELS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedAudio {
    #[serde(skip)]
    pub wav_bytes: Vec<u8>,
    pub sample_rate_hz: u32,
    pub channels: u16,
    pub sample_count: usize,
    pub duration_ms: u64,
}

impl RecordedAudio {
    pub fn from_samples(samples: &[i16], sample_rate_hz: u32) -> Result<Self, ActivationError> {
        let wav_bytes = pcm16_to_wav_bytes(samples, sample_rate_hz, TARGET_CHANNELS)
            .map_err(ActivationError::Audio)?;
        let duration_ms = if sample_rate_hz == 0 {
            0
        } else {
            (samples.len() as u64 * 1000) / u64::from(sample_rate_hz)
        };

        Ok(Self {
            wav_bytes,
            sample_rate_hz,
            channels: TARGET_CHANNELS,
            sample_count: samples.len(),
            duration_ms,
        })
    }
}

pub trait AudioSource: Send + Sync + fmt::Debug {
    /// Applies platform audio-session options. Must be safe to call repeatedly.
    fn configure_session(&self, options: AudioSessionOptions) -> Result<(), ActivationError>;

    fn start_capture(&self, mode: CaptureMode) -> Result<(), ActivationError>;

    /// Closes the open capture and returns what it recorded. Stream captures
    /// return an empty clip.
    fn stop_capture(&self) -> Result<RecordedAudio, ActivationError>;

    /// Closes the open capture without producing audio. Returns `false` when
    /// nothing was open.
    fn abort_capture(&self) -> Result<bool, ActivationError>;

    fn is_capturing(&self) -> bool;
}

/// Stateful linear resampler; keeps its phase across chunk boundaries.
#[derive(Debug, Clone)]
pub(crate) struct LinearResampler {
    step: f64,
    position: f64,
    previous: Option<f32>,
}

impl LinearResampler {
    pub(crate) fn new(source_rate_hz: u32, target_rate_hz: u32) -> Self {
        Self {
            step: f64::from(source_rate_hz.max(1)) / f64::from(target_rate_hz.max(1)),
            position: 0.0,
            previous: None,
        }
    }

    pub(crate) fn is_passthrough(&self) -> bool {
        (self.step - 1.0).abs() < f64::EPSILON
    }

    pub(crate) fn push(&mut self, sample: f32, output: &mut Vec<f32>) {
        if self.is_passthrough() {
            output.push(sample);
            return;
        }

        let Some(previous) = self.previous else {
            self.previous = Some(sample);
            return;
        };

        while self.position < 1.0 {
            output.push(previous + (sample - previous) * self.position as f32);
            self.position += self.step;
        }
        self.position -= 1.0;
        self.previous = Some(sample);
    }
}

pub(crate) fn float_to_pcm16(sample: f32) -> i16 {
    let clamped = sample.clamp(-1.0, 1.0);
    if clamped <= -1.0 {
        i16::MIN
    } else if clamped >= 1.0 {
        i16::MAX
    } else {
        (clamped * i16::MAX as f32).round() as i16
    }
}

pub(crate) fn pcm16_to_wav_bytes(
    samples: &[i16],
    sample_rate_hz: u32,
    channels: u16,
) -> Result<Vec<u8>, String> {
    let bytes_per_sample = 2u16;
    let block_align = channels
        .checked_mul(bytes_per_sample)
        .ok_or_else(|| "WAV header block alignment overflow".to_string())?;
    let byte_rate = sample_rate_hz
        .checked_mul(u32::from(block_align))
        .ok_or_else(|| "WAV header byte rate overflow".to_string())?;
    let data_size = u32::try_from(samples.len())
        .ok()
        .and_then(|count| count.checked_mul(u32::from(bytes_per_sample)))
        .ok_or_else(|| "Audio clip is too long to encode as WAV".to_string())?;
    let riff_chunk_size = 36u32
        .checked_add(data_size)
        .ok_or_else(|| "WAV RIFF chunk overflow".to_string())?;

    let mut wav_bytes = Vec::with_capacity(44 + samples.len() * 2);
    wav_bytes.extend_from_slice(b"RIFF");
    wav_bytes.extend_from_slice(&riff_chunk_size.to_le_bytes());
    wav_bytes.extend_from_slice(b"WAVE");
    wav_bytes.extend_from_slice(b"fmt ");
    wav_bytes.extend_from_slice(&16u32.to_le_bytes());
    wav_bytes.extend_from_slice(&1u16.to_le_bytes());
    wav_bytes.extend_from_slice(&channels.to_le_bytes());
    wav_bytes.extend_from_slice(&sample_rate_hz.to_le_bytes());
    wav_bytes.extend_from_slice(&byte_rate.to_le_bytes());
    wav_bytes.extend_from_slice(&block_align.to_le_bytes());
    wav_bytes.extend_from_slice(&16u16.to_le_bytes());
    wav_bytes.extend_from_slice(b"data");
    wav_bytes.extend_from_slice(&data_size.to_le_bytes());
    for sample in samples {
        wav_bytes.extend_from_slice(&sample.to_le_bytes());
    }

    Ok(wav_bytes)
}
