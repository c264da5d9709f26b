//! PCM wire codec.
//!
//! - Encoder: normalized f32 frame → 16-bit little-endian PCM → base64
//! - Decoder: raw 16-bit little-endian PCM bytes → normalized f32 sample buffer

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use std::time::Duration;
use thiserror::Error;

/// Bytes per sample on the wire (16-bit PCM).
pub const BYTES_PER_SAMPLE: usize = 2;

#[derive(Debug, Error, PartialEq)]
pub enum CodecError {
    #[error("chunk of {len} bytes is not a multiple of the {frame}-byte sample frame")]
    MisalignedChunk { len: usize, frame: usize },
    #[error("invalid channel count: {0}")]
    InvalidChannels(u16),
    #[error("invalid sample rate: {0}")]
    InvalidSampleRate(u32),
    #[error("invalid base64 payload: {0}")]
    InvalidBase64(String),
}

/// One frame of captured microphone audio, mono, normalized to [-1.0, 1.0].
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// An outbound audio frame ready for the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedFrame {
    /// base64 of 16-bit little-endian PCM
    pub data: String,
    pub mime_type: String,
}

/// Decoded inbound audio, interleaved when `channels > 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl SampleBuffer {
    /// Number of sample frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    pub fn duration(&self) -> Duration {
        frames_to_duration(self.frames() as u64, self.sample_rate)
    }

    /// Root-mean-square level over all samples.
    pub fn rms(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum: f32 = self.samples.iter().map(|s| s * s).sum();
        (sum / self.samples.len() as f32).sqrt()
    }

    /// Mix down to mono and linearly resample to `target_rate`.
    pub fn to_mono_at(&self, target_rate: u32) -> Vec<f32> {
        let channels = self.channels.max(1) as usize;
        let mono: Vec<f32> = if channels == 1 {
            self.samples.clone()
        } else {
            self.samples
                .chunks_exact(channels)
                .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                .collect()
        };
        resample_linear(&mono, self.sample_rate, target_rate)
    }
}

/// Frame count to duration, rounded up to the next nanosecond.
///
/// Rounding up keeps `duration_to_frames(frames_to_duration(n, r), r) == n`,
/// and sums of chunk durations never land inside the previous chunk.
pub fn frames_to_duration(frames: u64, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    let nanos = (frames as u128 * 1_000_000_000).div_ceil(sample_rate as u128);
    Duration::from_nanos(nanos as u64)
}

/// Duration to frame count, rounding down.
pub fn duration_to_frames(duration: Duration, sample_rate: u32) -> u64 {
    (duration.as_nanos() * sample_rate as u128 / 1_000_000_000) as u64
}

pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

/// Convert a normalized sample to 16-bit PCM, clamping out-of-range input.
fn to_i16(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

/// Encode a captured frame for the transport.
pub fn encode_frame(frame: &AudioFrame) -> EncodedFrame {
    let mut pcm = Vec::with_capacity(frame.samples.len() * BYTES_PER_SAMPLE);
    for &s in &frame.samples {
        pcm.extend_from_slice(&to_i16(s).to_le_bytes());
    }
    EncodedFrame {
        data: B64.encode(&pcm),
        mime_type: pcm_mime_type(frame.sample_rate),
    }
}

/// Decode raw 16-bit little-endian PCM into a playable buffer.
///
/// Pure function. The byte length must be a whole number of sample frames.
pub fn decode_pcm16(data: &[u8], sample_rate: u32, channels: u16) -> Result<SampleBuffer, CodecError> {
    if channels == 0 {
        return Err(CodecError::InvalidChannels(channels));
    }
    if sample_rate == 0 {
        return Err(CodecError::InvalidSampleRate(sample_rate));
    }
    let frame = BYTES_PER_SAMPLE * channels as usize;
    if data.len() % frame != 0 {
        return Err(CodecError::MisalignedChunk {
            len: data.len(),
            frame,
        });
    }
    let samples = data
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
        .collect();
    Ok(SampleBuffer {
        samples,
        sample_rate,
        channels,
    })
}

pub fn decode_base64(data: &str) -> Result<Vec<u8>, CodecError> {
    B64.decode(data)
        .map_err(|e| CodecError::InvalidBase64(e.to_string()))
}

/// Linear-interpolation resampler for mono signals.
pub fn resample_linear(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || input.is_empty() || from_rate == 0 || to_rate == 0 {
        return input.to_vec();
    }
    let out_len = (input.len() as u64 * to_rate as u64 / from_rate as u64) as usize;
    let step = from_rate as f64 / to_rate as f64;
    let last = input.len() - 1;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = pos.floor() as usize;
            let frac = (pos - idx as f64) as f32;
            let a = input[idx.min(last)];
            let b = input[(idx + 1).min(last)];
            a + (b - a) * frac
        })
        .collect()
}
