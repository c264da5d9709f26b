//! Device seams for the live session.
//!
//! The session controller acquires devices only through [`AudioDevices`]; the
//! capture pipeline and playback scheduler see them as [`AudioSource`] and
//! [`OutputDevice`]. ALSA backs all three in production.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;

use super::alsa_device::{AlsaMicrophone, AlsaOutput};
use super::codec::SampleBuffer;
use crate::config::Config;

/// Audio system configuration.
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// ALSA capture device name (e.g. "default", "plughw:0,0")
    pub capture_device: String,
    /// ALSA playback device name
    pub playback_device: String,
    /// Microphone rate, also the outbound wire rate
    pub input_sample_rate: u32,
    /// Playback device rate
    pub output_sample_rate: u32,
    /// Samples per captured frame
    pub frame_size: usize,
    /// Desired ALSA playback period size (0 = let ALSA decide)
    pub playback_period_size: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            capture_device: "default".to_string(),
            playback_device: "default".to_string(),
            input_sample_rate: 16000,
            output_sample_rate: 24000,
            frame_size: 4096,
            playback_period_size: 1024,
        }
    }
}

impl From<&Config> for AudioConfig {
    fn from(config: &Config) -> Self {
        Self {
            capture_device: config.capture_device.to_string(),
            playback_device: config.playback_device.to_string(),
            input_sample_rate: config.input_sample_rate,
            output_sample_rate: config.output_sample_rate,
            frame_size: config.frame_size,
            playback_period_size: config.playback_period_size,
        }
    }
}

/// A microphone delivering mono f32 samples.
pub trait AudioSource: Send {
    /// Block until some samples are available and copy them into `buf`.
    /// Returns the number of samples written.
    fn read(&mut self, buf: &mut [f32]) -> Result<usize>;
}

/// Shared flags between a scheduled voice and the device playing it.
#[derive(Debug, Clone, Default)]
pub struct VoiceControl {
    cancelled: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
}

impl VoiceControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn mark_finished(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

/// An output device that plays buffers at absolute times on its own clock.
pub trait OutputDevice: Send {
    /// Monotonic device clock: the earliest time a newly queued buffer can
    /// still be played in full.
    fn current_time(&self) -> Duration;

    /// Queue `buffer` to start at `start` on the device clock. Returns the
    /// start actually used, which is later than `start` only if the clock has
    /// already passed it.
    fn schedule(&mut self, buffer: &SampleBuffer, start: Duration, control: VoiceControl) -> Result<Duration>;

    /// Stop output and release the device. Idempotent.
    fn close(&mut self) -> Result<()>;
}

/// Acquisition of the hardware used by one session.
pub trait AudioDevices: Send + Sync {
    fn open_microphone(&self, sample_rate: u32) -> Result<Box<dyn AudioSource>>;
    fn open_output(&self, sample_rate: u32) -> Result<Box<dyn OutputDevice>>;
}

/// ALSA-backed devices.
pub struct AlsaDevices {
    config: AudioConfig,
}

impl AlsaDevices {
    pub fn new(config: AudioConfig) -> Self {
        Self { config }
    }
}

impl AudioDevices for AlsaDevices {
    fn open_microphone(&self, sample_rate: u32) -> Result<Box<dyn AudioSource>> {
        let mic = AlsaMicrophone::open(&self.config.capture_device, sample_rate)?;
        Ok(Box::new(mic))
    }

    fn open_output(&self, sample_rate: u32) -> Result<Box<dyn OutputDevice>> {
        let period_size = if self.config.playback_period_size > 0 {
            Some(self.config.playback_period_size)
        } else {
            None
        };
        let output = AlsaOutput::open(&self.config.playback_device, sample_rate, period_size)?;
        Ok(Box::new(output))
    }
}
