//! audio - Microphone capture, PCM wire codec, and gapless scheduled playback
//!
//! Uses ALSA for audio I/O. Capture and playback each run on a dedicated OS
//! thread; everything else is driven from the session's event loop.

mod alsa_device;
mod audio_system;
pub mod codec;
pub mod play;
pub mod record;

pub use audio_system::{AlsaDevices, AudioConfig, AudioDevices, AudioSource, OutputDevice};
#[cfg(test)]
pub use audio_system::VoiceControl;
pub use play::PlaybackScheduler;
pub use record::{CapturePipeline, FrameSink};
