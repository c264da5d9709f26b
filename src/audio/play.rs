//! Gapless playback scheduling of inbound audio chunks.
//!
//! Chunks are placed back to back on the output device clock using a
//! monotonic "next start" cursor, so irregular network arrival never produces
//! gaps or overlaps. Every scheduled chunk is tracked until it finishes so an
//! interruption can cut all of them off at once.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::watch;

use super::audio_system::{OutputDevice, VoiceControl};
use super::codec::decode_pcm16;

/// One scheduled chunk on the output device.
#[derive(Debug, Clone)]
pub struct PlaybackHandle {
    pub id: u64,
    pub start: Duration,
    pub duration: Duration,
    control: VoiceControl,
}

impl PlaybackHandle {
    #[cfg(test)]
    pub fn end(&self) -> Duration {
        self.start + self.duration
    }

    pub fn cancel(&self) {
        self.control.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.control.is_finished()
    }

    #[cfg(test)]
    pub fn is_cancelled(&self) -> bool {
        self.control.is_cancelled()
    }
}

pub struct PlaybackScheduler {
    next_start: Duration,
    active: HashMap<u64, PlaybackHandle>,
    next_id: u64,
    level_tx: watch::Sender<f32>,
}

impl Default for PlaybackScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackScheduler {
    pub fn new() -> Self {
        let (level_tx, _) = watch::channel(0.0);
        Self {
            next_start: Duration::ZERO,
            active: HashMap::new(),
            next_id: 0,
            level_tx,
        }
    }

    /// Align the cursor with the device clock at connect time.
    pub fn reset_clock(&mut self, now: Duration) {
        self.next_start = now;
    }

    #[cfg(test)]
    pub fn next_start(&self) -> Duration {
        self.next_start
    }

    /// RMS level of the most recently scheduled chunk, for visualizers.
    pub fn subscribe_level(&self) -> watch::Receiver<f32> {
        self.level_tx.subscribe()
    }

    /// Number of chunks scheduled and not yet finished.
    #[cfg(test)]
    pub fn active_count(&self) -> usize {
        self.active.values().filter(|h| !h.is_finished()).count()
    }

    #[cfg(test)]
    pub fn active_handles(&self) -> impl Iterator<Item = &PlaybackHandle> {
        self.active.values()
    }

    /// Decode and schedule one chunk. Returns the handle, or `None` if the
    /// chunk was dropped (decode or device failure, or an empty chunk).
    pub fn schedule_chunk(
        &mut self,
        device: &mut dyn OutputDevice,
        data: &[u8],
        sample_rate: u32,
        channels: u16,
    ) -> Option<PlaybackHandle> {
        self.prune_finished();

        let buffer = match decode_pcm16(data, sample_rate, channels) {
            Ok(buffer) => buffer,
            Err(e) => {
                log::warn!("Dropping inbound audio chunk: {}", e);
                return None;
            }
        };
        if buffer.frames() == 0 {
            return None;
        }

        let requested = self.next_start.max(device.current_time());
        let duration = buffer.duration();
        let control = VoiceControl::new();
        let start = match device.schedule(&buffer, requested, control.clone()) {
            Ok(start) => start,
            Err(e) => {
                log::warn!("Failed to schedule audio chunk: {}", e);
                return None;
            }
        };

        let handle = PlaybackHandle {
            id: self.next_id,
            start,
            duration,
            control,
        };
        self.next_id += 1;
        self.next_start = start + duration;
        self.active.insert(handle.id, handle.clone());
        self.level_tx.send_replace(buffer.rms());

        log::debug!(
            "Scheduled chunk #{} at {:?} for {:?} ({} active)",
            handle.id,
            start,
            duration,
            self.active.len()
        );
        Some(handle)
    }

    /// Barge-in: cut off everything queued and restart the cursor.
    pub fn interrupt(&mut self) {
        let cancelled = self.cancel_all();
        self.next_start = Duration::ZERO;
        log::info!("Playback interrupted, cancelled {} chunk(s)", cancelled);
    }

    /// Cancel every active handle and clear the set.
    pub fn cancel_all(&mut self) -> usize {
        let count = self.active.len();
        for (_, handle) in self.active.drain() {
            handle.cancel();
        }
        self.level_tx.send_replace(0.0);
        count
    }

    fn prune_finished(&mut self) {
        self.active.retain(|_, h| !h.is_finished());
    }
}
