//! ALSA PCM device wrappers for audio capture and scheduled playback.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use alsa::pcm::{Access, HwParams, IoFormat, PCM};
use alsa::{Direction, ValueOr};
use anyhow::{Context, Result};

use super::audio_system::{AudioSource, OutputDevice, VoiceControl};
use super::codec::{SampleBuffer, duration_to_frames, frames_to_duration};

/// Parameters negotiated with the ALSA hardware.
#[derive(Debug, Clone)]
pub struct AlsaParams {
    /// Actual sample rate after negotiation
    pub sample_rate: u32,
    /// Actual number of channels
    pub channels: u32,
    /// Period size in frames
    pub period_size: usize,
}

/// Open a mono float PCM device for capture (recording).
pub fn open_capture(device: &str, sample_rate: u32) -> Result<(PCM, AlsaParams)> {
    open_pcm(device, Direction::Capture, sample_rate, None, "Capture")
}

/// Open a mono float PCM device for playback.
pub fn open_playback(
    device: &str,
    sample_rate: u32,
    period_size: Option<usize>,
) -> Result<(PCM, AlsaParams)> {
    open_pcm(device, Direction::Playback, sample_rate, period_size, "Playback")
}

fn open_pcm(
    device: &str,
    direction: Direction,
    sample_rate: u32,
    period_size: Option<usize>,
    dir_name: &str,
) -> Result<(PCM, AlsaParams)> {
    let pcm = PCM::new(device, direction, false)
        .with_context(|| format!("Failed to open PCM device '{}' for {}", device, dir_name))?;

    {
        let hwp =
            HwParams::any(&pcm).with_context(|| "Failed to initialize HwParams")?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(<f32 as IoFormat>::FORMAT)?;
        hwp.set_channels(1)?;
        hwp.set_rate_near(sample_rate, ValueOr::Nearest)?;
        if let Some(ps) = period_size {
            hwp.set_period_size_near(ps as alsa::pcm::Frames, ValueOr::Nearest)?;
        }
        pcm.hw_params(&hwp)?;
    }

    let (actual_rate, actual_channels, period_size) = {
        let hwp = pcm.hw_params_current()?;
        let rate = hwp.get_rate()?;
        let ch = hwp.get_channels()?;
        let ps = hwp.get_period_size()? as usize;
        (rate, ch, ps)
    };

    if actual_rate != sample_rate {
        anyhow::bail!(
            "ALSA {} device '{}' negotiated {} Hz instead of {} Hz",
            dir_name,
            device,
            actual_rate,
            sample_rate
        );
    }

    let params = AlsaParams {
        sample_rate: actual_rate,
        channels: actual_channels,
        period_size,
    };

    log::info!(
        "ALSA {}: device={}, rate={}, channels={}, period_size={}",
        dir_name,
        device,
        actual_rate,
        actual_channels,
        period_size,
    );

    Ok((pcm, params))
}

// ======================== Microphone ========================

pub struct AlsaMicrophone {
    pcm: PCM,
}

impl AlsaMicrophone {
    pub fn open(device: &str, sample_rate: u32) -> Result<Self> {
        let (pcm, _params) = open_capture(device, sample_rate)?;
        pcm.start().context("Failed to start PCM capture")?;
        Ok(Self { pcm })
    }
}

impl AudioSource for AlsaMicrophone {
    fn read(&mut self, buf: &mut [f32]) -> Result<usize> {
        let io = self.pcm.io_f32()?;
        match io.readi(buf) {
            Ok(frames) => Ok(frames),
            Err(e) => {
                log::warn!("ALSA capture error: {}, recovering...", e);
                self.pcm
                    .prepare()
                    .context("Failed to recover PCM capture")?;
                Ok(0)
            }
        }
    }
}

// ======================== Scheduled output ========================

struct Voice {
    start_frame: u64,
    samples: Vec<f32>,
    control: VoiceControl,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }

    /// Add the part of this voice that falls in `[pos, pos + out.len())` to `out`.
    fn mix_into(&self, pos: u64, out: &mut [f32]) {
        let from = self.start_frame.max(pos);
        let to = self.end_frame().min(pos + out.len() as u64);
        for frame in from..to {
            out[(frame - pos) as usize] += self.samples[(frame - self.start_frame) as usize];
        }
    }
}

struct Shared {
    voices: Mutex<Vec<Voice>>,
    /// First frame not yet mixed; the device clock. Only advanced while
    /// `voices` is locked.
    clock_frames: AtomicU64,
    running: AtomicBool,
}

impl Shared {
    fn new() -> Self {
        Self {
            voices: Mutex::new(Vec::new()),
            clock_frames: AtomicU64::new(0),
            running: AtomicBool::new(true),
        }
    }

    fn voices(&self) -> MutexGuard<'_, Vec<Voice>> {
        self.voices.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a voice, moving it up to the clock if it is already late so it
    /// is played whole. Returns the start frame used.
    fn push_voice(&self, start_frame: u64, samples: Vec<f32>, control: VoiceControl) -> u64 {
        let mut voices = self.voices();
        let start_frame = start_frame.max(self.clock_frames.load(Ordering::SeqCst));
        voices.push(Voice {
            start_frame,
            samples,
            control,
        });
        start_frame
    }

    /// Mix the next period into `out` and advance the clock past it.
    fn mix_period(&self, out: &mut [f32]) {
        let mut voices = self.voices();
        let pos = self.clock_frames.load(Ordering::SeqCst);
        let end = pos + out.len() as u64;
        out.fill(0.0);

        voices.retain(|voice| {
            if voice.control.is_cancelled() {
                return false;
            }
            voice.mix_into(pos, out);
            if voice.end_frame() <= end {
                voice.control.mark_finished();
                return false;
            }
            true
        });
        self.clock_frames.store(end, Ordering::SeqCst);
    }
}

/// Playback device that mixes scheduled voices on a dedicated thread.
pub struct AlsaOutput {
    shared: Arc<Shared>,
    sample_rate: u32,
    play_handle: Option<JoinHandle<()>>,
}

impl AlsaOutput {
    pub fn open(device: &str, sample_rate: u32, period_size: Option<usize>) -> Result<Self> {
        let (pcm, params) = open_playback(device, sample_rate, period_size)?;
        let shared = Arc::new(Shared::new());
        let actual_rate = params.sample_rate;

        let play_handle = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("audio-play".into())
                .spawn(move || {
                    if let Err(e) = play_thread(pcm, &params, &shared) {
                        log::error!("Playback thread error: {}", e);
                    }
                })?
        };

        Ok(Self {
            shared,
            sample_rate: actual_rate,
            play_handle: Some(play_handle),
        })
    }
}

impl OutputDevice for AlsaOutput {
    fn current_time(&self) -> Duration {
        frames_to_duration(self.shared.clock_frames.load(Ordering::SeqCst), self.sample_rate)
    }

    fn schedule(&mut self, buffer: &SampleBuffer, start: Duration, control: VoiceControl) -> Result<Duration> {
        if self.play_handle.is_none() {
            anyhow::bail!("playback device is closed");
        }
        let start_frame = self.shared.push_voice(
            duration_to_frames(start, self.sample_rate),
            buffer.to_mono_at(self.sample_rate),
            control,
        );
        Ok(frames_to_duration(start_frame, self.sample_rate))
    }

    fn close(&mut self) -> Result<()> {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.voices().clear();
        if let Some(h) = self.play_handle.take() {
            h.join()
                .map_err(|_| anyhow::anyhow!("playback thread panicked"))?;
            log::info!("Playback device closed");
        }
        Ok(())
    }
}

impl Drop for AlsaOutput {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("Failed to close playback device: {}", e);
        }
    }
}

fn play_thread(pcm: PCM, params: &AlsaParams, shared: &Shared) -> Result<()> {
    let io = pcm.io_f32()?;
    let period = params.period_size.max(1);
    let mut period_buf = vec![0f32; period];

    log::info!(
        "Playback started: rate={}, ch={}, period={}",
        params.sample_rate,
        params.channels,
        period,
    );

    while shared.running.load(Ordering::Relaxed) {
        shared.mix_period(&mut period_buf);

        // Write the period with a retry loop so short writes and XRUN
        // recovery never shift the clock.
        let mut frames_written = 0;
        let mut retry_count = 0u32;
        while frames_written < period {
            match io.writei(&period_buf[frames_written..]) {
                Ok(n) => {
                    frames_written += n;
                    retry_count = 0;
                }
                Err(e) => {
                    log::warn!("ALSA XRUN or error: {}, recovering...", e);
                    retry_count += 1;
                    pcm.prepare().context("Failed to recover PCM playback")?;
                    if retry_count >= 3 {
                        log::error!(
                            "Max recovery retries ({}) reached. Dropping {} unwritten frames.",
                            retry_count,
                            period - frames_written
                        );
                        break;
                    }
                }
            }
        }
    }

    log::info!("Playback stopped");
    Ok(())
}
