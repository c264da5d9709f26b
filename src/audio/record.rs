//! Capture pipeline: microphone → fixed-size frames → wire codec → transport.
//!
//! Runs on its own OS thread (not a tokio task) because device reads block.
//! Outbound sends go through a non-blocking sink; frames are never dropped here.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use anyhow::Result;
use tokio::sync::oneshot;

use super::audio_system::AudioSource;
use super::codec::{AudioFrame, EncodedFrame, encode_frame};

/// Receiver of encoded frames. Must not block.
pub trait FrameSink: Send + 'static {
    /// Returns `false` once the receiving side is gone.
    fn send_frame(&self, frame: EncodedFrame) -> bool;
}

pub struct CapturePipeline {
    running: Arc<AtomicBool>,
    record_handle: Option<JoinHandle<Box<dyn AudioSource>>>,
    fault_rx: Option<oneshot::Receiver<String>>,
}

impl CapturePipeline {
    /// Start pulling `frame_size`-sample frames from `source` and forwarding them to `sink`.
    ///
    /// The pipeline takes ownership of the source until [`CapturePipeline::stop`]
    /// hands it back.
    pub fn start<S: FrameSink>(
        source: Box<dyn AudioSource>,
        sample_rate: u32,
        frame_size: usize,
        sink: S,
    ) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let (fault_tx, fault_rx) = oneshot::channel();

        let record_handle = {
            let running = running.clone();
            thread::Builder::new()
                .name("audio-record".into())
                .spawn(move || {
                    let mut source = source;
                    if let Err(e) =
                        record_thread(source.as_mut(), sample_rate, frame_size, &sink, &running)
                    {
                        log::error!("Recording thread error: {:#}", e);
                        let _ = fault_tx.send(format!("{:#}", e));
                    }
                    source
                })?
        };

        Ok(Self {
            running,
            record_handle: Some(record_handle),
            fault_rx: Some(fault_rx),
        })
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
            && self
                .record_handle
                .as_ref()
                .is_some_and(|h| !h.is_finished())
    }

    /// Resolves with the cause if capture stops on a device error. Stays
    /// pending after a clean stop or a closed sink.
    pub async fn failure(&mut self) -> String {
        if let Some(rx) = self.fault_rx.as_mut() {
            let outcome = rx.await;
            self.fault_rx = None;
            if let Ok(cause) = outcome {
                return cause;
            }
        }
        std::future::pending().await
    }

    /// Signal the thread to stop, wait for it, and return the detached source.
    ///
    /// Returns `None` if already stopped or if the thread panicked.
    pub fn stop(&mut self) -> Option<Box<dyn AudioSource>> {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.record_handle.take()?;
        match handle.join() {
            Ok(source) => Some(source),
            Err(_) => {
                log::error!("Recording thread panicked");
                None
            }
        }
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn record_thread<S: FrameSink>(
    source: &mut dyn AudioSource,
    sample_rate: u32,
    frame_size: usize,
    sink: &S,
    running: &AtomicBool,
) -> Result<()> {
    let frame_size = frame_size.max(1);
    let mut accum_buf: Vec<f32> = Vec::with_capacity(frame_size * 2);
    let mut read_buf = vec![0f32; frame_size];

    log::info!(
        "Recording started: rate={}, frame_size={}",
        sample_rate,
        frame_size,
    );

    while running.load(Ordering::Relaxed) {
        let n = source.read(&mut read_buf)?;
        accum_buf.extend_from_slice(&read_buf[..n]);

        while accum_buf.len() >= frame_size {
            let frame = AudioFrame {
                samples: accum_buf.drain(..frame_size).collect(),
                sample_rate,
            };
            if !sink.send_frame(encode_frame(&frame)) {
                log::warn!("Outbound audio receiver dropped, stopping capture");
                return Ok(());
            }
        }
    }

    log::info!("Recording stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::decode_base64;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::mpsc;

    impl FrameSink for mpsc::UnboundedSender<EncodedFrame> {
        fn send_frame(&self, frame: EncodedFrame) -> bool {
            self.send(frame).is_ok()
        }
    }

    /// Produces a ramp in small reads, like a device period.
    struct RampSource {
        next: usize,
        chunk: usize,
        dropped: Arc<AtomicUsize>,
    }

    impl AudioSource for RampSource {
        fn read(&mut self, buf: &mut [f32]) -> Result<usize> {
            thread::sleep(Duration::from_millis(1));
            let n = self.chunk.min(buf.len());
            for s in buf[..n].iter_mut() {
                *s = (self.next % 100) as f32 / 100.0;
                self.next += 1;
            }
            Ok(n)
        }
    }

    impl Drop for RampSource {
        fn drop(&mut self) {
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn ramp(dropped: &Arc<AtomicUsize>) -> Box<dyn AudioSource> {
        Box::new(RampSource {
            next: 0,
            chunk: 100,
            dropped: dropped.clone(),
        })
    }

    #[tokio::test]
    async fn frames_are_fixed_size_and_in_order() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut pipeline = CapturePipeline::start(ramp(&dropped), 16000, 256, tx).unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        pipeline.stop();

        assert_eq!(first.mime_type, "audio/pcm;rate=16000");
        assert_eq!(decode_base64(&first.data).unwrap().len(), 256 * 2);
        assert_eq!(decode_base64(&second.data).unwrap().len(), 256 * 2);
        assert_ne!(first.data, second.data);
    }

    #[tokio::test]
    async fn stop_returns_source_and_is_idempotent() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut pipeline = CapturePipeline::start(ramp(&dropped), 16000, 64, tx).unwrap();
        assert!(pipeline.is_running());

        let source = pipeline.stop();
        assert!(source.is_some());
        assert!(!pipeline.is_running());
        drop(source);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);

        assert!(pipeline.stop().is_none());
    }

    struct BrokenSource;

    impl AudioSource for BrokenSource {
        fn read(&mut self, _buf: &mut [f32]) -> Result<usize> {
            anyhow::bail!("device unplugged")
        }
    }

    #[tokio::test]
    async fn device_error_is_reported() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut pipeline = CapturePipeline::start(Box::new(BrokenSource), 16000, 64, tx).unwrap();

        let cause = tokio::time::timeout(Duration::from_secs(1), pipeline.failure())
            .await
            .unwrap();
        assert!(cause.contains("device unplugged"));
        assert!(pipeline.stop().is_some());
    }

    #[tokio::test]
    async fn clean_stop_reports_no_failure() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut pipeline = CapturePipeline::start(ramp(&dropped), 16000, 64, tx).unwrap();
        pipeline.stop();

        let waited = tokio::time::timeout(Duration::from_millis(20), pipeline.failure()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn closed_receiver_ends_capture() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let mut pipeline = CapturePipeline::start(ramp(&dropped), 16000, 64, tx).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pipeline.is_running());
        assert!(pipeline.stop().is_some());
    }
}
