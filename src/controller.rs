use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use uuid::Uuid;

use crate::audio::{AudioConfig, AudioDevices, AudioSource, CapturePipeline, OutputDevice, PlaybackScheduler};
use crate::error::{SessionError, SessionResult};
use crate::net_link::{Connector, TransportLink};
use crate::protocol::{SessionSetup, WireMessage};
use crate::state_machine::{SessionEvent, SessionStatus};
use crate::transcript::{ConversationLog, TranscriptAggregator};

/// Owns one live voice session: its status, its hardware, its transport, and
/// all inbound processing. Every inbound event goes through
/// [`LiveSession::handle_message`] on the caller's task, so the playback set
/// and transcript buffers have a single writer.
pub struct LiveSession {
    setup: SessionSetup,
    audio: AudioConfig,
    connector: Arc<dyn Connector>,
    devices: Arc<dyn AudioDevices>,
    status_tx: watch::Sender<SessionStatus>,
    session_id: Option<Uuid>,

    scheduler: PlaybackScheduler,
    transcript: TranscriptAggregator,

    // 会话期间持有的资源，只在这里获取和释放
    output: Option<Box<dyn OutputDevice>>,
    microphone: Option<Box<dyn AudioSource>>,
    capture: Option<CapturePipeline>,
    transport: Option<TransportLink>,
}

impl LiveSession {
    pub fn new(
        setup: SessionSetup,
        audio: AudioConfig,
        connector: Arc<dyn Connector>,
        devices: Arc<dyn AudioDevices>,
    ) -> Self {
        let (status_tx, _) = watch::channel(SessionStatus::Disconnected);
        Self {
            setup,
            audio,
            connector,
            devices,
            status_tx,
            session_id: None,
            scheduler: PlaybackScheduler::new(),
            transcript: TranscriptAggregator::new(ConversationLog::new()),
            output: None,
            microphone: None,
            capture: None,
            transport: None,
        }
    }

    pub fn status(&self) -> SessionStatus {
        *self.status_tx.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status_tx.subscribe()
    }

    pub fn conversation_log(&self) -> ConversationLog {
        self.transcript.log().clone()
    }

    /// Playback amplitude for visualizers.
    pub fn subscribe_level(&self) -> watch::Receiver<f32> {
        self.scheduler.subscribe_level()
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.session_id
    }

    #[cfg(test)]
    pub fn active_playback_count(&self) -> usize {
        self.scheduler.active_count()
    }

    #[cfg(test)]
    pub fn pending_transcript(
        &self,
        speaker: crate::transcript::Speaker,
    ) -> crate::transcript::TranscriptItem {
        self.transcript.pending(speaker)
    }

    /// True while any device or the transport is still held.
    #[cfg(test)]
    pub fn holds_resources(&self) -> bool {
        self.output.is_some()
            || self.microphone.is_some()
            || self.capture.is_some()
            || self.transport.is_some()
    }

    /// Acquire devices, open the transport, and start streaming the microphone.
    ///
    /// Rejected while a session is connecting or connected. On failure every
    /// resource acquired so far is released and the status becomes `Error`.
    pub async fn start(&mut self) -> SessionResult<()> {
        let status = self.status();
        if !status.can_start() {
            log::warn!("Ignoring start while {}", status);
            return Err(SessionError::AlreadyActive);
        }

        let id = Uuid::new_v4();
        self.session_id = Some(id);
        self.scheduler.reset_clock(Duration::ZERO);
        self.transition(SessionEvent::Start);
        log::info!("Session {} starting", id);

        match self.acquire().await {
            Ok(()) => {
                self.transition(SessionEvent::OpenAck);
                log::info!("Session {} listening", id);
                Ok(())
            }
            Err(e) => {
                log::error!("Session {} failed to start: {}", id, e);
                self.teardown().await;
                self.transition(SessionEvent::Fault);
                Err(e)
            }
        }
    }

    async fn acquire(&mut self) -> SessionResult<()> {
        // 每一步获取后立即存入 self，若 start 被取消，stop 仍能释放
        let output = self
            .devices
            .open_output(self.audio.output_sample_rate)
            .map_err(|e| SessionError::Acquisition(format!("{:#}", e)))?;
        self.output = Some(output);

        let microphone = self
            .devices
            .open_microphone(self.audio.input_sample_rate)
            .map_err(|e| SessionError::Acquisition(format!("{:#}", e)))?;
        self.microphone = Some(microphone);

        let transport = self.connector.connect(&self.setup).await?;
        let outbound = transport.outbound();
        self.transport = Some(transport);

        let microphone = self
            .microphone
            .take()
            .ok_or_else(|| SessionError::Acquisition("microphone released while connecting".into()))?;
        let capture = CapturePipeline::start(
            microphone,
            self.audio.input_sample_rate,
            self.audio.frame_size,
            outbound,
        )
        .map_err(|e| SessionError::Acquisition(format!("{:#}", e)))?;
        self.capture = Some(capture);

        if let Some(output) = &self.output {
            self.scheduler.reset_clock(output.current_time());
        }
        Ok(())
    }

    /// Tear everything down and return to `Disconnected`. Safe from any
    /// state, including a start that was cancelled midway, and safe to repeat.
    pub async fn stop(&mut self) {
        let was = self.status();
        self.teardown().await;
        self.transition(SessionEvent::Stop);
        if was != SessionStatus::Disconnected {
            if let Some(id) = self.session_id {
                log::info!("Session {} stopped", id);
            }
        }
    }

    async fn fault(&mut self, cause: &str) {
        log::error!("Session fault: {}", cause);
        self.teardown().await;
        self.transition(SessionEvent::Fault);
    }

    /// Release order: capture, capture device, playback device, scheduled
    /// audio, transport, transcript buffers. No step is skipped when an
    /// earlier one fails.
    async fn teardown(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            match tokio::task::spawn_blocking(move || capture.stop()).await {
                Ok(source) => {
                    drop(source);
                    log::info!("Capture stopped, microphone released");
                }
                Err(e) => log::warn!("Failed to stop capture cleanly: {}", e),
            }
        }
        if let Some(microphone) = self.microphone.take() {
            drop(microphone);
            log::info!("Microphone released");
        }

        if let Some(mut output) = self.output.take() {
            if let Err(e) = output.close() {
                log::warn!("Failed to close playback device: {:#}", e);
            }
        }

        let cancelled = self.scheduler.cancel_all();
        if cancelled > 0 {
            log::debug!("Cancelled {} scheduled chunk(s)", cancelled);
        }
        self.scheduler.reset_clock(Duration::ZERO);

        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                log::warn!("Failed to close transport: {:#}", e);
            }
        }

        self.transcript.reset();
    }

    /// Next inbound event from the transport, or `None` if there is no open
    /// transport or it has gone away. A microphone that fails mid-session is
    /// reported as `Errored`.
    pub async fn next_message(&mut self) -> Option<WireMessage> {
        let transport = self.transport.as_mut()?;
        match self.capture.as_mut() {
            Some(capture) => tokio::select! {
                msg = transport.recv() => msg,
                cause = capture.failure() => {
                    Some(WireMessage::Errored(format!("microphone capture failed: {}", cause)))
                }
            },
            None => transport.recv().await,
        }
    }

    /// Apply one inbound event.
    pub async fn handle_message(&mut self, msg: WireMessage) {
        match msg {
            WireMessage::AudioChunk {
                data,
                sample_rate,
                channels,
            } => {
                if self.status() != SessionStatus::Connected {
                    log::debug!("Dropping audio chunk while {}", self.status());
                    return;
                }
                if let Some(output) = self.output.as_mut() {
                    self.scheduler
                        .schedule_chunk(output.as_mut(), &data, sample_rate, channels);
                }
            }
            WireMessage::InputTranscriptDelta(text) => self.transcript.push_input(&text),
            WireMessage::OutputTranscriptDelta(text) => self.transcript.push_output(&text),
            WireMessage::TurnComplete => {
                let committed = self.transcript.turn_complete();
                log::debug!("Turn complete, committed {} item(s)", committed);
            }
            WireMessage::Interrupted => {
                self.scheduler.interrupt();
                self.transcript.interrupt();
            }
            WireMessage::Closed => {
                log::info!("Remote closed the session");
                self.stop().await;
            }
            WireMessage::Errored(cause) => self.fault(&cause).await,
        }
    }

    /// Process inbound events until the session is no longer active.
    pub async fn run_until_closed(&mut self) {
        while self.status().is_active() {
            match self.next_message().await {
                Some(msg) => self.handle_message(msg).await,
                None => self.fault("inbound stream ended unexpectedly").await,
            }
        }
    }

    fn transition(&mut self, event: SessionEvent) {
        let current = self.status();
        match current.next(event) {
            Some(next) => {
                if next != current {
                    log::info!("Session status: {} -> {}", current, next);
                }
                self.status_tx.send_replace(next);
            }
            None => log::debug!("Ignoring {:?} while {}", event, current),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::play::tests::{FakeOutput, pcm_ms};
    use crate::audio::VoiceControl;
    use crate::audio::codec::SampleBuffer;
    use crate::net_link::NetCommand;
    use crate::transcript::Speaker;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Counters {
        mics: AtomicUsize,
        outputs: AtomicUsize,
    }

    struct FakeMic {
        counters: Arc<Counters>,
        broken: bool,
    }

    impl AudioSource for FakeMic {
        fn read(&mut self, buf: &mut [f32]) -> anyhow::Result<usize> {
            std::thread::sleep(Duration::from_millis(2));
            if self.broken {
                anyhow::bail!("capture device disappeared");
            }
            let n = buf.len().min(80);
            buf[..n].fill(0.1);
            Ok(n)
        }
    }

    impl Drop for FakeMic {
        fn drop(&mut self) {
            self.counters.mics.fetch_sub(1, Ordering::SeqCst);
        }
    }

    struct TrackedOutput {
        inner: FakeOutput,
        counters: Arc<Counters>,
    }

    impl OutputDevice for TrackedOutput {
        fn current_time(&self) -> Duration {
            self.inner.current_time()
        }

        fn schedule(&mut self, buffer: &SampleBuffer, start: Duration, control: VoiceControl) -> anyhow::Result<Duration> {
            self.inner.schedule(buffer, start, control)
        }

        fn close(&mut self) -> anyhow::Result<()> {
            self.inner.close()
        }
    }

    impl Drop for TrackedOutput {
        fn drop(&mut self) {
            self.counters.outputs.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeDevices {
        counters: Arc<Counters>,
        output: FakeOutput,
        mic_denied: AtomicBool,
        mic_breaks: AtomicBool,
    }

    impl AudioDevices for FakeDevices {
        fn open_microphone(&self, _sample_rate: u32) -> anyhow::Result<Box<dyn AudioSource>> {
            if self.mic_denied.load(Ordering::SeqCst) {
                anyhow::bail!("permission denied");
            }
            self.counters.mics.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeMic {
                counters: self.counters.clone(),
                broken: self.mic_breaks.load(Ordering::SeqCst),
            }))
        }

        fn open_output(&self, _sample_rate: u32) -> anyhow::Result<Box<dyn OutputDevice>> {
            self.counters.outputs.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(TrackedOutput {
                inner: self.output.clone(),
                counters: self.counters.clone(),
            }))
        }
    }

    impl FakeDevices {
        fn open_handles(&self) -> usize {
            self.counters.mics.load(Ordering::SeqCst) + self.counters.outputs.load(Ordering::SeqCst)
        }
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Mode {
        Open,
        Hang,
        Refuse,
        StuckClose,
    }

    type RemoteEnds = (mpsc::UnboundedReceiver<NetCommand>, mpsc::Sender<WireMessage>);

    struct FakeConnector {
        mode: Mode,
        remote: Mutex<Option<RemoteEnds>>,
    }

    impl FakeConnector {
        fn new(mode: Mode) -> Arc<Self> {
            Arc::new(Self {
                mode,
                remote: Mutex::new(None),
            })
        }

        fn remote(&self) -> RemoteEnds {
            self.remote.lock().unwrap().take().expect("transport not opened")
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(&self, _setup: &SessionSetup) -> SessionResult<TransportLink> {
            match self.mode {
                Mode::Hang => std::future::pending().await,
                Mode::Refuse => Err(SessionError::Transport("connection refused".into())),
                Mode::Open | Mode::StuckClose => {
                    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
                    let (tx, rx) = mpsc::channel(16);
                    *self.remote.lock().unwrap() = Some((cmd_rx, tx));
                    let task = (self.mode == Mode::StuckClose)
                        .then(|| tokio::spawn(std::future::pending::<()>()));
                    Ok(TransportLink::new(cmd_tx, rx, task, Duration::from_millis(20)))
                }
            }
        }
    }

    fn setup() -> SessionSetup {
        SessionSetup {
            model: "live-model".into(),
            voice: "Fenrir".into(),
            system_instruction: "help".into(),
        }
    }

    fn audio() -> AudioConfig {
        AudioConfig {
            frame_size: 160,
            ..AudioConfig::default()
        }
    }

    fn session(connector: Arc<FakeConnector>, devices: Arc<FakeDevices>) -> LiveSession {
        LiveSession::new(setup(), audio(), connector, devices)
    }

    fn chunk(ms: u64) -> WireMessage {
        WireMessage::AudioChunk {
            data: Bytes::from(pcm_ms(ms)),
            sample_rate: 24000,
            channels: 1,
        }
    }

    #[tokio::test]
    async fn start_connects_and_streams_microphone() {
        let connector = FakeConnector::new(Mode::Open);
        let devices = Arc::new(FakeDevices::default());
        let mut session = session(connector.clone(), devices.clone());

        session.start().await.unwrap();
        assert_eq!(session.status(), SessionStatus::Connected);
        assert_eq!(devices.open_handles(), 2);
        assert!(session.session_id().is_some());

        let (mut cmds, _events) = connector.remote();
        match cmds.recv().await {
            Some(NetCommand::SendAudio(frame)) => assert_eq!(frame.mime_type, "audio/pcm;rate=16000"),
            other => panic!("expected audio, got {:?}", other),
        }
        session.stop().await;
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let devices = Arc::new(FakeDevices::default());
        let mut session = session(FakeConnector::new(Mode::Open), devices.clone());
        session.start().await.unwrap();

        assert!(matches!(session.start().await, Err(SessionError::AlreadyActive)));
        assert_eq!(session.status(), SessionStatus::Connected);
        assert_eq!(devices.open_handles(), 2);
        session.stop().await;
    }

    #[tokio::test]
    async fn late_chunk_is_scheduled_after_previous() {
        let devices = Arc::new(FakeDevices::default());
        let mut session = session(FakeConnector::new(Mode::Open), devices.clone());
        session.start().await.unwrap();

        session.handle_message(chunk(500)).await;
        devices.output.set_now(Duration::from_millis(200));
        session.handle_message(chunk(500)).await;

        assert_eq!(
            devices.output.starts(),
            vec![Duration::ZERO, Duration::from_millis(500)]
        );
        assert_eq!(session.active_playback_count(), 2);
        session.stop().await;
    }

    #[tokio::test]
    async fn turn_commits_transcript_in_speaker_order() {
        let mut session = session(FakeConnector::new(Mode::Open), Arc::new(FakeDevices::default()));
        session.start().await.unwrap();

        for msg in [
            WireMessage::InputTranscriptDelta("how".into()),
            WireMessage::InputTranscriptDelta(" are you".into()),
            WireMessage::OutputTranscriptDelta("I'm".into()),
            WireMessage::OutputTranscriptDelta(" well".into()),
            WireMessage::TurnComplete,
        ] {
            session.handle_message(msg).await;
        }

        let log = session.conversation_log().snapshot();
        assert_eq!(log.len(), 2);
        assert_eq!((log[0].speaker, log[0].text.as_str()), (Speaker::User, "how are you"));
        assert_eq!((log[1].speaker, log[1].text.as_str()), (Speaker::Agent, "I'm well"));
        assert!(log.iter().all(|item| item.committed));

        session.handle_message(WireMessage::TurnComplete).await;
        assert_eq!(session.conversation_log().len(), 2);
        session.stop().await;
    }

    #[tokio::test]
    async fn interruption_abandons_agent_speech() {
        let mut session = session(FakeConnector::new(Mode::Open), Arc::new(FakeDevices::default()));
        session.start().await.unwrap();

        session.handle_message(chunk(300)).await;
        session.handle_message(chunk(300)).await;
        session.handle_message(WireMessage::OutputTranscriptDelta("Sor".into())).await;
        session.handle_message(WireMessage::Interrupted).await;

        assert_eq!(session.active_playback_count(), 0);
        assert_eq!(session.pending_transcript(Speaker::Agent).text, "");

        session.handle_message(WireMessage::TurnComplete).await;
        assert!(session
            .conversation_log()
            .snapshot()
            .iter()
            .all(|item| item.speaker != Speaker::Agent));
        session.stop().await;
    }

    #[tokio::test]
    async fn malformed_chunk_is_ignored() {
        let devices = Arc::new(FakeDevices::default());
        let mut session = session(FakeConnector::new(Mode::Open), devices.clone());
        session.start().await.unwrap();

        session
            .handle_message(WireMessage::AudioChunk {
                data: Bytes::from_static(&[1, 2, 3]),
                sample_rate: 24000,
                channels: 1,
            })
            .await;

        assert!(devices.output.starts().is_empty());
        assert_eq!(session.status(), SessionStatus::Connected);
        session.stop().await;
    }

    #[tokio::test]
    async fn stop_releases_everything_and_is_repeatable() {
        let connector = FakeConnector::new(Mode::Open);
        let devices = Arc::new(FakeDevices::default());
        let mut session = session(connector.clone(), devices.clone());
        session.start().await.unwrap();
        session.handle_message(chunk(200)).await;
        session.handle_message(WireMessage::InputTranscriptDelta("half".into())).await;
        let (mut cmds, _events) = connector.remote();

        session.stop().await;
        assert_eq!(session.status(), SessionStatus::Disconnected);
        assert_eq!(devices.open_handles(), 0);
        assert!(!session.holds_resources());
        assert_eq!(session.active_playback_count(), 0);
        assert_eq!(session.pending_transcript(Speaker::User).text, "");
        assert!(devices.output.state.lock().unwrap().closed);

        let mut saw_close = false;
        while let Ok(cmd) = cmds.try_recv() {
            saw_close |= matches!(cmd, NetCommand::Close);
        }
        assert!(saw_close);

        session.stop().await;
        assert_eq!(session.status(), SessionStatus::Disconnected);
    }

    #[tokio::test]
    async fn stop_while_connecting_releases_devices() {
        let devices = Arc::new(FakeDevices::default());
        let mut session = session(FakeConnector::new(Mode::Hang), devices.clone());

        let started = tokio::time::timeout(Duration::from_millis(50), session.start()).await;
        assert!(started.is_err());
        assert_eq!(session.status(), SessionStatus::Connecting);
        assert_eq!(devices.open_handles(), 2);

        session.stop().await;
        assert_eq!(session.status(), SessionStatus::Disconnected);
        assert_eq!(devices.open_handles(), 0);
    }

    #[tokio::test]
    async fn microphone_denied_is_fatal_and_releases_output() {
        let devices = Arc::new(FakeDevices::default());
        devices.mic_denied.store(true, Ordering::SeqCst);
        let mut session = session(FakeConnector::new(Mode::Open), devices.clone());

        assert!(matches!(session.start().await, Err(SessionError::Acquisition(_))));
        assert_eq!(session.status(), SessionStatus::Error);
        assert_eq!(devices.open_handles(), 0);

        devices.mic_denied.store(false, Ordering::SeqCst);
        session.start().await.unwrap();
        assert_eq!(session.status(), SessionStatus::Connected);
        session.stop().await;
    }

    #[tokio::test]
    async fn refused_connection_is_fatal() {
        let devices = Arc::new(FakeDevices::default());
        let mut session = session(FakeConnector::new(Mode::Refuse), devices.clone());
        assert!(matches!(session.start().await, Err(SessionError::Transport(_))));
        assert_eq!(session.status(), SessionStatus::Error);
        assert_eq!(devices.open_handles(), 0);
    }

    #[tokio::test]
    async fn transport_fault_moves_to_error_and_tears_down() {
        let devices = Arc::new(FakeDevices::default());
        let mut session = session(FakeConnector::new(Mode::Open), devices.clone());
        session.start().await.unwrap();
        session.handle_message(chunk(100)).await;

        session.handle_message(WireMessage::Errored("reset by peer".into())).await;
        assert_eq!(session.status(), SessionStatus::Error);
        assert_eq!(devices.open_handles(), 0);
        assert_eq!(session.active_playback_count(), 0);
    }

    #[tokio::test]
    async fn microphone_failure_faults_the_session() {
        let devices = Arc::new(FakeDevices::default());
        devices.mic_breaks.store(true, Ordering::SeqCst);
        let mut session = session(FakeConnector::new(Mode::Open), devices.clone());
        session.start().await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), session.run_until_closed())
            .await
            .unwrap();
        assert_eq!(session.status(), SessionStatus::Error);
        assert_eq!(devices.open_handles(), 0);
        assert!(!session.holds_resources());
    }

    #[tokio::test]
    async fn close_failure_does_not_block_teardown() {
        let devices = Arc::new(FakeDevices::default());
        let mut session = session(FakeConnector::new(Mode::StuckClose), devices.clone());
        session.start().await.unwrap();

        session.stop().await;
        assert_eq!(session.status(), SessionStatus::Disconnected);
        assert_eq!(devices.open_handles(), 0);
        assert!(!session.holds_resources());
    }

    #[tokio::test]
    async fn run_until_closed_processes_stream() {
        let connector = FakeConnector::new(Mode::Open);
        let devices = Arc::new(FakeDevices::default());
        let mut session = session(connector.clone(), devices.clone());
        session.start().await.unwrap();

        let (_cmds, events) = connector.remote();
        for msg in [
            WireMessage::OutputTranscriptDelta("Namaste".into()),
            chunk(100),
            WireMessage::TurnComplete,
            WireMessage::Closed,
        ] {
            events.send(msg).await.unwrap();
        }

        session.run_until_closed().await;
        assert_eq!(session.status(), SessionStatus::Disconnected);
        assert_eq!(session.conversation_log().len(), 1);
        assert_eq!(devices.open_handles(), 0);
    }

    #[tokio::test]
    async fn status_changes_are_observable() {
        let mut session = session(FakeConnector::new(Mode::Open), Arc::new(FakeDevices::default()));
        let mut status = session.subscribe_status();
        session.start().await.unwrap();
        assert!(status.has_changed().unwrap());
        assert_eq!(*status.borrow_and_update(), SessionStatus::Connected);
        session.stop().await;
        assert_eq!(*status.borrow_and_update(), SessionStatus::Disconnected);
    }
}
