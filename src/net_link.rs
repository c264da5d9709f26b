use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use url::Url;

use crate::audio::FrameSink;
use crate::audio::codec::EncodedFrame;
use crate::error::{SessionError, SessionResult};
use crate::protocol::{ServerFrame, SessionSetup, WireMessage, parse_server_frame, realtime_input_json};

/// Inbound events buffered between the socket reader and the session loop.
const INBOUND_CAPACITY: usize = 100;

#[derive(Debug)]
pub enum NetCommand {
    SendAudio(EncodedFrame),
    Close,
}

/// Outbound side of the transport. Cloneable, never blocks.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<NetCommand>,
}

impl Outbound {
    pub fn send_audio(&self, frame: EncodedFrame) -> bool {
        self.tx.send(NetCommand::SendAudio(frame)).is_ok()
    }
}

impl FrameSink for Outbound {
    fn send_frame(&self, frame: EncodedFrame) -> bool {
        self.send_audio(frame)
    }
}

/// An open duplex channel to the remote agent.
pub struct TransportLink {
    outbound: Outbound,
    inbound: mpsc::Receiver<WireMessage>,
    task: Option<JoinHandle<()>>,
    close_timeout: Duration,
    closed: bool,
}

impl TransportLink {
    pub fn new(
        cmd_tx: mpsc::UnboundedSender<NetCommand>,
        inbound: mpsc::Receiver<WireMessage>,
        task: Option<JoinHandle<()>>,
        close_timeout: Duration,
    ) -> Self {
        Self {
            outbound: Outbound { tx: cmd_tx },
            inbound,
            task,
            close_timeout,
            closed: false,
        }
    }

    pub fn outbound(&self) -> Outbound {
        self.outbound.clone()
    }

    /// Next inbound event, in the order the remote sent them.
    pub async fn recv(&mut self) -> Option<WireMessage> {
        self.inbound.recv().await
    }

    /// Terminate the channel. Idempotent; the first call waits for the link
    /// task to settle, bounded by the close timeout.
    pub async fn close(&mut self) -> anyhow::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let _ = self.outbound.tx.send(NetCommand::Close);
        self.inbound.close();

        let Some(mut task) = self.task.take() else {
            return Ok(());
        };
        match tokio::time::timeout(self.close_timeout, &mut task).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(anyhow::anyhow!("transport task failed: {}", e)),
            Err(_) => {
                task.abort();
                Err(anyhow::anyhow!(
                    "transport did not close within {:?}",
                    self.close_timeout
                ))
            }
        }
    }
}

impl Drop for TransportLink {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Opens transport links. Resolves only once the remote acknowledged the session.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, setup: &SessionSetup) -> SessionResult<TransportLink>;
}

/// Websocket connector for the live agent endpoint.
pub struct WsConnector {
    ws_url: String,
    api_key: String,
    connect_timeout: Duration,
    close_timeout: Duration,
}

impl WsConnector {
    pub fn new(ws_url: &str, api_key: &str, connect_timeout: Duration, close_timeout: Duration) -> Self {
        Self {
            ws_url: ws_url.to_string(),
            api_key: api_key.to_string(),
            connect_timeout,
            close_timeout,
        }
    }

    fn endpoint(&self) -> SessionResult<Url> {
        let mut url = Url::parse(&self.ws_url)
            .map_err(|e| SessionError::Transport(format!("invalid ws_url: {}", e)))?;
        url.query_pairs_mut().append_pair("key", &self.api_key);
        Ok(url)
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, setup: &SessionSetup) -> SessionResult<TransportLink> {
        if self.api_key.is_empty() {
            return Err(SessionError::MissingApiKey);
        }
        let url = self.endpoint()?;
        let setup_json = serde_json::to_string(&setup.to_message())
            .map_err(|e| SessionError::Transport(e.to_string()))?;

        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (opened_tx, opened_rx) = oneshot::channel();

        let link = NetLink::new(url, setup_json, tx, cmd_rx);
        let task = tokio::spawn(link.run(opened_tx));
        let mut transport = TransportLink::new(cmd_tx, rx, Some(task), self.close_timeout);

        let failure = match tokio::time::timeout(self.connect_timeout, opened_rx).await {
            Ok(Ok(Ok(()))) => return Ok(transport),
            Ok(Ok(Err(e))) => e,
            Ok(Err(_)) => "transport task ended before the session opened".to_string(),
            Err(_) => format!("no setup acknowledgement within {:?}", self.connect_timeout),
        };
        if let Err(e) = transport.close().await {
            log::warn!("Failed to close half-open transport: {}", e);
        }
        Err(SessionError::Transport(failure))
    }
}

enum LinkExit {
    RemoteClosed,
    LocalClose,
}

pub struct NetLink {
    url: Url,
    setup_json: String,
    tx: mpsc::Sender<WireMessage>,
    rx_cmd: mpsc::UnboundedReceiver<NetCommand>,
}

impl NetLink {
    pub fn new(
        url: Url,
        setup_json: String,
        tx: mpsc::Sender<WireMessage>,
        rx_cmd: mpsc::UnboundedReceiver<NetCommand>,
    ) -> Self {
        Self { url, setup_json, tx, rx_cmd }
    }

    /// Drive the connection until it closes. `opened` resolves when the
    /// remote acknowledges the setup message, or with the reason it could not.
    pub async fn run(mut self, opened: oneshot::Sender<Result<(), String>>) {
        let mut opened = Some(opened);
        let outcome = self.connect_and_loop(&mut opened).await;

        match (outcome, opened.take()) {
            (Ok(LinkExit::LocalClose), _) => log::info!("Transport closed locally"),
            (Ok(LinkExit::RemoteClosed), Some(opened)) => {
                let _ = opened.send(Err("connection closed before setup completed".to_string()));
            }
            (Ok(LinkExit::RemoteClosed), None) => {
                log::info!("Server closed the session");
                let _ = self.tx.send(WireMessage::Closed).await;
            }
            (Err(e), Some(opened)) => {
                log::error!("Transport failed before opening: {}", e);
                let _ = opened.send(Err(e.to_string()));
            }
            (Err(e), None) => {
                log::error!("Transport fault: {}", e);
                let _ = self.tx.send(WireMessage::Errored(e.to_string())).await;
            }
        }
    }

    async fn connect_and_loop(
        &mut self,
        opened: &mut Option<oneshot::Sender<Result<(), String>>>,
    ) -> anyhow::Result<LinkExit> {
        let request = self.url.as_str().into_client_request()?;

        log::info!(
            "Connecting to {}://{}{}...",
            self.url.scheme(),
            self.url.host_str().unwrap_or_default(),
            self.url.path()
        );
        let (ws_stream, _) = connect_async(request).await?;
        log::info!("Connected!");

        let (mut write, mut read) = ws_stream.split();

        log::debug!("Sending setup: {}", self.setup_json);
        write.send(Message::Text(self.setup_json.clone().into())).await?;

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_frame(text.as_str(), opened).await?;
                        }
                        // 服务端也可能以二进制帧下发 JSON
                        Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                            Ok(text) => self.handle_frame(text, opened).await?,
                            Err(_) => log::warn!("Ignoring non-UTF-8 binary frame ({} bytes)", data.len()),
                        },
                        Some(Ok(Message::Close(frame))) => {
                            log::info!("Server closed connection: {:?}", frame);
                            return Ok(LinkExit::RemoteClosed);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => return Ok(LinkExit::RemoteClosed),
                    }
                }
                cmd = self.rx_cmd.recv() => {
                    match cmd {
                        Some(NetCommand::SendAudio(frame)) => {
                            let json = realtime_input_json(&frame)?;
                            write.send(Message::Text(json.into())).await?;
                        }
                        Some(NetCommand::Close) | None => {
                            if let Err(e) = write.send(Message::Close(None)).await {
                                log::warn!("Failed to send close frame: {}", e);
                            }
                            return Ok(LinkExit::LocalClose);
                        }
                    }
                }
            }
        }
    }

    async fn handle_frame(
        &mut self,
        text: &str,
        opened: &mut Option<oneshot::Sender<Result<(), String>>>,
    ) -> anyhow::Result<()> {
        match parse_server_frame(text) {
            Ok(ServerFrame::SetupComplete) => {
                if let Some(opened) = opened.take() {
                    log::info!("Session setup acknowledged");
                    if opened.send(Ok(())).is_err() {
                        anyhow::bail!("session was abandoned while connecting");
                    }
                }
            }
            Ok(ServerFrame::Events(events)) => {
                for event in events {
                    self.tx
                        .send(event)
                        .await
                        .map_err(|_| anyhow::anyhow!("inbound receiver dropped"))?;
                }
            }
            Err(e) => log::warn!("Unparseable server frame ({}): {}", e, text),
        }
        Ok(())
    }
}
