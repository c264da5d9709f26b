mod audio;
mod config;
mod controller;
mod error;
mod net_link;
mod protocol;
mod state_machine;
mod transcript;

use std::sync::Arc;
use std::time::Duration;

use audio::{AlsaDevices, AudioConfig};
use config::Config;
use controller::LiveSession;
use net_link::WsConnector;
use protocol::SessionSetup;
use state_machine::SessionStatus;
use tokio::signal;
use tokio::sync::{broadcast, watch};
use transcript::TranscriptItem;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();

    // 加载配置，API key 可由环境变量覆盖
    let config = Config::new()
        .map_err(anyhow::Error::msg)?
        .with_env_overrides();
    log::info!("{} v{} starting", config.app_name, config.app_version);

    let connector = Arc::new(WsConnector::new(
        config.ws_url,
        &config.api_key,
        Duration::from_millis(config.connect_timeout_ms),
        Duration::from_millis(config.close_timeout_ms),
    ));
    let devices = Arc::new(AlsaDevices::new(AudioConfig::from(&config)));
    let mut session = LiveSession::new(
        SessionSetup::from(&config),
        AudioConfig::from(&config),
        connector,
        devices,
    );

    // 状态、转写和音量在独立任务中输出，会话销毁后任务自然结束
    let log = session.conversation_log();
    let observer = tokio::spawn(observe(
        log.subscribe(),
        session.subscribe_status(),
        session.subscribe_level(),
    ));

    tokio::select! {
        _ = signal::ctrl_c() => {
            println!("Received Ctrl+C before the session opened, shutting down...");
        }
        started = session.start() => match started {
            Ok(()) => {
                if let Some(id) = session.session_id() {
                    println!("Session {} listening... speak now (Ctrl+C to stop)", id);
                }
                tokio::select! {
                    _ = signal::ctrl_c() => println!("Received Ctrl+C, shutting down..."),
                    _ = session.run_until_closed() => {}
                }
            }
            Err(e) => log::error!("Failed to start session: {}", e),
        }
    }

    let final_status = session.status();
    session.stop().await;
    drop(session);
    let recorded = log.snapshot().len();
    drop(log);
    if let Err(e) = observer.await {
        log::warn!("Observer task failed: {}", e);
    }

    println!(
        "Session ended ({}), {} utterance(s) recorded",
        final_status, recorded
    );
    if final_status == SessionStatus::Error {
        anyhow::bail!("session ended with an error");
    }
    Ok(())
}

/// Print committed transcript lines and log status and playback level until
/// the session goes away.
async fn observe(
    mut transcripts: broadcast::Receiver<TranscriptItem>,
    mut status: watch::Receiver<SessionStatus>,
    mut level: watch::Receiver<f32>,
) {
    let mut status_open = true;
    let mut level_open = true;
    loop {
        tokio::select! {
            // 先输出已提交的转写，避免会话结束时丢失最后一轮
            biased;

            item = transcripts.recv() => match item {
                Ok(item) => println!("{}: {}", item.speaker.label(), item.text),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Transcript display lagged by {} item(s)", n)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },

            changed = status.changed(), if status_open => match changed {
                Ok(()) => log::info!("Status: {}", *status.borrow_and_update()),
                Err(_) => status_open = false,
            },

            changed = level.changed(), if level_open => match changed {
                Ok(()) => log::trace!("Playback level: {:.3}", *level.borrow_and_update()),
                Err(_) => level_open = false,
            },
        }
    }
}
