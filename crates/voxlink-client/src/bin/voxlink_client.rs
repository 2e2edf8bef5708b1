//! Reference client binary.
//!
//! Server control messages arrive as JSON lines on stdin, standing in for
//! the external control channel; outbound publishes are logged. With
//! `--handshake` the client announces itself and waits for a `hello` offer
//! before starting; otherwise it joins a session described in the config
//! file or flags. Audio devices are null implementations. Runs until the
//! session winds down or Ctrl-C.

use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use voxlink_client::audio::{NullSink, PassthroughCodec, SilenceSource};
use voxlink_client::config::ClientConfig;
use voxlink_client::control::{
    ClientMessage, ControlError, ControlPublisher, ControlTransport, ServerMessage,
};
use voxlink_client::runtime::{ClientEvent, ClientRuntime, OperatorCommand, RuntimeConfig};
use voxlink_client::session;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "voxlink-client", about = "Voxlink voice-assistant device client")]
struct Cli {
    /// TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Negotiate the session: publish hello and wait for the server's offer
    /// on stdin instead of taking session parameters from the config.
    #[arg(long)]
    handshake: bool,

    /// Audio server host, overrides the config file.
    #[arg(long)]
    server: Option<String>,

    /// Audio server UDP port, overrides the config file.
    #[arg(long)]
    port: Option<u16>,

    /// Session identifier, overrides the config file.
    #[arg(long)]
    session_id: Option<String>,

    /// Hex-encoded 16-byte session key, overrides the config file.
    #[arg(long)]
    key: Option<String>,

    /// Control-channel identity, overrides the config file.
    #[arg(long)]
    client_id: Option<String>,

    /// Seconds between logged stream reports.
    #[arg(long, default_value_t = 5)]
    status_interval: u64,
}

/// Stand-in control delivery that logs each publish. The production control
/// channel plugs in here.
struct LogTransport;

impl ControlTransport for LogTransport {
    fn publish(&self, topic: &str, payload: String) -> Result<(), ControlError> {
        info!(topic, %payload, "control publish");
        Ok(())
    }
}

/// Feed stdin JSON lines into the control channel until EOF.
fn read_control_lines(control_tx: Sender<ServerMessage>) {
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ServerMessage>(&line) {
            Ok(msg) => {
                if control_tx.send(msg).is_err() {
                    break;
                }
            }
            Err(e) => warn!(error = %e, "unparseable control message"),
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => ClientConfig::load(path)?,
        None => ClientConfig::default(),
    };
    if let Some(server) = cli.server {
        config.server = server;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(session_id) = cli.session_id {
        config.session_id = session_id;
    }
    if let Some(key) = cli.key {
        config.key = key;
    }
    if let Some(client_id) = cli.client_id {
        config.client_id = client_id;
    }

    let (control_tx, control_rx) = bounded::<ServerMessage>(64);
    thread::Builder::new()
        .name("vox-control-in".into())
        .spawn(move || read_control_lines(control_tx))
        .context("spawning control reader thread")?;

    let publisher = ControlPublisher::new(Box::new(LogTransport), config.client_id.clone());
    let session = if cli.handshake {
        info!("waiting for session offer");
        session::negotiate(
            &publisher,
            &config.client_id,
            &control_rx,
            config.host()?,
            HANDSHAKE_TIMEOUT,
        )
        .context("session handshake")?
    } else {
        // Announce ourselves even when the session came from the config.
        publisher.send(&ClientMessage::Hello {
            client_id: config.client_id.clone(),
        })?;
        config.session().context("building session from config")?
    };

    let audio = session.audio;
    info!(
        session_id = %session.session_id,
        remote = %session.remote_addr,
        sample_rate = audio.sample_rate,
        frame_duration = audio.frame_duration,
        "starting voxlink client"
    );

    let frame_len = audio.samples_per_frame() * usize::from(audio.channels) * 2;
    let mut runtime = ClientRuntime::start(
        session,
        publisher,
        Box::new(SilenceSource::new(frame_len, audio.frame_interval())),
        Box::new(NullSink::new()),
        Box::new(PassthroughCodec),
        Box::new(PassthroughCodec),
        RuntimeConfig::default(),
    )?;

    let interrupted = Arc::new(AtomicBool::new(false));
    ctrlc::set_handler({
        let interrupted = interrupted.clone();
        move || interrupted.store(true, Ordering::Relaxed)
    })
    .context("installing Ctrl-C handler")?;

    let events = runtime.event_sender();
    let status_interval = Duration::from_secs(cli.status_interval.max(1));
    let mut since_status = Duration::ZERO;
    let mut control_open = true;
    while !interrupted.load(Ordering::Relaxed) && !runtime.is_terminated() {
        if control_open {
            match control_rx.recv_timeout(Duration::from_millis(200)) {
                Ok(msg) => {
                    let _ = events.send(ClientEvent::Control(msg));
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => control_open = false,
            }
        } else {
            thread::sleep(Duration::from_millis(200));
        }
        since_status += Duration::from_millis(200);
        if since_status >= status_interval {
            since_status = Duration::ZERO;
            let _ = events.send(ClientEvent::Operator(OperatorCommand::Status));
        }
    }

    if interrupted.load(Ordering::Relaxed) {
        info!("interrupted, shutting down");
        let _ = events.send(ClientEvent::Operator(OperatorCommand::Abort));
    }
    runtime.shutdown();
    Ok(())
}
