//! Worker threads binding the session to the socket.
//!
//! Four named threads cooperate over crossbeam channels and atomic flags:
//!
//! - `vox-inbound` — receives datagrams, opens them, tracks sequences,
//!   decodes frames, and hands PCM to playback
//! - `vox-playback` — jitter-buffers decoded frames and paces them into the
//!   render sink
//! - `vox-outbound` — captures, encodes, seals, and sends while a recording
//!   sub-session is active
//! - `vox-session` — owns the turn machine, the control publisher, and the
//!   retry/stall timers
//!
//! Every blocking wait carries a timeout so a raised shutdown flag is
//! observed within one interval. Nothing in the data path terminates the
//! process: malformed datagrams, undecodable frames, and render failures are
//! logged and dropped.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use quanta::Instant;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use voxlink_transport::jitter::{JitterBuffer, JitterConfig, PlayoutPoll, PlayoutState};
use voxlink_transport::stats::{ThroughputMeter, ThroughputSnapshot};
use voxlink_transport::tracker::{SequenceTracker, TrackerSummary};
use voxlink_transport::wire::{PacketCodec, WireError};

use crate::audio::{CaptureSource, FrameDecoder, FrameEncoder, RenderSink};
use crate::control::{ClientMessage, ControlPublisher, ServerMessage, TtsState};
use crate::session::{
    OutboundSequence, Session, TurnAction, TurnEvent, TurnMachine, TurnState, RETRY_DELAY,
    TTS_TIMEOUT,
};

/// Runtime knobs. Defaults match the production deployment; tests shrink the
/// timers.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Socket read timeout, the inbound loop's cancellation interval.
    pub recv_timeout: Duration,
    /// Silent-turn stall threshold.
    pub tts_timeout: Duration,
    /// Delay before a listen re-trigger is published.
    pub retry_delay: Duration,
    /// Session thread wakeup interval for timer checks.
    pub event_tick: Duration,
    pub jitter: JitterConfig,
    /// Decoded frames buffered between inbound and playback.
    pub frame_channel_capacity: usize,
    /// Inbound progress log cadence, in packets.
    pub log_every_packets: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            recv_timeout: Duration::from_secs(1),
            tts_timeout: TTS_TIMEOUT,
            retry_delay: RETRY_DELAY,
            event_tick: Duration::from_millis(250),
            jitter: JitterConfig::default(),
            frame_channel_capacity: 256,
            log_every_packets: 16,
        }
    }
}

/// Commands from the operator side channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorCommand {
    /// Cancel the in-flight turn.
    Abort,
    /// Log a status report.
    Status,
}

/// Events merged onto the session thread.
#[derive(Debug)]
pub enum ClientEvent {
    /// A decoded control-channel message.
    Control(ServerMessage),
    Operator(OperatorCommand),
    /// First audio packet of the current turn arrived.
    FirstAudio,
    /// Playout ran dry past the buffer timeout.
    PlayoutStall,
}

/// Copy-out snapshot of the live stream counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamReport {
    pub tracker: TrackerSummary,
    pub throughput: ThroughputSnapshot,
    pub playout_depth: usize,
    pub rendering: bool,
    /// Frames handed to the render sink since startup. Monotone.
    pub rendered_frames: u64,
}

/// Handle to the running worker threads. Dropping it shuts the session down.
pub struct ClientRuntime {
    event_tx: Sender<ClientEvent>,
    shutdown: Arc<AtomicBool>,
    report: Arc<Mutex<StreamReport>>,
    local_addr: SocketAddr,
    handles: Vec<JoinHandle<()>>,
}

impl ClientRuntime {
    /// Bind a socket, announce the session with a UDP ping, and spawn the
    /// worker threads.
    pub fn start(
        session: Session,
        publisher: ControlPublisher,
        source: Box<dyn CaptureSource>,
        sink: Box<dyn RenderSink>,
        encoder: Box<dyn FrameEncoder>,
        decoder: Box<dyn FrameDecoder>,
        config: RuntimeConfig,
    ) -> anyhow::Result<ClientRuntime> {
        let socket = UdpSocket::bind("0.0.0.0:0").context("binding audio socket")?;
        socket
            .set_read_timeout(Some(config.recv_timeout))
            .context("setting socket read timeout")?;
        let local_addr = socket.local_addr().context("reading local address")?;
        let send_socket = socket.try_clone().context("cloning audio socket")?;

        let codec = session.codec();
        let mut sequence = OutboundSequence::new();

        // The ping opens the NAT path and tells the server where to send
        // audio. It consumes outbound sequence 1.
        let ping = codec.seal(
            format!("ping:{}", session.session_id).as_bytes(),
            sequence.next(),
            unix_time(),
        );
        send_socket
            .send_to(&ping, session.remote_addr)
            .context("sending session ping")?;
        info!(
            session_id = %session.session_id,
            remote = %session.remote_addr,
            local = %local_addr,
            "session ping sent"
        );

        let shutdown = Arc::new(AtomicBool::new(false));
        let stop_recording = Arc::new(AtomicBool::new(true));
        let reset_tracking = Arc::new(AtomicBool::new(false));
        let flush_playout = Arc::new(AtomicBool::new(false));
        let report = Arc::new(Mutex::new(StreamReport::default()));
        let last_audio = Arc::new(Mutex::new(Instant::now()));

        let (frame_tx, frame_rx) = bounded(config.frame_channel_capacity);
        let (event_tx, event_rx) = bounded(256);
        let (start_tx, start_rx) = bounded::<()>(4);

        let mut handles = Vec::with_capacity(4);

        handles.push(
            thread::Builder::new()
                .name("vox-inbound".into())
                .spawn({
                    let shutdown = shutdown.clone();
                    let reset_tracking = reset_tracking.clone();
                    let report = report.clone();
                    let last_audio = last_audio.clone();
                    let event_tx = event_tx.clone();
                    let codec = codec.clone();
                    let config = config.clone();
                    move || {
                        inbound_loop(
                            socket,
                            codec,
                            decoder,
                            frame_tx,
                            event_tx,
                            shutdown,
                            reset_tracking,
                            report,
                            last_audio,
                            config,
                        )
                    }
                })
                .context("spawning inbound thread")?,
        );

        handles.push(
            thread::Builder::new()
                .name("vox-playback".into())
                .spawn({
                    let shutdown = shutdown.clone();
                    let flush_playout = flush_playout.clone();
                    let report = report.clone();
                    let event_tx = event_tx.clone();
                    let jitter = config.jitter.clone();
                    move || {
                        playback_loop(frame_rx, sink, jitter, event_tx, shutdown, flush_playout, report)
                    }
                })
                .context("spawning playback thread")?,
        );

        handles.push(
            thread::Builder::new()
                .name("vox-outbound".into())
                .spawn({
                    let shutdown = shutdown.clone();
                    let stop_recording = stop_recording.clone();
                    let remote = session.remote_addr;
                    move || {
                        outbound_loop(
                            send_socket,
                            remote,
                            codec,
                            sequence,
                            source,
                            encoder,
                            start_rx,
                            shutdown,
                            stop_recording,
                        )
                    }
                })
                .context("spawning outbound thread")?,
        );

        handles.push(
            thread::Builder::new()
                .name("vox-session".into())
                .spawn({
                    let shutdown = shutdown.clone();
                    let report = report.clone();
                    let session = session.clone();
                    let config = config.clone();
                    move || {
                        session_loop(
                            session,
                            publisher,
                            event_rx,
                            start_tx,
                            shutdown,
                            stop_recording,
                            reset_tracking,
                            flush_playout,
                            last_audio,
                            report,
                            config,
                        )
                    }
                })
                .context("spawning session thread")?,
        );

        Ok(ClientRuntime {
            event_tx,
            shutdown,
            report,
            local_addr,
            handles,
        })
    }

    /// Sender for control messages and operator commands.
    pub fn event_sender(&self) -> Sender<ClientEvent> {
        self.event_tx.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn report(&self) -> StreamReport {
        match self.report.lock() {
            Ok(report) => report.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// True once the session thread has decided to wind down.
    pub fn is_terminated(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Raise the shutdown flag and join all workers. Idempotent.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("worker thread panicked during shutdown");
            }
        }
    }
}

impl Drop for ClientRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Seconds since the Unix epoch, truncated to the header timestamp width.
fn unix_time() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

// ─────────────────────────────── Inbound ────────────────────────────────

#[allow(clippy::too_many_arguments)]
fn inbound_loop(
    socket: UdpSocket,
    codec: PacketCodec,
    mut decoder: Box<dyn FrameDecoder>,
    frame_tx: Sender<bytes::Bytes>,
    event_tx: Sender<ClientEvent>,
    shutdown: Arc<AtomicBool>,
    reset_tracking: Arc<AtomicBool>,
    report: Arc<Mutex<StreamReport>>,
    last_audio: Arc<Mutex<Instant>>,
    config: RuntimeConfig,
) {
    let mut tracker = SequenceTracker::new();
    let mut meter = ThroughputMeter::new();
    let mut buf = [0u8; 4096];

    while !shutdown.load(Ordering::Relaxed) {
        let (len, _peer) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e) if is_timeout(&e) => continue,
            Err(e) => {
                warn!(error = %e, "socket receive failed");
                continue;
            }
        };
        // Applied on arrival so a turn boundary never splits one packet's
        // accounting.
        if reset_tracking.swap(false, Ordering::Relaxed) {
            tracker.reset();
            meter.reset();
            debug!("sequence tracking reset for new turn");
        }
        meter.record(len);

        let (header, payload) = match codec.open(&buf[..len]) {
            Ok(opened) => opened,
            Err(WireError::MalformedPacket { len }) => {
                debug!(len, "dropping malformed datagram");
                continue;
            }
        };

        if let Some(gap) = tracker.observe(header.sequence) {
            warn!(
                expected = gap.expected,
                received = gap.received,
                gap_size = gap.gap_size,
                "sequence gap detected"
            );
        }
        if let Ok(mut last) = last_audio.lock() {
            *last = Instant::now();
        }
        if tracker.total_received() == 1 {
            let _ = event_tx.send(ClientEvent::FirstAudio);
        }
        if tracker.total_received() % config.log_every_packets == 0 {
            debug!(
                packets = tracker.total_received(),
                last_sequence = header.sequence,
                "inbound audio progress"
            );
        }

        match decoder.decode(&payload) {
            Ok(pcm) => match frame_tx.try_send(pcm) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(sequence = header.sequence, "playout queue full, dropping frame");
                }
                Err(TrySendError::Disconnected(_)) => break,
            },
            Err(e) => {
                warn!(sequence = header.sequence, error = %e, "dropping undecodable frame");
            }
        }

        if let Ok(mut report) = report.lock() {
            report.tracker = tracker.summary();
            report.throughput = meter.snapshot();
        }
    }
    debug!("inbound loop stopped");
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

// ─────────────────────────────── Playback ───────────────────────────────

fn playback_loop(
    frame_rx: Receiver<bytes::Bytes>,
    mut sink: Box<dyn RenderSink>,
    jitter: JitterConfig,
    event_tx: Sender<ClientEvent>,
    shutdown: Arc<AtomicBool>,
    flush_playout: Arc<AtomicBool>,
    report: Arc<Mutex<StreamReport>>,
) {
    let mut buffer = JitterBuffer::new(jitter);
    let mut rendered_frames = 0u64;

    while !shutdown.load(Ordering::Relaxed) {
        match frame_rx.recv_timeout(Duration::from_millis(20)) {
            Ok(frame) => {
                buffer.push(frame);
                while let Ok(frame) = frame_rx.try_recv() {
                    buffer.push(frame);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if flush_playout.swap(false, Ordering::Relaxed) {
            let dropped = buffer.flush(Instant::now());
            if dropped > 0 {
                info!(dropped, "flushed playout buffer");
            }
        }

        match buffer.poll(Instant::now()) {
            PlayoutPoll::Frame(frame) => {
                rendered_frames += 1;
                // The sink paces playback; a failed render costs one frame,
                // never the session.
                if let Err(e) = sink.render(&frame) {
                    warn!(error = %e, "render failure, dropping frame");
                }
            }
            PlayoutPoll::Buffering => {}
            PlayoutPoll::Stalled => {
                let _ = event_tx.send(ClientEvent::PlayoutStall);
            }
        }

        if let Ok(mut report) = report.lock() {
            report.playout_depth = buffer.len();
            report.rendering = buffer.state() == PlayoutState::Rendering;
            report.rendered_frames = rendered_frames;
        }
    }
    debug!(rendered_frames, "playback loop stopped");
}

// ─────────────────────────────── Outbound ───────────────────────────────

#[allow(clippy::too_many_arguments)]
fn outbound_loop(
    socket: UdpSocket,
    remote: SocketAddr,
    codec: PacketCodec,
    mut sequence: OutboundSequence,
    mut source: Box<dyn CaptureSource>,
    mut encoder: Box<dyn FrameEncoder>,
    start_rx: Receiver<()>,
    shutdown: Arc<AtomicBool>,
    stop_recording: Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::Relaxed) {
        match start_rx.recv_timeout(Duration::from_secs(1)) {
            Ok(()) => {}
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        info!("recording sub-session started");
        let mut frames_sent = 0u64;
        loop {
            if shutdown.load(Ordering::Relaxed) || stop_recording.load(Ordering::Relaxed) {
                break;
            }
            let pcm = match source.read_frame() {
                Ok(pcm) => pcm,
                Err(e) => {
                    warn!(error = %e, "capture failure, ending recording sub-session");
                    break;
                }
            };
            let frame = match encoder.encode(&pcm) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "encode failure, ending recording sub-session");
                    break;
                }
            };
            let packet = codec.seal(&frame, sequence.next(), unix_time());
            if let Err(e) = socket.send_to(&packet, remote) {
                warn!(error = %e, "audio send failed, ending recording sub-session");
                break;
            }
            frames_sent += 1;
        }
        info!(frames_sent, "recording sub-session stopped");

        // Drop start signals that queued up mid-recording.
        while start_rx.try_recv().is_ok() {}
    }
    debug!("outbound loop stopped");
}

// ─────────────────────────────── Session ────────────────────────────────

struct SessionCtx {
    session: Session,
    publisher: ControlPublisher,
    start_tx: Sender<()>,
    shutdown: Arc<AtomicBool>,
    stop_recording: Arc<AtomicBool>,
    reset_tracking: Arc<AtomicBool>,
    flush_playout: Arc<AtomicBool>,
    last_audio: Arc<Mutex<Instant>>,
    report: Arc<Mutex<StreamReport>>,
    retry_delay: Duration,
    /// Listen re-trigger waiting to fire: (due, attempt).
    pending_retry: Option<(Instant, u32)>,
}

#[allow(clippy::too_many_arguments)]
fn session_loop(
    session: Session,
    publisher: ControlPublisher,
    event_rx: Receiver<ClientEvent>,
    start_tx: Sender<()>,
    shutdown: Arc<AtomicBool>,
    stop_recording: Arc<AtomicBool>,
    reset_tracking: Arc<AtomicBool>,
    flush_playout: Arc<AtomicBool>,
    last_audio: Arc<Mutex<Instant>>,
    report: Arc<Mutex<StreamReport>>,
    config: RuntimeConfig,
) {
    let mut machine = TurnMachine::new();
    let mut ctx = SessionCtx {
        session,
        publisher,
        start_tx,
        shutdown: shutdown.clone(),
        stop_recording,
        reset_tracking,
        flush_playout,
        last_audio,
        report,
        retry_delay: config.retry_delay,
        pending_retry: None,
    };

    ctx.publish_listen(&mut machine, None);

    while !shutdown.load(Ordering::Relaxed) {
        match event_rx.recv_timeout(config.event_tick) {
            Ok(event) => ctx.handle_event(&mut machine, event),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if let Some((due, attempt)) = ctx.pending_retry {
            if Instant::now() >= due {
                ctx.pending_retry = None;
                ctx.publish_listen(&mut machine, Some(attempt));
            }
        }

        if machine.state() == TurnState::Speaking {
            let stalled = ctx
                .last_audio
                .lock()
                .map(|last| last.elapsed() >= config.tts_timeout)
                .unwrap_or(false);
            if stalled {
                warn!("no audio within the speaking-turn timeout");
                // Restart the window so the next timeout needs another full
                // silent interval.
                if let Ok(mut last) = ctx.last_audio.lock() {
                    *last = Instant::now();
                }
                let actions = machine.on_event(TurnEvent::StallTimeout);
                ctx.apply(&mut machine, actions);
            }
        }

        if machine.state() == TurnState::Terminating {
            break;
        }
    }

    // Events queued before shutdown still count; an operator abort raced
    // against the flag must reach the server before goodbye.
    while let Ok(event) = event_rx.try_recv() {
        ctx.handle_event(&mut machine, event);
    }

    // A retry that capped the budget is still published before goodbye.
    if let Some((_, attempt)) = ctx.pending_retry.take() {
        ctx.publish_listen(&mut machine, Some(attempt));
    }
    ctx.log_report("final stream report");
    let goodbye = ClientMessage::Goodbye {
        session_id: ctx.session.session_id.clone(),
    };
    if let Err(e) = ctx.publisher.send(&goodbye) {
        warn!(error = %e, "goodbye publish failed");
    }
    shutdown.store(true, Ordering::Relaxed);
    info!("session wound down");
}

impl SessionCtx {
    fn handle_event(&mut self, machine: &mut TurnMachine, event: ClientEvent) {
        match event {
            ClientEvent::Control(msg) => self.handle_control(machine, msg),
            ClientEvent::Operator(OperatorCommand::Abort) => {
                info!("operator abort");
                let actions = machine.on_event(TurnEvent::OperatorAbort);
                self.apply(machine, actions);
            }
            ClientEvent::Operator(OperatorCommand::Status) => {
                self.log_report("status report");
            }
            ClientEvent::FirstAudio => {
                machine.note_audio();
                debug!("first audio packet of the turn");
            }
            ClientEvent::PlayoutStall => {
                // A dry playout buffer alone never abandons the turn; the
                // speaking-turn timeout decides that.
                warn!(state = ?machine.state(), "playout buffering stalled");
            }
        }
    }

    fn handle_control(&mut self, machine: &mut TurnMachine, msg: ServerMessage) {
        match msg {
            ServerMessage::Hello(_) => {
                debug!("ignoring hello, session already established");
            }
            ServerMessage::Tts { state: TtsState::Start } => {
                info!("speaking turn started");
                // The server responded after all; drop any queued re-trigger.
                self.pending_retry = None;
                let actions = machine.on_event(TurnEvent::TtsStart);
                self.apply(machine, actions);
            }
            ServerMessage::Tts { state: TtsState::Stop } => {
                info!("speaking turn ended");
                let actions = machine.on_event(TurnEvent::TtsStop);
                self.apply(machine, actions);
            }
            ServerMessage::Stt { text } => {
                info!(%text, "server transcript");
            }
            ServerMessage::RecordStop => {
                let actions = machine.on_event(TurnEvent::RecordStopRequest);
                self.apply(machine, actions);
            }
            ServerMessage::AbortAck => {
                info!("abort acknowledged");
                let actions = machine.on_event(TurnEvent::AbortAck);
                self.apply(machine, actions);
            }
        }
    }

    fn apply(&mut self, machine: &mut TurnMachine, actions: Vec<TurnAction>) {
        for action in actions {
            match action {
                TurnAction::ResetTracking => {
                    self.reset_tracking.store(true, Ordering::Relaxed);
                    // The inbound loop resets its own counters on the next
                    // packet; zero the shared snapshot now so a turn that
                    // never receives audio reports empty, not stale, totals.
                    if let Ok(mut report) = self.report.lock() {
                        report.tracker = TrackerSummary::default();
                        report.throughput = ThroughputSnapshot::default();
                    }
                    if let Ok(mut last) = self.last_audio.lock() {
                        *last = Instant::now();
                    }
                }
                TurnAction::StartRecording => {
                    self.stop_recording.store(false, Ordering::Relaxed);
                    let _ = self.start_tx.try_send(());
                }
                TurnAction::StopRecording => {
                    self.stop_recording.store(true, Ordering::Relaxed);
                }
                TurnAction::FlushPlayout => {
                    self.flush_playout.store(true, Ordering::Relaxed);
                }
                TurnAction::PublishAbort => {
                    let abort = ClientMessage::Abort {
                        session_id: self.session.session_id.clone(),
                    };
                    if let Err(e) = self.publisher.send(&abort) {
                        warn!(error = %e, "abort publish failed");
                    }
                }
                TurnAction::ScheduleRetry { attempt } => {
                    warn!(attempt, "scheduling listen re-trigger");
                    self.pending_retry = Some((Instant::now() + self.retry_delay, attempt));
                }
                TurnAction::ReportTurn => {
                    self.log_report("turn summary");
                }
                TurnAction::Terminate => {
                    info!("terminating session");
                    self.shutdown.store(true, Ordering::Relaxed);
                }
            }
        }
    }

    fn publish_listen(&mut self, machine: &mut TurnMachine, attempt: Option<u32>) {
        match attempt {
            Some(attempt) => info!(attempt, "re-triggering listen"),
            None => info!("triggering initial listen"),
        }
        let listen = ClientMessage::listen_detect(&self.session.session_id, "");
        match self.publisher.send(&listen) {
            Ok(()) => machine.listen_sent(),
            Err(e) => warn!(error = %e, "listen publish failed"),
        }
    }

    fn log_report(&self, what: &str) {
        let report = match self.report.lock() {
            Ok(report) => report.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        match serde_json::to_string(&report) {
            Ok(json) => info!(report = %json, "{what}"),
            Err(e) => warn!(error = %e, "report serialization failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::audio::{NullSink, PassthroughCodec, SilenceSource};
    use crate::control::{ControlError, ControlTransport};
    use crate::session::AudioParams;

    struct Recorder(Arc<Mutex<Vec<(String, String)>>>);

    impl ControlTransport for Recorder {
        fn publish(&self, topic: &str, payload: String) -> Result<(), ControlError> {
            self.0.lock().unwrap().push((topic.to_owned(), payload));
            Ok(())
        }
    }

    fn start_runtime() -> (ClientRuntime, UdpSocket, Arc<Mutex<Vec<(String, String)>>>) {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        server
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let session = Session::new(
            "test-session",
            [7u8; 16],
            server.local_addr().unwrap(),
            AudioParams::default(),
        );
        let log = Arc::new(Mutex::new(Vec::new()));
        let publisher = ControlPublisher::new(Box::new(Recorder(log.clone())), "test-client");
        let runtime = ClientRuntime::start(
            session,
            publisher,
            Box::new(SilenceSource::new(16, Duration::from_millis(5))),
            Box::new(NullSink::new()),
            Box::new(PassthroughCodec),
            Box::new(PassthroughCodec),
            RuntimeConfig {
                event_tick: Duration::from_millis(10),
                ..RuntimeConfig::default()
            },
        )
        .unwrap();
        (runtime, server, log)
    }

    #[test]
    fn start_sends_ping_with_sequence_one() {
        let (mut runtime, server, _log) = start_runtime();
        let mut buf = [0u8; 256];
        let (len, from) = server.recv_from(&mut buf).unwrap();
        let codec = PacketCodec::new([7u8; 16]);
        let (header, payload) = codec.open(&buf[..len]).unwrap();
        assert_eq!(header.sequence, 1);
        assert_eq!(payload.as_ref(), b"ping:test-session");
        assert_eq!(from.port(), runtime.local_addr().port());
        runtime.shutdown();
    }

    #[test]
    fn start_publishes_initial_listen_to_both_topics() {
        let (mut runtime, _server, log) = start_runtime();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            {
                let log = log.lock().unwrap();
                if log.len() >= 2 {
                    assert!(log[0].1.contains("\"listen\""));
                    assert!(log[1].1.contains("original_payload"));
                    break;
                }
            }
            assert!(std::time::Instant::now() < deadline, "listen never published");
            thread::sleep(Duration::from_millis(10));
        }
        runtime.shutdown();
    }

    #[test]
    fn shutdown_is_idempotent_and_publishes_goodbye() {
        let (mut runtime, _server, log) = start_runtime();
        runtime.shutdown();
        runtime.shutdown();
        let log = log.lock().unwrap();
        assert!(log.iter().any(|(_, payload)| payload.contains("\"goodbye\"")));
    }

    fn wait_until<F: FnMut() -> bool>(mut cond: F, what: &str) {
        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        while !cond() {
            assert!(std::time::Instant::now() < deadline, "timed out on {what}");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn turn_start_clears_the_stream_report() {
        let (mut runtime, server, _log) = start_runtime();
        let mut buf = [0u8; 256];
        let (_, client_addr) = server.recv_from(&mut buf).unwrap();

        let codec = PacketCodec::new([7u8; 16]);
        for seq in 1..=4u32 {
            let packet = codec.seal(b"frame", seq, seq);
            server.send_to(&packet, client_addr).unwrap();
        }
        wait_until(
            || runtime.report().tracker.total_received == 4,
            "packets tracked",
        );

        runtime
            .event_sender()
            .send(ClientEvent::Control(ServerMessage::Tts {
                state: TtsState::Start,
            }))
            .unwrap();

        // A turn that receives nothing must report empty totals, not the
        // previous turn's.
        wait_until(
            || {
                let report = runtime.report();
                report.tracker.total_received == 0 && report.throughput.total_bytes == 0
            },
            "report cleared at turn start",
        );
        runtime.shutdown();
    }

    #[test]
    fn abort_queued_at_shutdown_is_published_before_goodbye() {
        let (mut runtime, _server, log) = start_runtime();
        runtime
            .event_sender()
            .send(ClientEvent::Operator(OperatorCommand::Abort))
            .unwrap();
        runtime.shutdown();

        let log = log.lock().unwrap();
        let abort = log
            .iter()
            .position(|(topic, payload)| {
                topic == crate::control::PRIMARY_TOPIC && payload.contains("\"abort\"")
            })
            .expect("abort was published");
        let goodbye = log
            .iter()
            .position(|(topic, payload)| {
                topic == crate::control::PRIMARY_TOPIC && payload.contains("\"goodbye\"")
            })
            .expect("goodbye was published");
        assert!(abort < goodbye);
    }
}
