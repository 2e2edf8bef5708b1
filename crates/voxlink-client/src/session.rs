//! Session bootstrap, negotiated parameters, and the turn state machine.
//!
//! [`negotiate`] runs the hello handshake that establishes a session.
//! [`TurnMachine`] is pure: it consumes [`TurnEvent`]s and returns the
//! [`TurnAction`]s the runtime must carry out, in order. All socket, timer,
//! and channel work stays in [`crate::runtime`].

use std::net::{AddrParseError, IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use serde::{Deserialize, Serialize};
use tracing::debug;
use voxlink_transport::wire::{PacketCodec, KEY_LEN};

use crate::control::{
    ClientMessage, ControlError, ControlPublisher, ServerMessage, SessionOffer,
};

/// Listen re-triggers allowed per session before giving up.
pub const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Consecutive silent-turn timeouts allowed before giving up.
pub const MAX_STALL_TIMEOUTS: u32 = 3;

/// How long a speaking turn may go without audio before it is declared stalled.
pub const TTS_TIMEOUT: Duration = Duration::from_secs(30);

/// Delay before a listen re-trigger is published.
pub const RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session key is not valid hex: {0}")]
    KeyNotHex(#[from] hex::FromHexError),
    #[error("session key must be {KEY_LEN} bytes, got {got}")]
    KeyLength { got: usize },
    #[error("invalid audio host {host:?}: {source}")]
    BadHost {
        host: String,
        source: AddrParseError,
    },
    #[error("control channel failed during handshake: {0}")]
    Handshake(#[from] ControlError),
    #[error("no session offer within {0:?}")]
    OfferTimeout(Duration),
}

/// Stream parameters negotiated in the session offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioParams {
    pub sample_rate: u32,
    pub channels: u8,
    /// Frame duration in milliseconds.
    pub frame_duration: u32,
}

impl AudioParams {
    pub fn samples_per_frame(&self) -> usize {
        (self.sample_rate as usize * self.frame_duration as usize) / 1000
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(u64::from(self.frame_duration))
    }
}

impl Default for AudioParams {
    fn default() -> Self {
        AudioParams {
            sample_rate: 24_000,
            channels: 1,
            frame_duration: 60,
        }
    }
}

/// Decode and validate a hex session key.
pub fn parse_key(hex_key: &str) -> Result<[u8; KEY_LEN], SessionError> {
    let raw = hex::decode(hex_key)?;
    let got = raw.len();
    raw.try_into().map_err(|_| SessionError::KeyLength { got })
}

/// Everything needed to run one audio session.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub key: [u8; KEY_LEN],
    pub remote_addr: SocketAddr,
    pub audio: AudioParams,
}

impl Session {
    pub fn new(
        session_id: impl Into<String>,
        key: [u8; KEY_LEN],
        remote_addr: SocketAddr,
        audio: AudioParams,
    ) -> Self {
        Session {
            session_id: session_id.into(),
            key,
            remote_addr,
            audio,
        }
    }

    /// Build a session from a server offer. The offer's `server` field wins
    /// over `control_host` when present.
    pub fn from_offer(offer: &SessionOffer, control_host: IpAddr) -> Result<Self, SessionError> {
        let key = parse_key(&offer.udp.key)?;
        let host = match &offer.udp.server {
            Some(host) => host.parse().map_err(|source| SessionError::BadHost {
                host: host.clone(),
                source,
            })?,
            None => control_host,
        };
        Ok(Session {
            session_id: offer.session_id.clone(),
            key,
            remote_addr: SocketAddr::new(host, offer.udp.port),
            audio: offer.audio_params,
        })
    }

    pub fn codec(&self) -> PacketCodec {
        PacketCodec::new(self.key)
    }
}

/// Run the hello handshake: publish `hello`, then wait for the server's
/// session offer and build the [`Session`] from it.
///
/// Control messages arriving before the offer are ignored. The offer's UDP
/// host falls back to `control_host` when absent.
pub fn negotiate(
    publisher: &ControlPublisher,
    client_id: &str,
    offers: &Receiver<ServerMessage>,
    control_host: IpAddr,
    timeout: Duration,
) -> Result<Session, SessionError> {
    publisher.send(&ClientMessage::Hello {
        client_id: client_id.to_owned(),
    })?;
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(SessionError::OfferTimeout(timeout));
        }
        match offers.recv_timeout(remaining) {
            Ok(ServerMessage::Hello(offer)) => return Session::from_offer(&offer, control_host),
            Ok(other) => debug!(?other, "ignoring pre-session control message"),
            Err(_) => return Err(SessionError::OfferTimeout(timeout)),
        }
    }
}

/// Strictly increasing outbound sequence counter. Pre-incremented, so the
/// first sealed packet carries sequence 1.
#[derive(Debug, Default)]
pub struct OutboundSequence(u32);

impl OutboundSequence {
    pub fn new() -> Self {
        OutboundSequence(0)
    }

    pub fn next(&mut self) -> u32 {
        self.0 = self.0.wrapping_add(1);
        self.0
    }
}

// ─────────────────────────── Turn state machine ──────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    /// No turn in flight.
    Idle,
    /// A listen was published; waiting for the server to start speaking.
    AwaitingResponse,
    /// Server TTS turn: inbound audio expected.
    Speaking,
    /// Client recording turn: outbound audio flowing.
    Listening,
    /// Session is winding down; no further turns.
    Terminating,
}

/// Inputs to the turn machine: control messages, operator commands, timers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEvent {
    TtsStart,
    TtsStop,
    RecordStopRequest,
    AbortAck,
    OperatorAbort,
    /// No audio arrived for [`TTS_TIMEOUT`] during a speaking turn.
    StallTimeout,
}

/// Side effects the runtime must carry out, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnAction {
    /// Zero sequence tracking and throughput accounting for the new turn.
    ResetTracking,
    /// Clear the stop flag and wake the outbound loop.
    StartRecording,
    /// Raise the stop flag; the outbound loop ends its sub-session.
    StopRecording,
    /// Discard all buffered playout frames.
    FlushPlayout,
    /// Publish an abort to the server.
    PublishAbort,
    /// Publish a listen re-trigger after [`RETRY_DELAY`].
    ScheduleRetry { attempt: u32 },
    /// Log the turn's sequence and throughput summary.
    ReportTurn,
    /// Session is over: goodbye and shut down.
    Terminate,
}

pub struct TurnMachine {
    state: TurnState,
    audio_this_turn: bool,
    retry_attempts: u32,
    stall_timeouts: u32,
}

impl TurnMachine {
    pub fn new() -> Self {
        TurnMachine {
            state: TurnState::Idle,
            audio_this_turn: false,
            retry_attempts: 0,
            stall_timeouts: 0,
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    /// Called after a listen (initial or retry) was published.
    pub fn listen_sent(&mut self) {
        if self.state != TurnState::Terminating {
            self.state = TurnState::AwaitingResponse;
        }
    }

    /// Called when the first audio packet of a turn arrives. Audio proves the
    /// server is alive, so the stall counter starts over.
    pub fn note_audio(&mut self) {
        self.audio_this_turn = true;
        self.stall_timeouts = 0;
    }

    pub fn on_event(&mut self, event: TurnEvent) -> Vec<TurnAction> {
        if self.state == TurnState::Terminating {
            return Vec::new();
        }
        match event {
            TurnEvent::TtsStart => {
                self.state = TurnState::Speaking;
                self.audio_this_turn = false;
                vec![TurnAction::ResetTracking]
            }
            TurnEvent::TtsStop => {
                if self.state != TurnState::Speaking {
                    return Vec::new();
                }
                let mut actions = vec![TurnAction::ReportTurn];
                if self.audio_this_turn {
                    self.state = TurnState::Listening;
                    actions.push(TurnAction::StartRecording);
                } else {
                    // The server ended a turn without sending any audio.
                    actions.extend(self.escalate_retry());
                }
                actions
            }
            TurnEvent::RecordStopRequest => {
                if self.state == TurnState::Listening {
                    vec![TurnAction::StopRecording]
                } else {
                    Vec::new()
                }
            }
            TurnEvent::AbortAck => {
                vec![TurnAction::StopRecording, TurnAction::FlushPlayout]
            }
            TurnEvent::OperatorAbort => {
                vec![TurnAction::PublishAbort, TurnAction::StopRecording]
            }
            TurnEvent::StallTimeout => {
                if self.state != TurnState::Speaking {
                    return Vec::new();
                }
                self.stall_timeouts += 1;
                if self.stall_timeouts >= MAX_STALL_TIMEOUTS {
                    self.state = TurnState::Terminating;
                    vec![TurnAction::Terminate]
                } else {
                    self.escalate_retry()
                }
            }
        }
    }

    /// Burn one retry attempt. The capping attempt is still published, then
    /// the session terminates.
    fn escalate_retry(&mut self) -> Vec<TurnAction> {
        self.retry_attempts += 1;
        let mut actions = vec![TurnAction::ScheduleRetry {
            attempt: self.retry_attempts,
        }];
        if self.retry_attempts >= MAX_RETRY_ATTEMPTS {
            self.state = TurnState::Terminating;
            actions.push(TurnAction::Terminate);
        } else {
            self.state = TurnState::AwaitingResponse;
        }
        actions
    }
}

impl Default for TurnMachine {
    fn default() -> Self {
        Self::new()
    }
}
