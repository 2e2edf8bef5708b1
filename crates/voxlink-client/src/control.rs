//! Control-channel message types and publication.
//!
//! The control channel itself (broker, reconnects, QoS) lives outside this
//! crate behind [`ControlTransport`]; it is assumed to deliver JSON payloads
//! reliably and in order per topic. This module owns the message vocabulary
//! and the dual-topic fan-out every client message goes through.

use serde::{Deserialize, Serialize};

use crate::session::AudioParams;

/// Topic the server consumes client messages from.
pub const PRIMARY_TOPIC: &str = "device-server";

/// Ingestion topic carrying the same messages wrapped in an
/// [`IngestEnvelope`] for backend consumers that need sender attribution.
pub const INGEST_TOPIC: &str = "internal/server-ingest";

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("control publish failed: {0}")]
    Publish(String),
    #[error("message serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

// ─────────────────────────── Server → client ────────────────────────────

/// Messages the server delivers over the control channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Session grant: UDP endpoint, session key, audio parameters.
    Hello(SessionOffer),
    /// TTS turn boundary.
    Tts { state: TtsState },
    /// Transcript of what the server heard, informational.
    Stt {
        #[serde(default)]
        text: String,
    },
    /// Server asks the client to end the current recording sub-session.
    RecordStop,
    /// Server confirms an abort request.
    AbortAck,
}

/// Payload of a `hello` message.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionOffer {
    pub session_id: String,
    pub udp: UdpOffer,
    pub audio_params: AudioParams,
}

/// UDP endpoint description inside a [`SessionOffer`].
#[derive(Debug, Clone, Deserialize)]
pub struct UdpOffer {
    /// Hex-encoded 16-byte session key.
    pub key: String,
    pub port: u16,
    /// Audio host, when it differs from the control host.
    #[serde(default)]
    pub server: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtsState {
    Start,
    Stop,
}

// ─────────────────────────── Client → server ────────────────────────────

/// Messages the client publishes.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Hello {
        client_id: String,
    },
    /// Triggers (or re-triggers) a conversation turn.
    Listen {
        session_id: String,
        state: ListenState,
        text: String,
    },
    Abort {
        session_id: String,
    },
    Goodbye {
        session_id: String,
    },
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ListenState {
    Detect,
}

impl ClientMessage {
    /// A `listen` in wake-word-detect mode, the only mode this client uses.
    pub fn listen_detect(session_id: &str, text: &str) -> Self {
        ClientMessage::Listen {
            session_id: session_id.to_owned(),
            state: ListenState::Detect,
            text: text.to_owned(),
        }
    }
}

/// Wrapper republished on [`INGEST_TOPIC`] so backend consumers see who sent
/// the original message.
#[derive(Debug, Serialize)]
pub struct IngestEnvelope<'a> {
    pub original_payload: &'a ClientMessage,
    pub sender_id: &'a str,
}

// ───────────────────────────── Publication ──────────────────────────────

/// Delivery seam for the external control channel.
pub trait ControlTransport: Send {
    /// Deliver one JSON payload to a topic.
    fn publish(&self, topic: &str, payload: String) -> Result<(), ControlError>;
}

/// Publishes every client message twice: as-is on the primary topic, and
/// wrapped in an [`IngestEnvelope`] on the ingestion topic.
pub struct ControlPublisher {
    transport: Box<dyn ControlTransport>,
    sender_id: String,
}

impl ControlPublisher {
    pub fn new(transport: Box<dyn ControlTransport>, sender_id: impl Into<String>) -> Self {
        ControlPublisher {
            transport,
            sender_id: sender_id.into(),
        }
    }

    pub fn send(&self, msg: &ClientMessage) -> Result<(), ControlError> {
        let payload = serde_json::to_string(msg)?;
        self.transport.publish(PRIMARY_TOPIC, payload)?;
        let wrapped = serde_json::to_string(&IngestEnvelope {
            original_payload: msg,
            sender_id: &self.sender_id,
        })?;
        self.transport.publish(INGEST_TOPIC, wrapped)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    struct Recorder(Arc<Mutex<Vec<(String, String)>>>);

    impl ControlTransport for Recorder {
        fn publish(&self, topic: &str, payload: String) -> Result<(), ControlError> {
            self.0.lock().unwrap().push((topic.to_owned(), payload));
            Ok(())
        }
    }

    #[test]
    fn parses_hello_offer() {
        let json = r#"{
            "type": "hello",
            "session_id": "abc-123",
            "udp": { "key": "000102030405060708090a0b0c0d0e0f", "port": 5004, "server": "10.0.0.2" },
            "audio_params": { "sample_rate": 24000, "channels": 1, "frame_duration": 60 }
        }"#;
        let msg: ServerMessage = serde_json::from_str(json).unwrap();
        match msg {
            ServerMessage::Hello(offer) => {
                assert_eq!(offer.session_id, "abc-123");
                assert_eq!(offer.udp.port, 5004);
                assert_eq!(offer.udp.server.as_deref(), Some("10.0.0.2"));
                assert_eq!(offer.audio_params.sample_rate, 24000);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parses_tts_boundaries() {
        let start: ServerMessage =
            serde_json::from_str(r#"{"type":"tts","state":"start"}"#).unwrap();
        let stop: ServerMessage = serde_json::from_str(r#"{"type":"tts","state":"stop"}"#).unwrap();
        assert!(matches!(
            start,
            ServerMessage::Tts {
                state: TtsState::Start
            }
        ));
        assert!(matches!(
            stop,
            ServerMessage::Tts {
                state: TtsState::Stop
            }
        ));
    }

    #[test]
    fn parses_stt_without_text() {
        let msg: ServerMessage = serde_json::from_str(r#"{"type":"stt"}"#).unwrap();
        assert!(matches!(msg, ServerMessage::Stt { text } if text.is_empty()));
    }

    #[test]
    fn listen_serializes_in_detect_mode() {
        let msg = ClientMessage::listen_detect("abc", "hey assistant");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "listen");
        assert_eq!(json["state"], "detect");
        assert_eq!(json["session_id"], "abc");
        assert_eq!(json["text"], "hey assistant");
    }

    #[test]
    fn publisher_fans_out_to_both_topics() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let publisher = ControlPublisher::new(Box::new(Recorder(log.clone())), "dev-7");
        publisher
            .send(&ClientMessage::Goodbye {
                session_id: "abc".into(),
            })
            .unwrap();

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].0, PRIMARY_TOPIC);
        assert_eq!(log[1].0, INGEST_TOPIC);

        let wrapped: serde_json::Value = serde_json::from_str(&log[1].1).unwrap();
        assert_eq!(wrapped["sender_id"], "dev-7");
        assert_eq!(wrapped["original_payload"]["type"], "goodbye");
        assert_eq!(wrapped["original_payload"]["session_id"], "abc");
    }
}
