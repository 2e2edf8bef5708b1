//! # voxlink-client
//!
//! Device-side client for the Voxlink voice-assistant protocol: a JSON
//! control channel for session negotiation and turn-taking, paired with the
//! encrypted UDP audio transport from [`voxlink_transport`].
//!
//! The control channel, session bootstrap HTTP, and audio hardware are
//! external collaborators injected through trait seams; this crate owns the
//! session/turn state machine and the worker threads binding everything to
//! the socket.
//!
//! ## Crate structure
//!
//! - [`control`] — control-channel message types, dual-topic publication
//! - [`session`] — hello handshake, negotiated parameters, turn state machine
//! - [`audio`] — capture/render/codec trait seams and null implementations
//! - [`runtime`] — inbound/outbound/playback worker threads
//! - [`config`] — binary configuration (TOML + CLI)

pub mod audio;
pub mod config;
pub mod control;
pub mod runtime;
pub mod session;
