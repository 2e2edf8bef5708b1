//! # voxlink-transport
//!
//! Pure-logic core of the Voxlink media transport.
//!
//! Binary packet framing with per-packet stream encryption, per-turn
//! delivery-quality accounting, and the jitter-buffered playout scheduler
//! that smooths the lossy inbound stream into a steady render cadence.
//! No sockets, no audio devices — the client crate owns all I/O.
//!
//! ## Crate structure
//!
//! - [`wire`] — 16-byte header codec, AES-CTR packet sealing
//! - [`tracker`] — sequence-integrity accounting (loss, dupes, reordering)
//! - [`jitter`] — Buffering/Rendering playout state machine
//! - [`stats`] — throughput sampling side-channel

pub mod jitter;
pub mod stats;
pub mod tracker;
pub mod wire;
