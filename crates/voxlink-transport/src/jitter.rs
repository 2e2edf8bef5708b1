//! # Jitter Buffer / Playout Scheduler
//!
//! Decouples network arrival jitter from steady-rate rendering. Pure state
//! machine — the playback thread owns the clock and the sink, and drives
//! this via [`JitterBuffer::poll`].
//!
//! ```text
//!   Buffering ──(len ≥ start_threshold)──▶ Rendering
//!   Rendering ──(len < min_threshold)────▶ Buffering
//! ```
//!
//! The asymmetric thresholds create hysteresis: once the buffer drains it
//! must refill all the way to `start_threshold` before rendering resumes,
//! which prevents oscillation under marginal jitter. A Buffering phase that
//! outlives `buffer_timeout` reports a stall and restarts its window; the
//! session layer decides what to do about it.

use bytes::Bytes;
use quanta::Instant;
use std::collections::VecDeque;
use std::time::Duration;

// ─── Configuration ──────────────────────────────────────────────────────────

/// Playout scheduler thresholds.
#[derive(Debug, Clone)]
pub struct JitterConfig {
    /// Frames required before rendering starts (or resumes).
    pub start_threshold: usize,
    /// Rendering falls back to Buffering below this depth.
    pub min_threshold: usize,
    /// How long Buffering may last before a stall is reported.
    pub buffer_timeout: Duration,
}

impl Default for JitterConfig {
    fn default() -> Self {
        JitterConfig {
            start_threshold: 16,
            min_threshold: 3,
            buffer_timeout: Duration::from_secs(10),
        }
    }
}

// ─── State ──────────────────────────────────────────────────────────────────

/// Scheduler phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayoutState {
    /// Accumulating frames; nothing is rendered.
    Buffering,
    /// Dequeuing one frame per tick.
    Rendering,
}

/// Outcome of one scheduler tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayoutPoll {
    /// Hand this frame to the rendering sink.
    Frame(Bytes),
    /// Still buffering; nothing to render.
    Buffering,
    /// Buffering exceeded its timeout; the window has been restarted.
    /// Does not abandon the turn by itself.
    Stalled,
}

// ─── Buffer ─────────────────────────────────────────────────────────────────

/// FIFO of decoded audio frames plus the Buffering/Rendering state machine.
///
/// Frames arrive in decode order from the inbound loop; ownership transfers
/// to the playback thread on dequeue.
#[derive(Debug)]
pub struct JitterBuffer {
    queue: VecDeque<Bytes>,
    state: PlayoutState,
    buffering_since: Instant,
    config: JitterConfig,
}

impl JitterBuffer {
    pub fn new(config: JitterConfig) -> Self {
        JitterBuffer {
            queue: VecDeque::with_capacity(config.start_threshold * 2),
            state: PlayoutState::Buffering,
            buffering_since: Instant::now(),
            config,
        }
    }

    /// Enqueue one decoded frame. Frames that failed to decode must be
    /// dropped upstream — they never reach the buffer and never count
    /// toward thresholds.
    pub fn push(&mut self, frame: Bytes) {
        self.queue.push_back(frame);
    }

    /// One scheduler tick.
    pub fn poll(&mut self, now: Instant) -> PlayoutPoll {
        if self.state == PlayoutState::Buffering {
            if self.queue.len() >= self.config.start_threshold {
                tracing::debug!(depth = self.queue.len(), "playout buffer ready");
                self.state = PlayoutState::Rendering;
            } else if now.duration_since(self.buffering_since) > self.config.buffer_timeout {
                self.buffering_since = now;
                return PlayoutPoll::Stalled;
            } else {
                return PlayoutPoll::Buffering;
            }
        }

        // Rendering: fall back to Buffering before the queue runs dry.
        if self.queue.len() < self.config.min_threshold {
            tracing::debug!(depth = self.queue.len(), "playout buffer low, re-buffering");
            self.enter_buffering(now);
            return PlayoutPoll::Buffering;
        }

        match self.queue.pop_front() {
            Some(frame) => PlayoutPoll::Frame(frame),
            None => {
                self.enter_buffering(now);
                PlayoutPoll::Buffering
            }
        }
    }

    /// Discard every buffered frame (abort handling). Returns the number of
    /// frames dropped. The scheduler re-buffers on the next poll.
    pub fn flush(&mut self, now: Instant) -> usize {
        let dropped = self.queue.len();
        self.queue.clear();
        if self.state == PlayoutState::Rendering {
            self.enter_buffering(now);
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn state(&self) -> PlayoutState {
        self.state
    }

    fn enter_buffering(&mut self, now: Instant) {
        self.state = PlayoutState::Buffering;
        self.buffering_since = now;
    }
}

impl Default for JitterBuffer {
    fn default() -> Self {
        Self::new(JitterConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(n: u8) -> Bytes {
        Bytes::from(vec![n; 4])
    }

    fn small_config() -> JitterConfig {
        JitterConfig {
            start_threshold: 4,
            min_threshold: 2,
            buffer_timeout: Duration::from_millis(50),
        }
    }

    #[test]
    fn starts_buffering_until_threshold() {
        let mut jb = JitterBuffer::new(small_config());
        let now = Instant::now();

        assert_eq!(jb.state(), PlayoutState::Buffering);
        for i in 0..3 {
            jb.push(frame(i));
            assert_eq!(jb.poll(now), PlayoutPoll::Buffering);
        }

        jb.push(frame(3));
        assert!(matches!(jb.poll(now), PlayoutPoll::Frame(_)));
        assert_eq!(jb.state(), PlayoutState::Rendering);
    }

    #[test]
    fn frames_come_out_in_arrival_order() {
        let mut jb = JitterBuffer::new(small_config());
        let now = Instant::now();
        for i in 0..6 {
            jb.push(frame(i));
        }
        for i in 0..4 {
            match jb.poll(now) {
                PlayoutPoll::Frame(f) => assert_eq!(f[0], i),
                other => panic!("expected frame, got {other:?}"),
            }
        }
    }

    #[test]
    fn rebuffers_below_min_threshold_with_hysteresis() {
        // Start 16, min 3: drain to 2, then stay buffering until depth
        // reaches 16 again.
        let mut jb = JitterBuffer::new(JitterConfig {
            start_threshold: 16,
            min_threshold: 3,
            buffer_timeout: Duration::from_secs(10),
        });
        let now = Instant::now();

        for i in 0..16 {
            jb.push(frame(i));
        }
        assert!(matches!(jb.poll(now), PlayoutPoll::Frame(_)));
        assert_eq!(jb.state(), PlayoutState::Rendering);

        // Drain until two frames remain.
        while jb.len() > 2 {
            assert!(matches!(jb.poll(now), PlayoutPoll::Frame(_)));
        }

        // 2 < min_threshold: next tick re-buffers without rendering.
        assert_eq!(jb.poll(now), PlayoutPoll::Buffering);
        assert_eq!(jb.state(), PlayoutState::Buffering);

        // Well above min but below start: still buffering.
        for i in 0..13 {
            jb.push(frame(i));
            assert_eq!(jb.poll(now), PlayoutPoll::Buffering);
        }

        // Reaching start_threshold (2 + 14 = 16) resumes rendering.
        jb.push(frame(0));
        assert!(matches!(jb.poll(now), PlayoutPoll::Frame(_)));
        assert_eq!(jb.state(), PlayoutState::Rendering);
    }

    #[test]
    fn stall_reported_after_timeout_and_window_restarts() {
        let mut jb = JitterBuffer::new(small_config());
        let start = Instant::now();

        assert_eq!(jb.poll(start), PlayoutPoll::Buffering);

        let late = start + Duration::from_millis(100);
        assert_eq!(jb.poll(late), PlayoutPoll::Stalled);
        // Window restarted: immediate re-poll is plain Buffering again.
        assert_eq!(jb.poll(late), PlayoutPoll::Buffering);

        // And stalls again a full timeout later.
        let later = late + Duration::from_millis(100);
        assert_eq!(jb.poll(later), PlayoutPoll::Stalled);
    }

    #[test]
    fn stall_does_not_drop_frames() {
        let mut jb = JitterBuffer::new(small_config());
        let start = Instant::now();
        jb.push(frame(1));
        assert_eq!(jb.poll(start + Duration::from_secs(1)), PlayoutPoll::Stalled);
        assert_eq!(jb.len(), 1);
    }

    #[test]
    fn flush_discards_and_rebuffers() {
        let mut jb = JitterBuffer::new(small_config());
        let now = Instant::now();
        for i in 0..5 {
            jb.push(frame(i));
        }
        assert!(matches!(jb.poll(now), PlayoutPoll::Frame(_)));
        assert_eq!(jb.state(), PlayoutState::Rendering);

        assert_eq!(jb.flush(now), 4);
        assert!(jb.is_empty());
        assert_eq!(jb.state(), PlayoutState::Buffering);
        assert_eq!(jb.poll(now), PlayoutPoll::Buffering);
    }
}
