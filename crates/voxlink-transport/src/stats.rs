//! # Stream Throughput Stats
//!
//! Monitoring side-channel for the inbound media stream: cumulative byte
//! counter plus once-per-second rate samples. Never consulted for delivery
//! decisions. Snapshots are designed for JSON serialization in diagnostic
//! summaries.

use quanta::Instant;
use serde::Serialize;
use std::time::Duration;

/// Wall-clock spacing between rate samples.
const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

// ─── Samples ────────────────────────────────────────────────────────────────

/// One instantaneous-rate sample: cumulative bytes over cumulative elapsed
/// time, taken at most once per second.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RateSample {
    /// Bytes per second since the meter (re)started.
    pub bytes_per_sec: f64,
    /// Cumulative bytes at sampling time.
    pub total_bytes: u64,
    /// Seconds elapsed since the meter (re)started.
    pub elapsed_secs: f64,
}

// ─── Meter ──────────────────────────────────────────────────────────────────

/// Rolling byte counter with timestamped throughput samples.
///
/// Restarted together with the sequence tracker at every new speaking turn.
#[derive(Debug)]
pub struct ThroughputMeter {
    started_at: Instant,
    last_sample_at: Instant,
    total_bytes: u64,
    samples: Vec<RateSample>,
}

impl ThroughputMeter {
    pub fn new() -> Self {
        let now = Instant::now();
        ThroughputMeter {
            started_at: now,
            last_sample_at: now,
            total_bytes: 0,
            samples: Vec::new(),
        }
    }

    /// Account for one received datagram.
    pub fn record(&mut self, bytes: usize) {
        self.record_at(bytes, Instant::now());
    }

    /// Restart the window. Called at turn start, alongside tracker reset.
    pub fn reset(&mut self) {
        *self = ThroughputMeter::new();
    }

    /// Clock-injected variant of [`record`](Self::record); sampling happens
    /// here so it can be driven deterministically in tests.
    pub fn record_at(&mut self, bytes: usize, now: Instant) {
        self.total_bytes += bytes as u64;

        if now.duration_since(self.last_sample_at) < SAMPLE_INTERVAL {
            return;
        }
        let elapsed = now.duration_since(self.started_at).as_secs_f64();
        if elapsed > 0.0 {
            self.samples.push(RateSample {
                bytes_per_sec: self.total_bytes as f64 / elapsed,
                total_bytes: self.total_bytes,
                elapsed_secs: elapsed,
            });
        }
        self.last_sample_at = now;
    }

    /// Cumulative bytes since the last reset.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Copy-out snapshot: mean and peak of the collected samples.
    pub fn snapshot(&self) -> ThroughputSnapshot {
        self.snapshot_at(Instant::now())
    }

    fn snapshot_at(&self, now: Instant) -> ThroughputSnapshot {
        let sample_count = self.samples.len();
        let (average, peak) = if sample_count == 0 {
            (0.0, 0.0)
        } else {
            let sum: f64 = self.samples.iter().map(|s| s.bytes_per_sec).sum();
            let peak = self
                .samples
                .iter()
                .map(|s| s.bytes_per_sec)
                .fold(0.0, f64::max);
            (sum / sample_count as f64, peak)
        };

        ThroughputSnapshot {
            average_bytes_per_sec: average,
            peak_bytes_per_sec: peak,
            total_bytes: self.total_bytes,
            duration_secs: now.duration_since(self.started_at).as_secs_f64(),
            sample_count,
        }
    }
}

impl Default for ThroughputMeter {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Snapshot ───────────────────────────────────────────────────────────────

/// Point-in-time throughput summary for diagnostics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ThroughputSnapshot {
    pub average_bytes_per_sec: f64,
    pub peak_bytes_per_sec: f64,
    pub total_bytes: u64,
    pub duration_secs: f64,
    pub sample_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_samples_before_one_second() {
        let mut m = ThroughputMeter::new();
        let t0 = m.started_at;
        for i in 0..10 {
            m.record_at(100, t0 + Duration::from_millis(i * 50));
        }
        assert_eq!(m.total_bytes(), 1000);
        assert_eq!(m.snapshot().sample_count, 0);
    }

    #[test]
    fn one_sample_per_elapsed_second() {
        let mut m = ThroughputMeter::new();
        let t0 = m.started_at;
        // 4 packets of 500 B spread over 3 seconds.
        m.record_at(500, t0 + Duration::from_millis(10));
        m.record_at(500, t0 + Duration::from_millis(1100));
        m.record_at(500, t0 + Duration::from_millis(1200)); // same window
        m.record_at(500, t0 + Duration::from_millis(2900));

        let snap = m.snapshot();
        assert_eq!(snap.sample_count, 2);
        assert_eq!(snap.total_bytes, 2000);
    }

    #[test]
    fn rate_is_cumulative_bytes_over_cumulative_time() {
        let mut m = ThroughputMeter::new();
        let t0 = m.started_at;
        m.record_at(1000, t0 + Duration::from_secs(1));
        let snap = m.snapshot();
        assert_eq!(snap.sample_count, 1);
        assert!((snap.average_bytes_per_sec - 1000.0).abs() < 1.0);
    }

    #[test]
    fn peak_tracks_fastest_sample() {
        let mut m = ThroughputMeter::new();
        let t0 = m.started_at;
        m.record_at(4000, t0 + Duration::from_secs(1)); // 4000 B/s
        m.record_at(0, t0 + Duration::from_secs(4)); // 1000 B/s cumulative

        let snap = m.snapshot();
        assert_eq!(snap.sample_count, 2);
        assert!(snap.peak_bytes_per_sec > snap.average_bytes_per_sec);
        assert!((snap.peak_bytes_per_sec - 4000.0).abs() < 1.0);
    }

    #[test]
    fn reset_clears_everything() {
        let mut m = ThroughputMeter::new();
        let t0 = m.started_at;
        m.record_at(1000, t0 + Duration::from_secs(2));
        m.reset();
        assert_eq!(m.total_bytes(), 0);
        let snap = m.snapshot();
        assert_eq!(snap.sample_count, 0);
        assert_eq!(snap.average_bytes_per_sec, 0.0);
    }

    #[test]
    fn empty_snapshot_serializes() {
        let snap = ThroughputMeter::new().snapshot();
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("\"sample_count\":0"));
    }
}
