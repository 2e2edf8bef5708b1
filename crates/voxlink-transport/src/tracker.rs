//! # Sequence Tracker
//!
//! Per-turn delivery-quality accounting for the inbound media stream:
//! duplicates, out-of-order arrivals, and gaps (missing packets), with an
//! ordered gap log for diagnostics.
//!
//! Pure mutation of state, no I/O. Single writer — only the inbound loop
//! calls [`SequenceTracker::observe`]; readers take a [`TrackerSummary`]
//! copy-out. Monitoring only: nothing here feeds back into delivery
//! decisions.

use quanta::Instant;
use serde::Serialize;
use std::time::Duration;

/// How many trailing gap records a summary carries.
const SUMMARY_GAP_TAIL: usize = 5;

// ─── Gap Record ─────────────────────────────────────────────────────────────

/// A logged discontinuity in received sequence numbers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GapRecord {
    /// Sequence number we expected next.
    pub expected: u32,
    /// Sequence number that actually arrived.
    pub received: u32,
    /// Number of packets missing in between.
    pub gap_size: u32,
    /// Time since the turn started when the gap was detected.
    pub detected_after: Duration,
}

// ─── Tracker ────────────────────────────────────────────────────────────────

/// Sequence-integrity accounting for one inbound stream.
///
/// Reset at the start of every speaking turn, never mid-turn.
#[derive(Debug)]
pub struct SequenceTracker {
    expected: u32,
    last_received: u32,
    total_received: u64,
    duplicates: u64,
    out_of_order: u64,
    missing: u64,
    gaps: Vec<GapRecord>,
    started_at: Instant,
}

impl SequenceTracker {
    /// Fresh tracker: server streams start at sequence 1.
    pub fn new() -> Self {
        SequenceTracker {
            expected: 1,
            last_received: 0,
            total_received: 0,
            duplicates: 0,
            out_of_order: 0,
            missing: 0,
            gaps: Vec::new(),
            started_at: Instant::now(),
        }
    }

    /// Classify one received sequence number.
    ///
    /// Returns the gap record when this packet reveals missing predecessors.
    /// Classification runs against the pre-update `expected` value:
    ///
    /// - `seq < expected` and `seq <= last_received`: duplicate
    /// - `seq < expected` otherwise: out-of-order (late fill of a known gap)
    /// - `seq > expected`: gap of `seq - expected` missing packets
    ///
    /// then `last_received`/`expected` advance only when `seq` is the new
    /// high-water mark.
    pub fn observe(&mut self, sequence: u32) -> Option<GapRecord> {
        self.total_received += 1;

        let mut gap = None;
        if sequence < self.expected {
            if sequence <= self.last_received {
                self.duplicates += 1;
            } else {
                self.out_of_order += 1;
            }
        } else if sequence > self.expected {
            let gap_size = sequence - self.expected;
            self.missing += gap_size as u64;
            let record = GapRecord {
                expected: self.expected,
                received: sequence,
                gap_size,
                detected_after: self.started_at.elapsed(),
            };
            self.gaps.push(record.clone());
            gap = Some(record);
        }

        if sequence > self.last_received {
            self.last_received = sequence;
            self.expected = sequence.wrapping_add(1);
        }
        gap
    }

    /// Zero every counter and restart the turn clock. Idempotent.
    pub fn reset(&mut self) {
        *self = SequenceTracker::new();
    }

    /// Total packets observed this turn (including duplicates).
    pub fn total_received(&self) -> u64 {
        self.total_received
    }

    /// Whether any packet at all arrived this turn.
    pub fn saw_audio(&self) -> bool {
        self.total_received > 0
    }

    /// Next sequence number expected.
    pub fn expected(&self) -> u32 {
        self.expected
    }

    /// Highest sequence number seen.
    pub fn last_received(&self) -> u32 {
        self.last_received
    }

    /// All gap records, in detection order.
    pub fn gaps(&self) -> &[GapRecord] {
        &self.gaps
    }

    /// Copy-out snapshot for reporting from other threads.
    pub fn summary(&self) -> TrackerSummary {
        TrackerSummary {
            total_received: self.total_received,
            last_sequence: self.last_received,
            missing: self.missing,
            duplicates: self.duplicates,
            out_of_order: self.out_of_order,
            gap_count: self.gaps.len(),
            recent_gaps: self
                .gaps
                .iter()
                .rev()
                .take(SUMMARY_GAP_TAIL)
                .rev()
                .cloned()
                .collect(),
        }
    }
}

impl Default for SequenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Summary ────────────────────────────────────────────────────────────────

/// Point-in-time view of tracker counters, safe to ship across threads.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TrackerSummary {
    pub total_received: u64,
    pub last_sequence: u32,
    pub missing: u64,
    pub duplicates: u64,
    pub out_of_order: u64,
    pub gap_count: usize,
    /// Last few gaps, oldest first.
    pub recent_gaps: Vec<GapRecord>,
}

impl TrackerSummary {
    /// Missing packets as a fraction of the highest sequence seen.
    pub fn loss_rate(&self) -> f64 {
        if self.last_sequence == 0 {
            0.0
        } else {
            self.missing as f64 / self.last_sequence as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order_stream_is_clean() {
        let mut t = SequenceTracker::new();
        for seq in 1..=10 {
            assert!(t.observe(seq).is_none());
        }
        let s = t.summary();
        assert_eq!(s.total_received, 10);
        assert_eq!(s.last_sequence, 10);
        assert_eq!(s.missing, 0);
        assert_eq!(s.duplicates, 0);
        assert_eq!(s.out_of_order, 0);
        assert_eq!(t.expected(), 11);
    }

    #[test]
    fn mixed_stream_classification() {
        // 1, 2, 4 (gap), 3 (late fill), 2 (dupe), 5
        let mut t = SequenceTracker::new();
        assert!(t.observe(1).is_none());
        assert!(t.observe(2).is_none());

        let gap = t.observe(4).expect("gap at 3");
        assert_eq!(gap.expected, 3);
        assert_eq!(gap.received, 4);
        assert_eq!(gap.gap_size, 1);

        assert!(t.observe(3).is_none());
        assert!(t.observe(2).is_none());
        assert!(t.observe(5).is_none());

        let s = t.summary();
        assert_eq!(s.missing, 1);
        assert_eq!(s.duplicates, 1);
        assert_eq!(s.out_of_order, 1);
        assert_eq!(s.last_sequence, 5);
        assert_eq!(t.expected(), 6);
        assert_eq!(s.total_received, 6);
    }

    #[test]
    fn wide_gap_counts_every_missing_packet() {
        let mut t = SequenceTracker::new();
        t.observe(1);
        let gap = t.observe(10).unwrap();
        assert_eq!(gap.expected, 2);
        assert_eq!(gap.gap_size, 8);
        assert_eq!(t.summary().missing, 8);
    }

    #[test]
    fn duplicate_does_not_move_high_water_mark() {
        let mut t = SequenceTracker::new();
        t.observe(1);
        t.observe(2);
        t.observe(2);
        assert_eq!(t.last_received(), 2);
        assert_eq!(t.expected(), 3);
        assert_eq!(t.summary().duplicates, 1);
    }

    #[test]
    fn reset_is_idempotent() {
        let mut t = SequenceTracker::new();
        t.observe(1);
        t.observe(5);
        t.reset();
        let once = t.summary();
        t.reset();
        let twice = t.summary();

        assert_eq!(once.total_received, twice.total_received);
        assert_eq!(once.missing, twice.missing);
        assert_eq!(once.gap_count, twice.gap_count);
        assert_eq!(t.expected(), 1);
        assert_eq!(t.last_received(), 0);
        assert!(!t.saw_audio());
    }

    #[test]
    fn summary_keeps_last_five_gaps_oldest_first() {
        let mut t = SequenceTracker::new();
        // Gaps at every other sequence: observe 2, 4, 6, ... each skips one.
        let mut seq = 0;
        for _ in 0..8 {
            seq += 2;
            t.observe(seq);
        }
        let s = t.summary();
        assert_eq!(s.gap_count, 8);
        assert_eq!(s.recent_gaps.len(), 5);
        assert!(s.recent_gaps[0].expected < s.recent_gaps[4].expected);
    }

    #[test]
    fn loss_rate() {
        let mut t = SequenceTracker::new();
        t.observe(1);
        t.observe(4); // 2 missing out of 4
        let s = t.summary();
        assert!((s.loss_rate() - 0.5).abs() < 1e-9);
        assert_eq!(TrackerSummary::default().loss_rate(), 0.0);
    }

    #[test]
    fn summary_serializes() {
        let mut t = SequenceTracker::new();
        t.observe(1);
        t.observe(3);
        let json = serde_json::to_string(&t.summary()).unwrap();
        assert!(json.contains("\"missing\":1"));
        assert!(json.contains("\"recent_gaps\""));
    }
}
