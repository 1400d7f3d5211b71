// 🧮 Median Tracker - running median of an append-only multiset
// Two heaps: `lower` (max-heap, smaller half) and `upper` (min-heap, larger half)

use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use thiserror::Error;

/// `median()` was asked of a tracker that never saw a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("median requested from an empty tracker")]
pub struct EmptyTracker;

/// Running median with O(log n) insert and O(1) query.
///
/// Invariants after every insert:
/// - `lower.len() - upper.len()` is 0 or 1
/// - every element of `lower` is <= every element of `upper`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "TrackerSnapshot", into = "TrackerSnapshot")]
pub struct MedianTracker {
    lower: BinaryHeap<u64>,
    upper: BinaryHeap<Reverse<u64>>,
    len: u64,
}

impl MedianTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn insert(&mut self, value: u64) {
        match self.lower.peek() {
            Some(&max_lower) if value > max_lower => self.upper.push(Reverse(value)),
            _ => self.lower.push(value),
        }
        self.len += 1;

        if self.lower.len() > self.upper.len() + 1 {
            if let Some(moved) = self.lower.pop() {
                self.upper.push(Reverse(moved));
            }
        } else if self.upper.len() > self.lower.len() {
            if let Some(Reverse(moved)) = self.upper.pop() {
                self.lower.push(moved);
            }
        }
    }

    /// Median of everything inserted so far.
    ///
    /// Even-sized sets average the two middle values, rounding half up.
    pub fn median(&self) -> Result<u64, EmptyTracker> {
        let &low = self.lower.peek().ok_or(EmptyTracker)?;

        if self.lower.len() == self.upper.len() {
            let &Reverse(high) = self.upper.peek().ok_or(EmptyTracker)?;
            Ok(((low as u128 + high as u128 + 1) / 2) as u64)
        } else {
            Ok(low)
        }
    }

    fn check_invariants(&self) -> Result<(), String> {
        let (lo, hi) = (self.lower.len(), self.upper.len());
        if lo < hi || lo - hi > 1 {
            return Err(format!("unbalanced heaps: lower={} upper={}", lo, hi));
        }
        if (lo + hi) as u64 != self.len {
            return Err(format!("size counter {} != {}", self.len, lo + hi));
        }
        if let (Some(&max_lower), Some(&Reverse(min_upper))) = (self.lower.peek(), self.upper.peek()) {
            if max_lower > min_upper {
                return Err(format!("heaps overlap: {} > {}", max_lower, min_upper));
            }
        }
        Ok(())
    }
}

// ============================================================================
// PERSISTED FORM
// ============================================================================

/// On-disk shape of a tracker: the raw heap contents.
///
/// Loading re-checks the heap invariants so a damaged value is reported
/// instead of silently producing wrong medians.
#[derive(Serialize, Deserialize)]
struct TrackerSnapshot {
    lower: Vec<u64>,
    upper: Vec<u64>,
}

impl From<MedianTracker> for TrackerSnapshot {
    fn from(tracker: MedianTracker) -> Self {
        TrackerSnapshot {
            lower: tracker.lower.into_vec(),
            upper: tracker.upper.into_iter().map(|Reverse(v)| v).collect(),
        }
    }
}

impl TryFrom<TrackerSnapshot> for MedianTracker {
    type Error = String;

    fn try_from(snapshot: TrackerSnapshot) -> Result<Self, Self::Error> {
        let len = (snapshot.lower.len() + snapshot.upper.len()) as u64;
        let tracker = MedianTracker {
            lower: BinaryHeap::from(snapshot.lower),
            upper: snapshot.upper.into_iter().map(Reverse).collect(),
            len,
        };
        tracker.check_invariants()?;
        Ok(tracker)
    }
}
