//! Bounded reading history.
//!
//! [`SignalBuffer`] keeps the most recent readings in arrival order.  When it
//! is full, appending evicts the oldest entry, so memory use is fixed for the
//! lifetime of the loop no matter how long it runs.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use rtjoint_perception::buffer::SignalBuffer;
//! use rtjoint_types::{Reading, SignalKind};
//!
//! let mut buf = SignalBuffer::new(3);
//! for ms in 1..=5 {
//!     buf.append(Reading {
//!         timestamp: Duration::from_millis(ms),
//!         channel: "hip_left".into(),
//!         kind: SignalKind::Position,
//!         value: ms as f64,
//!     });
//! }
//! let values: Vec<f64> = buf.recent(3).iter().map(|r| r.value).collect();
//! assert_eq!(values, vec![3.0, 4.0, 5.0]);
//! ```

use std::collections::VecDeque;
use std::time::Duration;

use rtjoint_types::{Reading, SignalKind};

/// Capacity used when none is configured.
pub const DEFAULT_CAPACITY: usize = 1000;

/// Fixed-capacity FIFO of [`Reading`]s.
#[derive(Debug, Clone)]
pub struct SignalBuffer {
    entries: VecDeque<Reading>,
    capacity: usize,
}

impl Default for SignalBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl SignalBuffer {
    /// Create an empty buffer holding at most `capacity` readings.  A
    /// capacity of zero is legal and keeps nothing.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append `reading`, evicting the oldest entry when full.
    pub fn append(&mut self, reading: Reading) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(reading);
    }

    /// The last `n` readings, oldest first.  Returns fewer when the buffer
    /// holds fewer.
    pub fn recent(&self, n: usize) -> Vec<&Reading> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).collect()
    }

    /// All readings with `timestamp >= since`, optionally restricted to one
    /// signal kind, oldest first.
    pub fn since(&self, since: Duration, kind: Option<SignalKind>) -> Vec<&Reading> {
        self.entries
            .iter()
            .filter(|r| r.timestamp >= since)
            .filter(|r| kind.is_none_or(|k| r.kind == k))
            .collect()
    }

    /// Most recent reading of `kind`, if any is still buffered.
    pub fn latest(&self, kind: SignalKind) -> Option<&Reading> {
        self.entries.iter().rev().find(|r| r.kind == kind)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
