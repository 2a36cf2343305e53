#![forbid(unsafe_code)]

//! Aggregate counters, the saved-bytes ledger and its bounded history.
//!
//! Saved bytes are built from [`crate::Codec::estimate_size`] and are an
//! approximation by construction. The ledger only guarantees that they never
//! go negative and that a collapse followed by its restore nets to zero.

use std::cell::Cell;
use std::collections::VecDeque;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use web_time::{SystemTime, UNIX_EPOCH};

use crate::entry::Role;

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Wall-clock source for history timestamps (ms since the Unix epoch).
pub trait Clock: core::fmt::Debug {
    fn now_ms(&self) -> u64;
}

/// Real time; backed by `Date.now()` on wasm32.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64)
    }
}

/// Host-controlled clock for deterministic tests. Clones share the same time.
#[derive(Debug, Default, Clone)]
pub struct ManualClock {
    now: Rc<Cell<u64>>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: Rc::new(Cell::new(start_ms)),
        }
    }

    pub fn set(&self, ms: u64) {
        self.now.set(ms);
    }

    pub fn advance(&self, ms: u64) {
        self.now.set(self.now.get().saturating_add(ms));
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.get()
    }
}

// ---------------------------------------------------------------------------
// Memory history
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryDataPoint {
    pub timestamp: u64,
    pub saved_bytes: u64,
}

/// Bounded, ordered sample buffer. Oldest samples are evicted first.
#[derive(Debug, Clone)]
pub struct MemoryHistory {
    capacity: usize,
    points: VecDeque<MemoryDataPoint>,
}

impl MemoryHistory {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            points: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, point: MemoryDataPoint) {
        while self.points.len() >= self.capacity {
            self.points.pop_front();
        }
        self.points.push_back(point);
    }

    /// Owned copy; later pushes do not show through it.
    #[must_use]
    pub fn snapshot(&self) -> Vec<MemoryDataPoint> {
        self.points.iter().copied().collect()
    }

    #[must_use]
    pub fn latest(&self) -> Option<MemoryDataPoint> {
        self.points.back().copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }
}

/// Saved-bytes counter plus its sample history.
#[derive(Debug)]
pub struct MemoryLedger {
    saved_bytes: u64,
    history: MemoryHistory,
    clock: Box<dyn Clock>,
}

impl MemoryLedger {
    #[must_use]
    pub fn new(history_capacity: usize) -> Self {
        Self::with_clock(history_capacity, Box::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(history_capacity: usize, clock: Box<dyn Clock>) -> Self {
        Self {
            saved_bytes: 0,
            history: MemoryHistory::new(history_capacity),
            clock,
        }
    }

    #[must_use]
    pub const fn saved_bytes(&self) -> u64 {
        self.saved_bytes
    }

    pub fn add(&mut self, bytes: u64) {
        self.saved_bytes = self.saved_bytes.saturating_add(bytes);
    }

    pub fn sub(&mut self, bytes: u64) {
        self.saved_bytes = self.saved_bytes.saturating_sub(bytes);
    }

    /// Append `{now, saved_bytes}` to the history.
    pub fn record_sample(&mut self) {
        self.history.push(MemoryDataPoint {
            timestamp: self.clock.now_ms(),
            saved_bytes: self.saved_bytes,
        });
    }

    #[must_use]
    pub fn history(&self) -> Vec<MemoryDataPoint> {
        self.history.snapshot()
    }

    #[must_use]
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Zero the counter and drop the history.
    pub fn reset(&mut self) {
        self.saved_bytes = 0;
        self.history.clear();
    }
}

// ---------------------------------------------------------------------------
// Snapshots for consumers
// ---------------------------------------------------------------------------

/// Aggregate virtualization counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub total: usize,
    pub active: usize,
    pub collapsed: usize,
    pub saved_bytes: u64,
    /// Live element count of the whole document. Diagnostic only.
    pub dom_node_count: usize,
}

impl Stats {
    /// `(total, active, collapsed)`, the fields that trigger change hooks.
    #[must_use]
    pub const fn counts(&self) -> (usize, usize, usize) {
        (self.total, self.active, self.collapsed)
    }
}

/// One entry as seen by export/search consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedEntry {
    pub role: Role,
    pub content: String,
}

/// Per-conversation text statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationStats {
    pub total_messages: usize,
    pub user_messages: usize,
    pub assistant_messages: usize,
    pub total_words: usize,
    pub user_words: usize,
    pub assistant_words: usize,
    /// Roughly four characters per token.
    pub estimated_tokens: usize,
}

impl ConversationStats {
    #[must_use]
    pub fn from_entries(entries: &[ExtractedEntry]) -> Self {
        let mut stats = Self {
            total_messages: entries.len(),
            ..Self::default()
        };
        let mut chars = 0usize;
        for entry in entries {
            chars += entry.content.chars().count() + 1;
            let words = entry.content.split_whitespace().count();
            match entry.role {
                Role::User => {
                    stats.user_messages += 1;
                    stats.user_words += words;
                }
                Role::Assistant => {
                    stats.assistant_messages += 1;
                    stats.assistant_words += words;
                }
                Role::Unknown => {}
            }
        }
        stats.total_words = stats.user_words + stats.assistant_words;
        stats.estimated_tokens = chars.div_ceil(4);
        stats
    }
}
