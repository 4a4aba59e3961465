use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local};

use super::event::KeyInput;

/// Maximum number of key events kept for diagnostics.
pub const RECENT_KEYS_CAPACITY: usize = 30;
/// Number of newest events returned by `getRecentKeys`.
pub const RECENT_KEYS_REPORTED: usize = 15;

pub type SharedRecentKeys = Arc<Mutex<RecentKeys>>;

/// One observed key transition.
#[derive(Debug, Clone)]
pub struct KeyEventRecord {
    pub label: String,
    /// `DOWN`, `UP` or `REPEAT`.
    pub action: &'static str,
    pub at: DateTime<Local>,
}

impl KeyEventRecord {
    pub fn new(input: &KeyInput, at: DateTime<Local>) -> Self {
        Self {
            label: input.key.label().to_string(),
            action: input.action_label(),
            at,
        }
    }
}

impl fmt::Display for KeyEventRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.at.format("%H:%M:%S%.3f"), self.label, self.action)
    }
}

/// Circular buffer of recent [`KeyEventRecord`]s.
///
/// Holds at most `capacity` records; when full, the oldest one is evicted.
/// Nothing here is persisted.
pub struct RecentKeys {
    records: VecDeque<KeyEventRecord>,
    capacity: usize,
}

impl RecentKeys {
    /// Creates an empty buffer; `capacity` is clamped to [1, 30].
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, RECENT_KEYS_CAPACITY);
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn shared() -> SharedRecentKeys {
        Arc::new(Mutex::new(Self::default()))
    }

    /// Pushes a record, evicting the oldest if the buffer is at capacity.
    pub fn push(&mut self, record: KeyEventRecord) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    /// Renders the newest `n` records, oldest first, one per line.
    pub fn render_tail(&self, n: usize) -> String {
        let skip = self.records.len().saturating_sub(n);
        self.records
            .iter()
            .skip(skip)
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Default for RecentKeys {
    fn default() -> Self {
        Self::new(RECENT_KEYS_CAPACITY)
    }
}
