//! Extension log store.
//!
//! Every execution context (background, content script) owns one `Logger`.
//! Entries are only recorded while the persisted `logging` switch is on; they
//! land in a fixed-capacity ring so the popup can show recent activity, and are
//! forwarded to `tracing` for whoever installed a subscriber.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

pub const LOG_RING_CAPACITY: usize = 500;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub id: u64,
    pub timestamp_ms: i64,
    pub level: LogLevel,
    /// Component that produced the entry (`permissions`, `github`, ...)
    pub source: String,
    pub message: String,
}

/// Fixed-capacity buffer; the oldest entry is evicted once full.
pub struct LogRingBuffer {
    entries: VecDeque<LogEntry>,
    capacity: usize,
    next_id: u64,
}

impl LogRingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            next_id: 1,
        }
    }

    pub fn push(&mut self, level: LogLevel, source: &str, message: String) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(LogEntry {
            id,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            level,
            source: source.to_string(),
            message,
        });
        id
    }

    /// Most recent `limit` entries, oldest first. `0` means all of them.
    pub fn get_entries(&self, limit: usize) -> Vec<LogEntry> {
        let take = if limit == 0 { self.entries.len() } else { limit.min(self.entries.len()) };
        self.entries
            .iter()
            .skip(self.entries.len() - take)
            .cloned()
            .collect()
    }

    /// Ids stay monotonic across clears.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Per-context logger honouring the persisted `logging` switch.
pub struct Logger {
    enabled: AtomicBool,
    ring: Mutex<LogRingBuffer>,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new(false)
    }
}

impl Logger {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            ring: Mutex::new(LogRingBuffer::new(LOG_RING_CAPACITY)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn log(&self, level: LogLevel, source: &str, message: impl Into<String>) {
        if !self.is_enabled() {
            return;
        }
        let message = message.into();
        match level {
            LogLevel::Debug => tracing::debug!(source, "{message}"),
            LogLevel::Info => tracing::info!(source, "{message}"),
            LogLevel::Warn => tracing::warn!(source, "{message}"),
            LogLevel::Error => tracing::error!(source, "{message}"),
        }
        self.ring.lock().push(level, source, message);
    }

    pub fn debug(&self, source: &str, message: impl Into<String>) {
        self.log(LogLevel::Debug, source, message);
    }

    pub fn info(&self, source: &str, message: impl Into<String>) {
        self.log(LogLevel::Info, source, message);
    }

    pub fn warn(&self, source: &str, message: impl Into<String>) {
        self.log(LogLevel::Warn, source, message);
    }

    pub fn error(&self, source: &str, message: impl Into<String>) {
        self.log(LogLevel::Error, source, message);
    }

    pub fn entries(&self, limit: usize) -> Vec<LogEntry> {
        self.ring.lock().get_entries(limit)
    }

    pub fn clear(&self) {
        self.ring.lock().clear();
    }
}
