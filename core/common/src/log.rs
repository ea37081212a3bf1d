//! Free-text logging sink shared with the host application.
//!
//! The host decides where messages end up. Logging never fails from the
//! caller's point of view: a sink that cannot write drops the message.

use std::sync::Mutex;

/// Destination for `(subsystem, category, message)` log lines.
pub trait LogSink: Send + Sync {
    fn log(&self, subsystem: &str, category: &str, message: &str);
}

/// Sink that forwards to `tracing`, choosing the level from the category.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, subsystem: &str, category: &str, message: &str) {
        match category {
            "error" => tracing::error!(subsystem, "{}", message),
            "warning" | "warn" => tracing::warn!(subsystem, "{}", message),
            "debug" => tracing::debug!(subsystem, "{}", message),
            _ => tracing::info!(subsystem, category, "{}", message),
        }
    }
}

/// One captured log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub subsystem: String,
    pub category: String,
    pub message: String,
}

/// Sink that keeps every line in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<LogLine>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every line logged so far.
    pub fn lines(&self) -> Vec<LogLine> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Lines whose message contains `needle`.
    pub fn matching(&self, needle: &str) -> Vec<LogLine> {
        self.lines()
            .into_iter()
            .filter(|l| l.message.contains(needle))
            .collect()
    }
}

impl LogSink for MemorySink {
    fn log(&self, subsystem: &str, category: &str, message: &str) {
        // A poisoned lock only loses the line.
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(LogLine {
                subsystem: subsystem.to_string(),
                category: category.to_string(),
                message: message.to_string(),
            });
        }
    }
}
