//! Scoped run log carried over the wire and merged at the orchestrator.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Good,
    Warning,
    Error,
}

impl LogLevel {
    /// Verbosity 0 shows errors only; 1 adds per-test results; 2 adds info;
    /// 3 shows everything.
    pub fn visible_at(self, verbosity: u8) -> bool {
        match self {
            LogLevel::Error => true,
            LogLevel::Good => verbosity >= 1,
            LogLevel::Info => verbosity >= 2,
            LogLevel::Warning => verbosity >= 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub scope: String,
    pub level: LogLevel,
    pub at: DateTime<Utc>,
    pub message: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {:?}: {}",
            self.at.format("%H:%M:%S%.3f"),
            self.scope,
            self.level,
            self.message
        )
    }
}

/// An ordered, appendable log. Each instance stamps new entries with its own
/// scope; agents apply the orchestrator clock skew so merged timestamps line
/// up across hosts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunLog {
    entries: Vec<LogEntry>,
    #[serde(skip)]
    scope: String,
    #[serde(skip)]
    skew_ms: i64,
}

impl RunLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scope(scope: &str) -> Self {
        Self {
            scope: scope.to_string(),
            ..Self::default()
        }
    }

    /// Clock correction applied to entries pushed from now on.
    pub fn set_skew(&mut self, skew_ms: i64) {
        self.skew_ms = skew_ms;
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Info, message.into());
    }

    pub fn good(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Good, message.into());
    }

    pub fn warning(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Warning, message.into());
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Error, message.into());
    }

    fn push(&mut self, level: LogLevel, message: String) {
        self.entries.push(LogEntry {
            scope: self.scope.clone(),
            level,
            at: Utc::now() + Duration::milliseconds(self.skew_ms),
            message,
        });
    }

    /// Append another log's entries, preserving their order.
    pub fn append(&mut self, other: &RunLog) {
        self.entries.extend(other.entries.iter().cloned());
    }

    /// Shift every recorded timestamp, used when absorbing a log produced
    /// without a clock reference.
    pub fn shift_time(&mut self, skew_ms: i64) {
        for entry in &mut self.entries {
            entry.at = entry.at + Duration::milliseconds(skew_ms);
        }
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Error-level entries only, for `dumpLog = "onfail"`.
    pub fn failures(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries
            .iter()
            .filter(|e| e.level == LogLevel::Error)
    }

    /// Entries visible at the given verbosity level, rendered for output.
    pub fn render(&self, verbosity: u8) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.level.visible_at(verbosity))
            .map(|e| e.to_string())
            .collect()
    }
}
