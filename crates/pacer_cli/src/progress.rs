//! Progress reporting for sync jobs.
//!
//! This module provides two modes of progress reporting:
//! - Interactive mode (TTY): One animated progress bar per subject using indicatif
//! - Logging mode (non-TTY): Structured logging using tracing
//!
//! Both are a [`SyncObserver`], handed to the manager so every job reports through it.

mod interactive;
mod logging;

use std::sync::Arc;

use console::Term;
use pacer::sync::{JobStatus, LogLevel, ObserverRef, ProgressSnapshot, RateLimitNotice, SyncObserver};

pub use interactive::InteractiveReporter;
pub use logging::LoggingReporter;

/// Progress reporter that handles both interactive and logging modes.
pub enum ProgressReporter {
    /// Interactive progress bars for TTY.
    Interactive(InteractiveReporter),
    /// Structured logging for non-TTY (CI, pipes).
    Logging(LoggingReporter),
}

impl ProgressReporter {
    /// Create a new progress reporter, auto-detecting TTY mode.
    pub fn new() -> Self {
        if Term::stdout().is_term() {
            Self::Interactive(InteractiveReporter::new())
        } else {
            Self::Logging(LoggingReporter::new())
        }
    }

    /// Shared observer handle for the library.
    pub fn as_observer(self: &Arc<Self>) -> ObserverRef {
        Arc::clone(self) as ObserverRef
    }

    /// Finish all progress bars (interactive mode only).
    pub fn finish(&self) {
        if let Self::Interactive(r) = self {
            r.finish();
        }
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncObserver for ProgressReporter {
    fn on_status(&self, subject_id: i64, status: JobStatus) {
        match self {
            Self::Interactive(r) => r.on_status(subject_id, status),
            Self::Logging(r) => r.on_status(subject_id, status),
        }
    }

    fn on_progress(&self, progress: &ProgressSnapshot) {
        match self {
            Self::Interactive(r) => r.on_progress(progress),
            Self::Logging(r) => r.on_progress(progress),
        }
    }

    fn on_rate_limit(&self, notice: &RateLimitNotice) {
        match self {
            Self::Interactive(r) => r.on_rate_limit(notice),
            Self::Logging(r) => r.on_rate_limit(notice),
        }
    }

    fn on_log(&self, subject_id: i64, level: LogLevel, message: &str) {
        match self {
            Self::Interactive(r) => r.on_log(subject_id, level, message),
            Self::Logging(r) => r.on_log(subject_id, level, message),
        }
    }
}

/// Human-readable duration for pause notices, e.g. `2m 05s`.
pub(crate) fn format_ms(ms: i64) -> String {
    let secs = ms.max(0) / 1000;
    match (secs / 3600, (secs % 3600) / 60, secs % 60) {
        (0, 0, s) => format!("{s}s"),
        (0, m, s) => format!("{m}m {s:02}s"),
        (h, m, _) => format!("{h}h {m:02}m"),
    }
}
