use pacer::sync::{JobStatus, LogLevel, ProgressSnapshot, RateLimitNotice};

use super::format_ms;

/// Logging reporter using tracing for structured output.
///
/// Job log lines already go to tracing from the library, so they are not repeated.
pub struct LoggingReporter;

impl LoggingReporter {
    pub fn new() -> Self {
        Self
    }

    pub fn on_status(&self, subject_id: i64, status: JobStatus) {
        if status.is_terminal() {
            tracing::info!(subject = subject_id, status = %status, "Job finished");
        } else {
            tracing::debug!(subject = subject_id, status = %status, "Job status");
        }
    }

    pub fn on_progress(&self, progress: &ProgressSnapshot) {
        tracing::debug!(
            subject = progress.subject_id,
            total = progress.total,
            streams_pending = progress.streams_pending,
            local_pending = progress.local_pending,
            completed = progress.completed,
            errored = progress.errored,
            "Progress"
        );
    }

    pub fn on_rate_limit(&self, notice: &RateLimitNotice) {
        match notice {
            RateLimitNotice::Suspending {
                subject_id,
                suspend_ms,
            } => {
                tracing::warn!(
                    subject = subject_id,
                    pause = %format_ms(*suspend_ms),
                    "Rate limit budget exhausted, pausing"
                );
            }
            RateLimitNotice::Retrying {
                subject_id,
                attempt,
                retry_after_ms,
                message,
            } => {
                tracing::warn!(
                    subject = subject_id,
                    attempt,
                    retry_after_ms,
                    error = %message,
                    "Retrying feed request"
                );
            }
        }
    }

    pub fn on_log(&self, _subject_id: i64, _level: LogLevel, _message: &str) {}
}

impl Default for LoggingReporter {
    fn default() -> Self {
        Self::new()
    }
}
