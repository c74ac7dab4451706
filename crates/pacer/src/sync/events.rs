//! Observer interface for sync activity.
//!
//! Each event category has its own typed method on [`SyncObserver`]; every method
//! has a no-op default so presentation layers implement only what they render.

use std::sync::Arc;

use serde::Serialize;

/// Lifecycle of one job.
///
/// Transitions only move forward. `Cancelling` may be entered from any active
/// state and always ends in `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Init,
    CheckingConnectivity,
    Discovering,
    Processing,
    Complete,
    Error,
    Cancelling,
    Cancelled,
}

impl JobStatus {
    fn rank(self) -> u8 {
        match self {
            JobStatus::Init => 0,
            JobStatus::CheckingConnectivity => 1,
            JobStatus::Discovering => 2,
            JobStatus::Processing => 3,
            JobStatus::Cancelling => 4,
            JobStatus::Complete | JobStatus::Error | JobStatus::Cancelled => 5,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Error | JobStatus::Cancelled)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_advance_to(self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (JobStatus::Cancelling, JobStatus::Cancelled) => true,
            (JobStatus::Cancelling, _) => false,
            (_, JobStatus::Cancelled) => false,
            (_, JobStatus::Cancelling) | (_, JobStatus::Error) => true,
            _ => next.rank() > self.rank(),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Init => "init",
            JobStatus::CheckingConnectivity => "checking-connectivity",
            JobStatus::Discovering => "discovering",
            JobStatus::Processing => "processing",
            JobStatus::Complete => "complete",
            JobStatus::Error => "error",
            JobStatus::Cancelling => "cancelling",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Coalesced counts for one job, emitted once per processing round.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub subject_id: i64,
    /// Activities known for the subject.
    pub total: usize,
    /// Waiting for remote streams.
    pub streams_pending: usize,
    /// Waiting for local processing (queued, in a round, or offloaded).
    pub local_pending: usize,
    /// Fully satisfied.
    pub completed: usize,
    /// Manifest runs that recorded an error this job.
    pub errored: usize,
}

/// Upstream budget notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RateLimitNotice {
    /// A pause of `suspend_ms` is about to start.
    Suspending { subject_id: i64, suspend_ms: i64 },
    /// A transient failure is being retried.
    Retrying {
        subject_id: i64,
        attempt: u32,
        retry_after_ms: u64,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Receiver of sync events.
pub trait SyncObserver: Send + Sync {
    fn on_status(&self, _subject_id: i64, _status: JobStatus) {}

    fn on_progress(&self, _progress: &ProgressSnapshot) {}

    fn on_rate_limit(&self, _notice: &RateLimitNotice) {}

    fn on_log(&self, _subject_id: i64, _level: LogLevel, _message: &str) {}
}

/// Observer that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl SyncObserver for NoopObserver {}

/// Shared observer handle.
pub type ObserverRef = Arc<dyn SyncObserver>;

/// Write a job log line both to tracing and to the observer.
pub fn job_log(observer: &dyn SyncObserver, subject_id: i64, level: LogLevel, message: &str) {
    match level {
        LogLevel::Debug => tracing::debug!(subject = subject_id, "{message}"),
        LogLevel::Info => tracing::info!(subject = subject_id, "{message}"),
        LogLevel::Warn => tracing::warn!(subject = subject_id, "{message}"),
        LogLevel::Error => tracing::error!(subject = subject_id, "{message}"),
    }
    observer.on_log(subject_id, level, message);
}
