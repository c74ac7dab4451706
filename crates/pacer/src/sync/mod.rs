//! Sync engine.
//!
//! # Module Structure
//!
//! - [`types`] - Configuration, refresh options, job summaries and constants
//! - [`events`] - Job status machine and the typed observer interface
//! - [`context`] - Shared collaborators and their builder
//! - [`job`] - Per-subject job: discovery, stream fetch, local processing
//! - [`manager`] - Admission, concurrency ceiling, timeouts, manual repair
//! - [`supervisor`] - One manager per process with start/stop/replace
//!
//! # Example
//!
//! ```ignore
//! use pacer::sync::{RefreshOptions, SyncConfig, SyncManager};
//!
//! let manager = SyncManager::new(store, feed, registry, SyncConfig::default())?;
//! let outcome = manager.run_once(subject_id, RefreshOptions::default()).await?;
//! println!("{}: {} new activities", outcome.status, outcome.summary.discovered);
//! ```

mod cancel;
pub mod context;
pub mod events;
pub mod job;
mod locks;
pub mod manager;
pub mod supervisor;
pub mod types;

pub use cancel::{Cancelled, race, sleep};
pub use context::{SyncContext, SyncContextBuilder, SyncContextError};
pub use events::{
    JobStatus, LogLevel, NoopObserver, ObserverRef, ProgressSnapshot, RateLimitNotice,
    SyncObserver, job_log,
};
pub use job::{JobError, JobOutcome, SyncJob};
pub use locks::{SubjectGuard, SubjectLocks};
pub use manager::{ManagerError, SyncManager, deadline_for};
pub use supervisor::SyncSupervisor;
pub use types::{
    JobSummary, OffloadConfig, PeerScanConfig, RefreshOptions, SyncConfig,
    DEFAULT_BATCH_LIMIT, DEFAULT_JOB_ERROR_BACKOFF_MS, DEFAULT_JOB_TIMEOUT_MS,
    DEFAULT_REFRESH_INTERVAL_MS, MAX_BATCH_LIMIT,
};
