//! Sync configuration, refresh options and job results.

use serde::{Deserialize, Serialize};

use crate::feed::{MonthBucket, PeerScanOptions};
use crate::rate_limit::{DEFAULT_FEED_RPS, LimiterSpec, RateLimiterGroup};

/// Time between routine syncs of a healthy subject (6 hours).
pub const DEFAULT_REFRESH_INTERVAL_MS: i64 = 6 * 60 * 60 * 1000;

/// Wait after a failed job before trying that subject again (15 minutes).
pub const DEFAULT_JOB_ERROR_BACKOFF_MS: i64 = 15 * 60 * 1000;

/// Hard limit on a single job (30 minutes).
pub const DEFAULT_JOB_TIMEOUT_MS: i64 = 30 * 60 * 1000;

/// Initial size of a local-processing round.
pub const DEFAULT_BATCH_LIMIT: usize = 10;

/// Multiplier applied to the round size after each round.
pub const DEFAULT_BATCH_GROWTH: usize = 2;

/// Largest local-processing round.
pub const MAX_BATCH_LIMIT: usize = 500;

/// Activities a single offload worker holds at once.
pub const DEFAULT_WORKER_CAPACITY: usize = 50;

/// Per-call timeout for worker round-trips (1 minute).
pub const DEFAULT_WORKER_CALL_TIMEOUT_MS: u64 = 60_000;

/// Timeout for the stop handshake with a worker (5 minutes).
pub const DEFAULT_WORKER_STOP_TIMEOUT_MS: u64 = 5 * 60_000;

/// Projected rate-limit pauses longer than this are announced to observers.
pub const RATE_LIMIT_NOTICE_MS: i64 = 10_000;

/// Initial retry delay for transient feed failures.
pub const INITIAL_BACKOFF_MS: u64 = 1_000;

/// Maximum retry delay for transient feed failures.
pub const MAX_BACKOFF_MS: u64 = 60_000;

/// Attempts after the first call before a transient failure surfaces.
pub const MAX_FEED_RETRIES: usize = 5;

fn available_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
}

/// Worker-pool limits shared by every offloaded manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OffloadConfig {
    /// Worker ceiling per pool.
    pub max_workers: usize,
    /// Activities one worker holds at once.
    pub worker_capacity: usize,
    pub call_timeout_ms: u64,
    pub stop_timeout_ms: u64,
    /// Running-totals aggregator: minimum quiet time before a batch runs.
    pub min_wait_ms: u64,
    /// Running-totals aggregator: maximum time input may sit buffered.
    pub max_wait_ms: u64,
    /// Running-totals aggregator: batch size that triggers immediate processing.
    pub max_batch: usize,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            max_workers: available_parallelism().clamp(1, 8),
            worker_capacity: DEFAULT_WORKER_CAPACITY,
            call_timeout_ms: DEFAULT_WORKER_CALL_TIMEOUT_MS,
            stop_timeout_ms: DEFAULT_WORKER_STOP_TIMEOUT_MS,
            min_wait_ms: 200,
            max_wait_ms: 2_000,
            max_batch: 200,
        }
    }
}

/// Peer feed scan tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerScanConfig {
    pub initial_concurrency: usize,
    pub max_concurrency: usize,
    /// Consecutive empty or already-known batches that end a scan.
    pub stop_after: usize,
    /// Oldest calendar year ever scanned.
    pub floor_year: i32,
}

impl Default for PeerScanConfig {
    fn default() -> Self {
        let options = PeerScanOptions::default();
        Self {
            initial_concurrency: options.initial_concurrency,
            max_concurrency: options.max_concurrency,
            stop_after: options.stop_after,
            floor_year: options.floor.year,
        }
    }
}

impl PeerScanConfig {
    pub fn to_options(&self) -> PeerScanOptions {
        PeerScanOptions {
            initial_concurrency: self.initial_concurrency.max(1),
            max_concurrency: self.max_concurrency.max(1),
            stop_after: self.stop_after.max(1),
            floor: MonthBucket::new(self.floor_year, 1),
        }
    }
}

/// Engine-wide configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub refresh_interval_ms: i64,
    /// Wait after a failed job before re-admitting the subject.
    pub error_backoff_ms: i64,
    pub job_timeout_ms: i64,
    /// Ceiling on concurrently running jobs.
    pub max_concurrent_jobs: usize,
    pub batch_limit: usize,
    pub batch_growth: usize,
    pub max_batch_limit: usize,
    /// Per-second burst ceiling for feed calls.
    pub feed_rps: u32,
    /// Fetch summary fields when an activity has no streams.
    pub fallback_summary: bool,
    pub rate_limits: Vec<LimiterSpec>,
    pub offload: OffloadConfig,
    pub peer_scan: PeerScanConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            refresh_interval_ms: DEFAULT_REFRESH_INTERVAL_MS,
            error_backoff_ms: DEFAULT_JOB_ERROR_BACKOFF_MS,
            job_timeout_ms: DEFAULT_JOB_TIMEOUT_MS,
            max_concurrent_jobs: available_parallelism().clamp(1, 4),
            batch_limit: DEFAULT_BATCH_LIMIT,
            batch_growth: DEFAULT_BATCH_GROWTH,
            max_batch_limit: MAX_BATCH_LIMIT,
            feed_rps: DEFAULT_FEED_RPS,
            fallback_summary: true,
            rate_limits: RateLimiterGroup::default_specs(),
            offload: OffloadConfig::default(),
            peer_scan: PeerScanConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Next round size after a round at `current`.
    pub fn grow_batch(&self, current: usize) -> usize {
        current
            .saturating_mul(self.batch_growth.max(1))
            .clamp(1, self.max_batch_limit.max(1))
    }
}

/// Options carried by an explicit refresh request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshOptions {
    /// Walk the whole feed instead of stopping at already-known entries.
    pub full_discovery: bool,
    /// Skip discovery and only process already-known activities.
    pub skip_discovery: bool,
    /// Ignore error backoff when partitioning activities.
    pub ignore_backoff: bool,
}

/// Counters collected over one job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobSummary {
    /// Activities new to the store.
    pub discovered: usize,
    /// Known activities whose remote content changed.
    pub updated: usize,
    pub streams_fetched: usize,
    /// Activities the remote has no streams for.
    pub streams_missing: usize,
    /// Manifest runs that succeeded.
    pub processed: usize,
    /// Manifest runs that recorded an error.
    pub errors: usize,
}
