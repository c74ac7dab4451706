//! Sync manager: decides when each subject gets a job.
//!
//! Each cycle computes every enabled subject's deadline, admits subjects whose
//! deadline passed, whose last applied manifest-set hash is stale, or that have an
//! explicit refresh request, and starts admitted jobs up to the concurrency
//! ceiling. Running jobs are never preempted. The loop then sleeps until the
//! nearest deadline, a job completion or an explicit wake-up.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::entity::prelude::{Subject, SyncCategory};
use crate::feed::ActivityFeed;
use crate::manifest::ManifestRegistry;
use crate::rate_limit::{LimiterStatus, RateLimiterGroup};
use crate::store::{Store, StoreError};

use super::context::{SyncContext, SyncContextError};
use super::events::{JobStatus, ObserverRef};
use super::job::{JobOutcome, SyncJob, stamp_failure};
use super::types::{RefreshOptions, SyncConfig};

/// Sleep after a failed cycle before trying again.
const CYCLE_RETRY_MS: u64 = 60_000;

/// Errors from manager operations. The run loop itself logs and continues.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Context(#[from] SyncContextError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Unknown subject: {subject_id}")]
    UnknownSubject { subject_id: i64 },

    #[error("Unknown {category} manifest: {name}")]
    UnknownManifest { category: SyncCategory, name: String },

    #[error("A job is already running for subject {subject_id}")]
    AlreadyRunning { subject_id: i64 },
}

/// Wait (ms) before `subject` is due: the longer of the remaining refresh
/// interval and the remaining error backoff, never negative.
pub fn deadline_for(subject: &Subject, now: i64, config: &SyncConfig) -> i64 {
    let refresh_wait = subject
        .last_sync_ts
        .map_or(0, |ts| config.refresh_interval_ms - (now - ts));
    let error_wait = subject
        .last_sync_error_ts
        .map_or(0, |ts| config.error_backoff_ms - (now - ts));
    refresh_wait.max(error_wait).max(0)
}

#[derive(Default)]
struct Schedule {
    /// Admitted subjects waiting for a slot; a newer request replaces an older one.
    pending: BTreeMap<i64, RefreshOptions>,
    running: HashMap<i64, CancellationToken>,
    /// Cancelled subjects kept out of automatic admission until the next explicit
    /// refresh request.
    held: HashSet<i64>,
}

/// What a job task hands back to the loop.
struct JobResult {
    outcome: JobOutcome,
    /// Options the job ran with, reused when it is requeued.
    options: RefreshOptions,
    timed_out: bool,
}

pub struct SyncManager {
    ctx: SyncContext,
    schedule: Mutex<Schedule>,
    wake: Notify,
}

impl SyncManager {
    pub fn new(
        store: Arc<dyn Store>,
        feed: Arc<dyn ActivityFeed>,
        registry: Arc<ManifestRegistry>,
        config: SyncConfig,
    ) -> Result<Self, ManagerError> {
        let ctx = SyncContext::builder()
            .store(store)
            .feed(feed)
            .registry(registry)
            .config(config)
            .build()?;
        Ok(Self::from_context(ctx))
    }

    pub fn from_context(ctx: SyncContext) -> Self {
        Self {
            ctx,
            schedule: Mutex::new(Schedule::default()),
            wake: Notify::new(),
        }
    }

    pub fn with_observer(mut self, observer: ObserverRef) -> Self {
        self.ctx.observer = observer;
        self
    }

    pub fn with_limiter(mut self, limiter: Arc<RateLimiterGroup>) -> Self {
        self.ctx.limiter = limiter;
        self
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    fn schedule(&self) -> MutexGuard<'_, Schedule> {
        self.schedule.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run the scheduling loop until `shutdown` fires, then cancel and await every
    /// running job.
    #[tracing::instrument(skip_all)]
    pub async fn run(&self, shutdown: CancellationToken) {
        match self.ctx.limiter.load(self.ctx.store.as_ref()).await {
            Ok(0) => {}
            Ok(merged) => tracing::debug!(merged, "Restored rate limit windows"),
            Err(e) => tracing::warn!("Failed to load rate limits: {e}"),
        }
        tracing::info!("Sync manager started");

        let mut jobs: JoinSet<JobResult> = JoinSet::new();
        loop {
            let sleep_ms = match self.cycle(&mut jobs).await {
                Ok(ms) => ms,
                Err(e) => {
                    tracing::error!("Sync cycle failed: {e}");
                    CYCLE_RETRY_MS
                }
            };

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(joined) = jobs.join_next() => self.finish(joined),
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(sleep_ms)) => {}
            }
        }

        tracing::info!(running = jobs.len(), "Sync manager stopping");
        for token in self.schedule().running.values() {
            token.cancel();
        }
        while let Some(joined) = jobs.join_next().await {
            self.finish(joined);
        }
        if let Err(e) = self.ctx.limiter.persist(self.ctx.store.as_ref(), true).await {
            tracing::warn!("Failed to persist rate limits: {e}");
        }
    }

    /// Admit due subjects, start what fits, and return ms until the nearest deadline.
    #[tracing::instrument(skip_all)]
    async fn cycle(&self, jobs: &mut JoinSet<JobResult>) -> Result<u64, ManagerError> {
        let subjects = self.ctx.store.list_subjects().await?;
        let now = crate::now_ms();
        let manifest_hash = self.ctx.registry.manifest_set_hash();
        let config = &self.ctx.config;

        let (starts, nearest) = {
            let mut schedule = self.schedule();
            schedule
                .pending
                .retain(|id, _| subjects.iter().any(|s| s.id == *id && s.enabled));

            let mut nearest = config.refresh_interval_ms;
            for subject in subjects.iter().filter(|s| s.enabled) {
                if schedule.running.contains_key(&subject.id) || schedule.held.contains(&subject.id) {
                    continue;
                }
                let deadline = deadline_for(subject, now, config);
                let error_waiting = subject
                    .last_sync_error_ts
                    .is_some_and(|ts| now - ts < config.error_backoff_ms);
                let stale = subject.last_applied_manifest_hash.as_deref() != Some(manifest_hash.as_str());
                if deadline == 0 || (stale && !error_waiting) {
                    schedule.pending.entry(subject.id).or_default();
                } else {
                    nearest = nearest.min(deadline);
                }
            }

            let slots = config
                .max_concurrent_jobs
                .max(1)
                .saturating_sub(schedule.running.len());
            let admitted: Vec<(i64, RefreshOptions)> = schedule
                .pending
                .iter()
                .filter(|(id, _)| !schedule.running.contains_key(id))
                .take(slots)
                .map(|(id, options)| (*id, *options))
                .collect();

            let mut starts = Vec::with_capacity(admitted.len());
            for (id, options) in admitted {
                let token = CancellationToken::new();
                schedule.pending.remove(&id);
                schedule.running.insert(id, token.clone());
                starts.push((id, options, token));
            }
            if !schedule.pending.is_empty() {
                tracing::debug!(waiting = schedule.pending.len(), "Concurrency ceiling reached");
            }
            (starts, nearest)
        };

        for (subject_id, options, token) in starts {
            tracing::info!(subject = subject_id, ?options, "Starting sync job");
            jobs.spawn(run_with_timeout(self.ctx.clone(), subject_id, options, token));
        }
        Ok(nearest.max(0) as u64)
    }

    fn finish(&self, joined: Result<JobResult, JoinError>) {
        let result = match joined {
            Ok(result) => result,
            // Panics are caught inside the task; only an abort ends up here.
            Err(e) => {
                tracing::error!("Sync job task failed: {e}");
                return;
            }
        };
        self.release(&result);
        let outcome = &result.outcome;
        let subject_id = outcome.subject_id;
        match &outcome.error {
            Some(error) => tracing::warn!(subject = subject_id, status = %outcome.status, "Sync job ended: {error}"),
            None => tracing::info!(
                subject = subject_id,
                status = %outcome.status,
                discovered = outcome.summary.discovered,
                processed = outcome.summary.processed,
                "Sync job ended"
            ),
        }
    }

    /// Free the subject's slot, and queue a timed-out job again with the options
    /// it ran with unless a newer request is already waiting.
    fn release(&self, result: &JobResult) {
        let subject_id = result.outcome.subject_id;
        {
            let mut schedule = self.schedule();
            schedule.running.remove(&subject_id);
            if result.timed_out {
                tracing::warn!(subject = subject_id, "Sync job timed out, requeueing");
                schedule.pending.entry(subject_id).or_insert(result.options);
            }
        }
        self.wake.notify_one();
    }

    /// Run one job in the foreground, outside the scheduling loop.
    pub async fn run_once(&self, subject_id: i64, options: RefreshOptions) -> Result<JobOutcome, ManagerError> {
        let token = {
            let mut schedule = self.schedule();
            if schedule.running.contains_key(&subject_id) {
                return Err(ManagerError::AlreadyRunning { subject_id });
            }
            let token = CancellationToken::new();
            schedule.pending.remove(&subject_id);
            schedule.running.insert(subject_id, token.clone());
            token
        };
        let result = run_with_timeout(self.ctx.clone(), subject_id, options, token).await;
        self.release(&result);
        Ok(result.outcome)
    }

    /// Ask for a job for `subject_id`. Requests made before the job starts collapse
    /// into one, carrying the latest options.
    pub fn request_refresh(&self, subject_id: i64, options: RefreshOptions) {
        {
            let mut schedule = self.schedule();
            schedule.held.remove(&subject_id);
            schedule.pending.insert(subject_id, options);
        }
        self.wake.notify_one();
    }

    /// Cancel the running job of `subject_id` and drop any pending request. The
    /// subject is not admitted again until the next refresh request.
    /// Returns whether a job was running.
    pub fn cancel(&self, subject_id: i64) -> bool {
        let was_running = {
            let mut schedule = self.schedule();
            schedule.pending.remove(&subject_id);
            schedule.held.insert(subject_id);
            match schedule.running.get(&subject_id) {
                Some(token) => {
                    token.cancel();
                    true
                }
                None => false,
            }
        };
        self.wake.notify_one();
        was_running
    }

    pub fn running(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.schedule().running.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn pending(&self) -> Vec<(i64, RefreshOptions)> {
        self.schedule()
            .pending
            .iter()
            .map(|(id, options)| (*id, *options))
            .collect()
    }

    pub async fn add_subject(&self, subject: &Subject) -> Result<(), ManagerError> {
        self.ctx.store.put_subject(subject).await?;
        if subject.enabled {
            self.request_refresh(subject.id, RefreshOptions::default());
        }
        Ok(())
    }

    pub async fn set_enabled(&self, subject_id: i64, enabled: bool) -> Result<(), ManagerError> {
        let mut subject = self
            .ctx
            .store
            .get_subject(subject_id)
            .await?
            .ok_or(ManagerError::UnknownSubject { subject_id })?;
        if subject.enabled != enabled {
            subject.enabled = enabled;
            self.ctx.store.put_subject(&subject).await?;
        }
        if enabled {
            self.request_refresh(subject_id, RefreshOptions::default());
        } else {
            self.cancel(subject_id);
        }
        Ok(())
    }

    /// Delete a subject with its activities and streams. Returns the number of
    /// activities removed.
    pub async fn remove_subject(&self, subject_id: i64) -> Result<u64, ManagerError> {
        self.cancel(subject_id);
        let removed = {
            let _guard = self.ctx.locks.lock(subject_id).await;
            self.ctx.store.delete_subject(subject_id).await?
        };
        self.ctx.locks.forget(subject_id);
        self.schedule().held.remove(&subject_id);
        tracing::info!(subject = subject_id, removed, "Subject removed");
        Ok(removed)
    }

    /// Clear sync state for one manifest (or a whole category) and its dependents
    /// on every activity of `subject_id`, then request a refresh. Returns the
    /// number of activities changed.
    pub async fn invalidate(
        &self,
        subject_id: i64,
        category: SyncCategory,
        name: Option<&str>,
    ) -> Result<usize, ManagerError> {
        if let Some(name) = name
            && self
                .ctx
                .registry
                .get(name)
                .is_none_or(|m| m.category != category)
        {
            return Err(ManagerError::UnknownManifest {
                category,
                name: name.to_string(),
            });
        }
        if self.ctx.store.get_subject(subject_id).await?.is_none() {
            return Err(ManagerError::UnknownSubject { subject_id });
        }

        self.cancel(subject_id);
        let changed = {
            let _guard = self.ctx.locks.lock(subject_id).await;
            let mut changed = Vec::new();
            for mut activity in self.ctx.store.activities_for_subject(subject_id).await? {
                if self
                    .ctx
                    .registry
                    .invalidate(&mut activity.sync_state, category, name)
                {
                    activity.updated_at = crate::now_ms();
                    changed.push(activity);
                }
            }
            self.ctx.store.put_activities(&changed).await?;
            changed.len()
        };

        tracing::info!(
            subject = subject_id,
            %category,
            manifest = name.unwrap_or("*"),
            changed,
            "Sync state invalidated"
        );
        self.request_refresh(
            subject_id,
            RefreshOptions {
                skip_discovery: true,
                ..RefreshOptions::default()
            },
        );
        Ok(changed)
    }

    /// Delete activities whose subject no longer exists.
    pub async fn prune_orphans(&self) -> Result<u64, ManagerError> {
        let removed = self.ctx.store.delete_orphans().await?;
        if removed > 0 {
            tracing::info!(removed, "Pruned orphaned activities");
        }
        Ok(removed)
    }

    pub fn rate_limit_status(&self) -> Vec<LimiterStatus> {
        self.ctx.limiter.status(self.ctx.limiter.now())
    }
}

/// Run one job under the hard timeout. On expiry the job is cancelled and awaited,
/// and the result is flagged for requeueing. A panicking job ends as an error
/// stamped on its subject.
async fn run_with_timeout(
    ctx: SyncContext,
    subject_id: i64,
    options: RefreshOptions,
    token: CancellationToken,
) -> JobResult {
    let timeout = Duration::from_millis(ctx.config.job_timeout_ms.max(0) as u64);
    let job = SyncJob::new(ctx.clone(), subject_id, options, token.clone());
    let job_id = job.job_id();
    let run = AssertUnwindSafe(job.run()).catch_unwind();
    tokio::pin!(run);

    let (caught, timed_out) = tokio::select! {
        caught = &mut run => (caught, false),
        _ = tokio::time::sleep(timeout) => {
            token.cancel();
            (run.await, true)
        }
    };

    let outcome = match caught {
        Ok(outcome) => outcome,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            let message = format!("Job panicked: {message}");
            tracing::error!(subject = subject_id, job = %job_id, "{message}");
            stamp_failure(ctx.store.as_ref(), subject_id, &message).await;
            ctx.observer.on_status(subject_id, JobStatus::Error);
            JobOutcome {
                job_id,
                subject_id,
                status: JobStatus::Error,
                summary: Default::default(),
                error: Some(message),
                history: vec![(JobStatus::Error, crate::now_ms())],
            }
        }
    };
    JobResult {
        outcome,
        options,
        timed_out,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn subject() -> Subject {
        Subject::new(1, "rider", true, 0)
    }

    fn config() -> SyncConfig {
        SyncConfig {
            refresh_interval_ms: 1_000,
            error_backoff_ms: 5_000,
            ..SyncConfig::default()
        }
    }

    #[test]
    fn never_synced_subject_is_due() {
        assert_eq!(deadline_for(&subject(), 10_000, &config()), 0);
    }

    #[test]
    fn deadline_waits_out_refresh_interval() {
        let mut subject = subject();
        subject.last_sync_ts = Some(10_000);
        assert_eq!(deadline_for(&subject, 10_400, &config()), 600);
        assert_eq!(deadline_for(&subject, 12_000, &config()), 0);
    }

    #[test]
    fn error_backoff_dominates_refresh_interval() {
        let mut subject = subject();
        subject.last_sync_ts = Some(10_000);
        subject.last_sync_error_ts = Some(10_500);
        assert_eq!(deadline_for(&subject, 11_000, &config()), 4_500);
    }

    fn manager() -> SyncManager {
        struct Offline;

        #[async_trait::async_trait]
        impl ActivityFeed for Offline {
            async fn check_connectivity(&self) -> crate::feed::Result<()> {
                Err(crate::feed::FeedError::network("offline"))
            }
            async fn fetch_self_page(
                &self,
                _: i64,
                _: Option<i64>,
            ) -> crate::feed::Result<Vec<crate::feed::FeedEntry>> {
                Ok(Vec::new())
            }
            async fn fetch_peer_bucket(
                &self,
                _: i64,
                _: crate::feed::MonthBucket,
            ) -> crate::feed::Result<Vec<crate::feed::FeedActivity>> {
                Ok(Vec::new())
            }
            async fn fetch_streams(
                &self,
                _: i64,
                _: &[String],
            ) -> crate::feed::Result<crate::entity::prelude::StreamSet> {
                Ok(crate::entity::prelude::StreamSet::new())
            }
            async fn fetch_summary(&self, _: i64) -> crate::feed::Result<serde_json::Value> {
                Ok(serde_json::Value::Null)
            }
        }

        SyncManager::new(
            Arc::new(MemoryStore::new()),
            Arc::new(Offline),
            Arc::new(ManifestRegistry::new()),
            SyncConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn refresh_requests_collapse_to_latest_options() {
        let manager = manager();
        manager.request_refresh(3, RefreshOptions::default());
        let full = RefreshOptions {
            full_discovery: true,
            ..RefreshOptions::default()
        };
        manager.request_refresh(3, full);
        manager.request_refresh(1, RefreshOptions::default());

        assert_eq!(
            manager.pending(),
            vec![(1, RefreshOptions::default()), (3, full)]
        );
    }

    #[test]
    fn cancel_drops_pending_and_holds_until_next_request() {
        let manager = manager();
        manager.request_refresh(3, RefreshOptions::default());
        assert!(!manager.cancel(3));
        assert!(manager.pending().is_empty());
        assert!(manager.schedule().held.contains(&3));

        manager.request_refresh(3, RefreshOptions::default());
        assert!(!manager.schedule().held.contains(&3));
        assert_eq!(manager.pending().len(), 1);
    }

    #[tokio::test]
    async fn cycle_drops_requests_for_unknown_subjects() {
        let manager = manager();
        manager.request_refresh(42, RefreshOptions::default());
        let mut jobs = JoinSet::new();
        manager.cycle(&mut jobs).await.unwrap();
        assert!(manager.pending().is_empty());
        assert!(jobs.is_empty());
    }

    #[tokio::test]
    async fn cycle_skips_disabled_and_held_subjects() {
        let manager = manager();
        let mut disabled = Subject::new(1, "off", true, 0);
        disabled.enabled = false;
        manager.context().store.put_subject(&disabled).await.unwrap();
        manager
            .context()
            .store
            .put_subject(&Subject::new(2, "held", true, 0))
            .await
            .unwrap();
        manager.cancel(2);

        let mut jobs = JoinSet::new();
        manager.cycle(&mut jobs).await.unwrap();
        assert!(jobs.is_empty());
        assert!(manager.running().is_empty());
    }

    #[tokio::test]
    async fn run_once_rejects_a_second_job_for_the_same_subject() {
        let manager = manager();
        manager.schedule().running.insert(5, CancellationToken::new());
        let err = manager
            .run_once(5, RefreshOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::AlreadyRunning { subject_id: 5 }));
    }

    #[test]
    fn timed_out_job_is_requeued_with_its_options() {
        let manager = manager();
        let skip = RefreshOptions {
            skip_discovery: true,
            ..RefreshOptions::default()
        };
        manager.schedule().running.insert(4, CancellationToken::new());
        manager.release(&JobResult {
            outcome: outcome(4),
            options: skip,
            timed_out: true,
        });
        assert!(manager.running().is_empty());
        assert_eq!(manager.pending(), vec![(4, skip)]);

        // A newer request made while the job ran wins.
        let full = RefreshOptions {
            full_discovery: true,
            ..RefreshOptions::default()
        };
        manager.schedule().pending.clear();
        manager.request_refresh(4, full);
        manager.release(&JobResult {
            outcome: outcome(4),
            options: skip,
            timed_out: true,
        });
        assert_eq!(manager.pending(), vec![(4, full)]);
    }

    fn outcome(subject_id: i64) -> JobOutcome {
        JobOutcome {
            job_id: uuid::Uuid::new_v4(),
            subject_id,
            status: JobStatus::Cancelled,
            summary: Default::default(),
            error: None,
            history: Vec::new(),
        }
    }
}
