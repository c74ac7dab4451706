//! Per-subject sync job.
//!
//! A job walks `init → checking-connectivity → discovering → processing` and ends
//! in `complete`, `error` or `cancelling → cancelled`. It holds the subject's lock
//! for its whole run, so no other writer touches the subject's records meanwhile.
//!
//! Cancellation is a single [`CancellationToken`] raced against every wait. A
//! cancelled job never surfaces an error: its completion future resolves with a
//! `cancelled` outcome, and whatever was persisted so far (including the discovery
//! resume cursor) is kept for the next run.

mod budget;
mod discovery;
mod fetch;
mod local;
mod progress;

use std::collections::HashMap;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::entity::prelude::{Activity, Subject, SyncCategory};
use crate::feed::{ActivityFeed, FeedError, short_error_message};
use crate::store::{Store, StoreError};

use super::cancel::{Cancelled, race};
use super::context::SyncContext;
use super::events::{JobStatus, LogLevel, job_log};
use super::types::{JobSummary, RefreshOptions};

use budget::BudgetedFeed;
use progress::JobProgress;

/// Errors that end a job in the `error` state.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Subject not found: {subject_id}")]
    SubjectNotFound { subject_id: i64 },

    #[error("Subject {subject_id} is disabled")]
    Disabled { subject_id: i64 },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Feed(#[from] FeedError),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

/// How a job ended.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job_id: Uuid,
    pub subject_id: i64,
    /// `Complete`, `Error` or `Cancelled`.
    pub status: JobStatus,
    pub summary: JobSummary,
    pub error: Option<String>,
    /// Every status the job passed through, with the time (ms) it was entered.
    pub history: Vec<(JobStatus, i64)>,
}

impl JobOutcome {
    pub fn is_complete(&self) -> bool {
        self.status == JobStatus::Complete
    }
}

/// One sync run for one subject.
pub struct SyncJob {
    ctx: SyncContext,
    job_id: Uuid,
    subject_id: i64,
    options: RefreshOptions,
    cancel: CancellationToken,
    feed: BudgetedFeed,
    history: Vec<(JobStatus, i64)>,
    summary: JobSummary,
}

impl SyncJob {
    pub fn new(ctx: SyncContext, subject_id: i64, options: RefreshOptions, cancel: CancellationToken) -> Self {
        let feed = BudgetedFeed::new(ctx.clone(), subject_id, cancel.clone());
        Self {
            ctx,
            job_id: Uuid::new_v4(),
            subject_id,
            options,
            cancel,
            feed,
            history: vec![(JobStatus::Init, crate::now_ms())],
            summary: JobSummary::default(),
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn status(&self) -> JobStatus {
        self.history
            .last()
            .map_or(JobStatus::Init, |(status, _)| *status)
    }

    /// Token that cancels this job.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn advance(&mut self, next: JobStatus) {
        let current = self.status();
        if !current.can_advance_to(next) {
            tracing::debug!(
                subject = self.subject_id,
                "Ignoring status transition {current} -> {next}"
            );
            return;
        }
        self.history.push((next, crate::now_ms()));
        self.ctx.observer.on_status(self.subject_id, next);
    }

    fn log(&self, level: LogLevel, message: &str) {
        job_log(self.ctx.observer.as_ref(), self.subject_id, level, message);
    }

    /// Run to completion. Never fails: errors and cancellation are reported in the
    /// outcome.
    #[tracing::instrument(skip(self), fields(subject = self.subject_id, job = %self.job_id))]
    pub async fn run(mut self) -> JobOutcome {
        let locks = std::sync::Arc::clone(&self.ctx.locks);
        let error = match race(&self.cancel, locks.lock(self.subject_id)).await {
            Err(cancelled) => Some(JobError::from(cancelled)),
            Ok(_guard) => {
                let result = self.run_locked().await;
                match result {
                    Ok(()) => None,
                    Err(e) => {
                        self.record_failure(&e).await;
                        Some(e)
                    }
                }
            }
        };

        let message = match error {
            None => {
                self.advance(JobStatus::Complete);
                self.log(LogLevel::Info, "Sync complete");
                None
            }
            Some(JobError::Cancelled(_)) => {
                self.advance(JobStatus::Cancelling);
                self.advance(JobStatus::Cancelled);
                self.log(LogLevel::Info, "Sync cancelled");
                None
            }
            Some(e) => {
                let message = short_error_message(&e);
                self.advance(JobStatus::Error);
                self.log(LogLevel::Error, &format!("Sync failed: {message}"));
                Some(message)
            }
        };

        if let Err(e) = self.ctx.limiter.persist(self.ctx.store.as_ref(), true).await {
            tracing::warn!("Failed to persist rate limits: {e}");
        }

        JobOutcome {
            job_id: self.job_id,
            subject_id: self.subject_id,
            status: self.status(),
            summary: self.summary,
            error: message,
            history: self.history,
        }
    }

    async fn run_locked(&mut self) -> Result<(), JobError> {
        let store = std::sync::Arc::clone(&self.ctx.store);
        let mut subject = store
            .get_subject(self.subject_id)
            .await?
            .ok_or(JobError::SubjectNotFound {
                subject_id: self.subject_id,
            })?;
        if !subject.enabled {
            return Err(JobError::Disabled {
                subject_id: self.subject_id,
            });
        }

        self.advance(JobStatus::CheckingConnectivity);
        race(&self.cancel, self.feed.check_connectivity()).await??;

        let known = if self.options.skip_discovery {
            index(store.activities_for_subject(self.subject_id).await?)
        } else {
            self.advance(JobStatus::Discovering);
            self.discover(&mut subject).await?
        };

        self.advance(JobStatus::Processing);
        self.process(&subject, known).await?;

        let now = crate::now_ms();
        subject.last_sync_ts = Some(now);
        subject.last_sync_error = None;
        subject.last_sync_error_ts = None;
        subject.last_applied_manifest_hash = Some(self.ctx.registry.manifest_set_hash());
        store.put_subject(&subject).await?;
        Ok(())
    }

    /// Stamp the failure on the subject so the manager backs off.
    async fn record_failure(&self, error: &JobError) {
        if matches!(
            error,
            JobError::SubjectNotFound { .. } | JobError::Disabled { .. } | JobError::Cancelled(_)
        ) {
            return;
        }
        stamp_failure(self.ctx.store.as_ref(), self.subject_id, &short_error_message(error)).await;
    }

    /// Split known activities into stream-fetch and local-processing work, then run
    /// both stages concurrently.
    async fn process(&mut self, subject: &Subject, known: HashMap<i64, Activity>) -> Result<(), JobError> {
        let registry = &self.ctx.registry;
        let enforce_backoff = !self.options.ignore_backoff;
        let now = crate::now_ms();

        let mut fetch_queue = Vec::new();
        let mut local_queue = Vec::new();
        for activity in known.into_values() {
            if registry
                .next_runnable(&activity.sync_state, SyncCategory::Streams, enforce_backoff, now)
                .is_some()
            {
                fetch_queue.push(activity);
            } else if registry
                .next_runnable(&activity.sync_state, SyncCategory::Local, enforce_backoff, now)
                .is_some()
            {
                local_queue.push(activity);
            }
        }
        fetch_queue.sort_by_key(|a| std::cmp::Reverse(a.ts));
        local_queue.sort_by_key(|a| a.ts);

        if fetch_queue.is_empty() && local_queue.is_empty() {
            self.log(LogLevel::Debug, "Nothing to process");
            return Ok(());
        }
        self.log(
            LogLevel::Info,
            &format!(
                "Processing {} activities ({} need streams)",
                fetch_queue.len() + local_queue.len(),
                fetch_queue.len()
            ),
        );

        let progress = JobProgress::new(self.subject_id, fetch_queue.len(), local_queue.len());
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        for activity in local_queue {
            // The receiver is alive until the local stage returns.
            let _ = tx.send(activity);
        }

        let (fetched, processed) = tokio::join!(
            self.fetch_stage(fetch_queue, tx, &progress),
            self.local_stage(subject, rx, &progress)
        );
        let fetched = fetched?;
        let processed = processed?;

        self.summary.streams_fetched += fetched.fetched;
        self.summary.streams_missing += fetched.missing;
        self.summary.errors += fetched.errors + processed.errors;
        self.summary.processed += processed.processed;
        progress.emit(self.ctx.observer.as_ref());
        Ok(())
    }
}

/// Record a failed sync on the subject. Store errors are logged, not returned.
pub(crate) async fn stamp_failure(store: &dyn Store, subject_id: i64, message: &str) {
    match store.get_subject(subject_id).await {
        Ok(Some(mut subject)) => {
            subject.last_sync_error_ts = Some(crate::now_ms());
            subject.last_sync_error = Some(message.to_string());
            if let Err(e) = store.put_subject(&subject).await {
                tracing::warn!("Failed to record job error: {e}");
            }
        }
        Ok(None) => {}
        Err(e) => tracing::warn!("Failed to record job error: {e}"),
    }
}

fn index(activities: Vec<Activity>) -> HashMap<i64, Activity> {
    activities.into_iter().map(|a| (a.id, a)).collect()
}

