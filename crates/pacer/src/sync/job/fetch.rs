//! Stream-fetch stage.

use std::collections::HashSet;

use tokio::sync::mpsc::UnboundedSender;

use crate::entity::prelude::{Activity, StreamSet, SyncCategory, SyncErrorKind};
use crate::feed::{ActivityFeed, FeedError, short_error_message};
use crate::manifest::Manifest;
use crate::sync::cancel::race;
use crate::sync::events::LogLevel;

use super::progress::JobProgress;
use super::{JobError, SyncJob};

/// Counters of one fetch stage.
#[derive(Debug, Default)]
pub(super) struct FetchStats {
    pub fetched: usize,
    pub missing: usize,
    pub errors: usize,
}

impl SyncJob {
    /// Fetch remote data for `queue` (newest first), one activity at a time.
    ///
    /// Every activity is persisted and handed to the local stage whatever the
    /// outcome. Dropping `local` on return closes the local stage's input.
    pub(super) async fn fetch_stage(
        &self,
        queue: Vec<Activity>,
        local: UnboundedSender<Activity>,
        progress: &JobProgress,
    ) -> Result<FetchStats, JobError> {
        let mut stats = FetchStats::default();
        let enforce_backoff = !self.options.ignore_backoff;

        for mut activity in queue {
            let mut attempted: HashSet<String> = HashSet::new();
            let mut fatal = None;
            let failures = stats.errors + stats.missing;
            while let Some(manifest) = self.ctx.registry.next_runnable(
                &activity.sync_state,
                SyncCategory::Streams,
                enforce_backoff,
                crate::now_ms(),
            ) {
                if !attempted.insert(manifest.name.clone()) {
                    break;
                }
                if let Err(e) = self.fetch_one(&mut activity, &manifest, &mut stats).await {
                    fatal = Some(e);
                    break;
                }
            }

            progress.errored(stats.errors + stats.missing - failures);
            activity.updated_at = crate::now_ms();
            self.ctx.store.put_activities(std::slice::from_ref(&activity)).await?;
            if let Some(e) = fatal {
                return Err(e);
            }
            progress.fetched();
            // The local stage only exits after the sender is dropped.
            let _ = local.send(activity);
        }

        tracing::debug!(
            subject = self.subject_id,
            fetched = stats.fetched,
            missing = stats.missing,
            "Stream fetch finished"
        );
        Ok(stats)
    }

    async fn fetch_one(&self, activity: &mut Activity, manifest: &Manifest, stats: &mut FetchStats) -> Result<(), JobError> {
        let registry = &self.ctx.registry;
        let names = manifest.streams();
        let result = race(&self.cancel, self.feed.fetch_streams(activity.id, names)).await?;
        let now = crate::now_ms();

        match result {
            Ok(streams) => {
                let mut merged = self
                    .ctx
                    .store
                    .get_streams(activity.id)
                    .await?
                    .unwrap_or_else(StreamSet::new);
                for (name, series) in streams.0 {
                    merged.insert(name, series);
                }
                self.ctx
                    .store
                    .put_streams(activity.id, activity.subject_id, &merged, now)
                    .await?;
                registry.record_success(&mut activity.sync_state, manifest, now);
                stats.fetched += 1;
            }
            Err(e) if e.is_not_found() => {
                if self.ctx.config.fallback_summary {
                    self.fetch_fallback_summary(activity).await?;
                }
                registry.record_error(
                    &mut activity.sync_state,
                    manifest,
                    short_error_message(&e),
                    SyncErrorKind::NoData,
                    now,
                );
                stats.missing += 1;
            }
            Err(FeedError::Unauthorized) => return Err(FeedError::Unauthorized.into()),
            Err(e) => {
                let message = short_error_message(&e);
                self.log(
                    LogLevel::Warn,
                    &format!("Failed to fetch {} for activity {}: {message}", manifest.name, activity.id),
                );
                registry.record_error(
                    &mut activity.sync_state,
                    manifest,
                    message,
                    SyncErrorKind::Transient,
                    now,
                );
                stats.errors += 1;
            }
        }
        Ok(())
    }

    /// Fill in summary fields from the detail endpoint when the remote has no
    /// streams. Failures only lose the fallback.
    async fn fetch_fallback_summary(&self, activity: &mut Activity) -> Result<(), JobError> {
        match race(&self.cancel, self.feed.fetch_summary(activity.id)).await? {
            Ok(serde_json::Value::Object(fields)) => {
                if !activity.summary.is_object() {
                    activity.summary = serde_json::Value::Object(Default::default());
                }
                if let serde_json::Value::Object(summary) = &mut activity.summary {
                    for (key, value) in fields {
                        summary.entry(key).or_insert(value);
                    }
                }
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(
                subject = self.subject_id,
                activity = activity.id,
                "No fallback summary: {}",
                short_error_message(&e)
            ),
        }
        Ok(())
    }
}
