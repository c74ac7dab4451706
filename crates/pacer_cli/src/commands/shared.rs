//! Collaborators shared by the database-backed commands.

use std::sync::Arc;
use std::time::Duration;

use console::style;
use pacer::feed::{ActivityFeed, HttpFeed, RateLimitedFeed};
use pacer::manifest::ManifestRegistry;
use pacer::store::SqlStore;
use pacer::sync::{JobOutcome, JobStatus, ObserverRef, SyncManager};

use crate::config::Config;

/// Open database plus the configuration it was opened with.
pub(crate) struct Env<'a> {
    pub(crate) config: &'a Config,
    pub(crate) store: Arc<SqlStore>,
}

impl<'a> Env<'a> {
    /// Connect, applying pending migrations.
    pub(crate) async fn open(
        config: &'a Config,
        database_url: &str,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let db = pacer::connect_and_migrate(database_url).await?;
        Ok(Self {
            config,
            store: Arc::new(SqlStore::new(db)),
        })
    }

    /// HTTP feed behind the per-second burst limiter.
    pub(crate) fn feed(&self) -> Result<Arc<dyn ActivityFeed>, Box<dyn std::error::Error>> {
        let feed_config = &self.config.feed;
        let mut feed = HttpFeed::with_reqwest(
            self.config.feed_url()?,
            Duration::from_secs(feed_config.timeout_secs),
        )?;
        if let Some(token) = &feed_config.token {
            feed = feed.with_token(token);
        }
        Ok(Arc::new(RateLimitedFeed::new(
            feed,
            feed_config.requests_per_second,
        )))
    }

    pub(crate) fn registry(&self) -> Result<Arc<ManifestRegistry>, Box<dyn std::error::Error>> {
        Ok(Arc::new(pacer::processors::default_registry(
            &self.config.processors,
        )?))
    }

    pub(crate) fn manager(
        &self,
        observer: ObserverRef,
    ) -> Result<Arc<SyncManager>, Box<dyn std::error::Error>> {
        let manager = SyncManager::new(
            self.store.clone(),
            self.feed()?,
            self.registry()?,
            self.config.sync.clone(),
        )?
        .with_observer(observer);
        Ok(Arc::new(manager))
    }
}

/// Format an epoch-ms timestamp for tables.
pub(crate) fn format_ts(ts: Option<i64>) -> String {
    ts.and_then(chrono::DateTime::from_timestamp_millis)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string())
}

/// Print a job's summary. A failed job is returned as an error so the process
/// exits non-zero.
pub(crate) fn report_outcome(outcome: &JobOutcome) -> Result<(), Box<dyn std::error::Error>> {
    let summary = &outcome.summary;
    match outcome.status {
        JobStatus::Complete => println!(
            "{} Subject {} synced",
            style("✓").green().bold(),
            style(outcome.subject_id).cyan()
        ),
        JobStatus::Cancelled => println!(
            "{} Subject {} sync cancelled",
            style("⚠").yellow().bold(),
            style(outcome.subject_id).cyan()
        ),
        _ => {}
    }
    println!(
        "  {} new, {} updated, {} streams fetched ({} missing), {} processed, {} errors",
        summary.discovered,
        summary.updated,
        summary.streams_fetched,
        summary.streams_missing,
        summary.processed,
        summary.errors
    );

    match &outcome.error {
        Some(error) => Err(format!("Sync of subject {} failed: {error}", outcome.subject_id).into()),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_ts_handles_missing_values() {
        assert_eq!(format_ts(None), "-");
        assert_eq!(format_ts(Some(0)), "1970-01-01 00:00");
    }
}
