use std::future::Future;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::entity::prelude::StreamSet;
use crate::feed::{self, ActivityFeed, FeedActivity, FeedEntry, FeedError, MonthBucket};
use crate::retry::with_retry;
use crate::sync::context::SyncContext;
use crate::sync::events::{LogLevel, RateLimitNotice, job_log};
use crate::sync::types::RATE_LIMIT_NOTICE_MS;

/// The job's view of the remote feed.
///
/// Every attempt first waits until the limiter group permits one more use, then
/// counts the use. Transient failures are retried through the same gate.
pub(crate) struct BudgetedFeed {
    ctx: SyncContext,
    subject_id: i64,
    cancel: CancellationToken,
}

impl BudgetedFeed {
    pub(crate) fn new(ctx: SyncContext, subject_id: i64, cancel: CancellationToken) -> Self {
        Self {
            ctx,
            subject_id,
            cancel,
        }
    }

    /// Wait until every limiter permits one more use, announcing long pauses to
    /// the observer, then count the use.
    async fn acquire(&self) -> feed::Result<()> {
        let limiter = &self.ctx.limiter;
        let suspend_ms = limiter.will_suspend_for(limiter.now());
        if suspend_ms > RATE_LIMIT_NOTICE_MS {
            self.ctx.observer.on_rate_limit(&RateLimitNotice::Suspending {
                subject_id: self.subject_id,
                suspend_ms,
            });
            job_log(
                self.ctx.observer.as_ref(),
                self.subject_id,
                LogLevel::Info,
                &format!("Rate limit reached, pausing for {}s", suspend_ms / 1000),
            );
        }
        // Callers race every call against the same token, so this error never
        // reaches them.
        limiter
            .wait(&self.cancel)
            .await
            .map_err(|_| FeedError::Cancelled)?;
        limiter.increment(limiter.now());
        Ok(())
    }

    async fn call<T, F, Fut>(&self, mut op: F) -> feed::Result<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = feed::Result<T>> + Send,
        T: Send,
    {
        // Each attempt, retries included, is gated and counted on its own.
        let result = with_retry(
            &self.ctx.retry,
            || {
                let request = op();
                async move {
                    self.acquire().await?;
                    request.await
                }
            },
            self.ctx.observer.as_ref(),
            self.subject_id,
        )
        .await;

        if let Err(e) = self.ctx.limiter.persist(self.ctx.store.as_ref(), false).await {
            tracing::warn!(subject = self.subject_id, "Failed to persist rate limits: {e}");
        }
        result
    }
}

#[async_trait]
impl ActivityFeed for BudgetedFeed {
    async fn check_connectivity(&self) -> feed::Result<()> {
        self.call(|| self.ctx.feed.check_connectivity()).await
    }

    async fn fetch_self_page(&self, subject_id: i64, before: Option<i64>) -> feed::Result<Vec<FeedEntry>> {
        self.call(|| self.ctx.feed.fetch_self_page(subject_id, before))
            .await
    }

    async fn fetch_peer_bucket(
        &self,
        subject_id: i64,
        bucket: MonthBucket,
    ) -> feed::Result<Vec<FeedActivity>> {
        self.call(|| self.ctx.feed.fetch_peer_bucket(subject_id, bucket))
            .await
    }

    async fn fetch_streams(&self, activity_id: i64, names: &[String]) -> feed::Result<StreamSet> {
        self.call(|| self.ctx.feed.fetch_streams(activity_id, names))
            .await
    }

    async fn fetch_summary(&self, activity_id: i64) -> feed::Result<serde_json::Value> {
        self.call(|| self.ctx.feed.fetch_summary(activity_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use crate::manifest::ManifestRegistry;
    use crate::rate_limit::{LimiterSpec, RateLimiterGroup};
    use crate::retry::RetryConfig;
    use crate::store::MemoryStore;

    /// Fails connectivity with 503 a few times, noting the limiter usage seen by
    /// every attempt.
    struct Flaky {
        limiter: Arc<RateLimiterGroup>,
        failures: u32,
        calls: AtomicU32,
        max_used: AtomicU32,
    }

    #[async_trait]
    impl ActivityFeed for Flaky {
        async fn check_connectivity(&self) -> feed::Result<()> {
            let used = self.limiter.status(self.limiter.now())[0].used;
            self.max_used.fetch_max(used, Ordering::SeqCst);
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(FeedError::Server {
                    status: 503,
                    message: "unavailable".into(),
                });
            }
            Ok(())
        }

        async fn fetch_self_page(&self, _: i64, _: Option<i64>) -> feed::Result<Vec<FeedEntry>> {
            Ok(Vec::new())
        }

        async fn fetch_peer_bucket(&self, _: i64, _: MonthBucket) -> feed::Result<Vec<FeedActivity>> {
            Ok(Vec::new())
        }

        async fn fetch_streams(&self, _: i64, _: &[String]) -> feed::Result<StreamSet> {
            Ok(StreamSet::new())
        }

        async fn fetch_summary(&self, _: i64) -> feed::Result<serde_json::Value> {
            Ok(serde_json::Value::Null)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_wait_for_capacity_like_first_attempts() {
        let limiter = Arc::new(RateLimiterGroup::new([LimiterSpec::new(
            "hour", 3_600_000, 2, false,
        )]));
        let feed = Arc::new(Flaky {
            limiter: Arc::clone(&limiter),
            failures: 3,
            calls: AtomicU32::new(0),
            max_used: AtomicU32::new(0),
        });
        let ctx = SyncContext::builder()
            .store(Arc::new(MemoryStore::new()))
            .feed(feed.clone())
            .registry(Arc::new(ManifestRegistry::new()))
            .limiter(Arc::clone(&limiter))
            .retry(RetryConfig::new(Duration::from_millis(1), Duration::from_millis(5), 5))
            .build()
            .unwrap();
        let budgeted = BudgetedFeed::new(ctx, 1, CancellationToken::new());

        let started = tokio::time::Instant::now();
        budgeted.check_connectivity().await.unwrap();

        assert_eq!(feed.calls.load(Ordering::SeqCst), 4);
        assert!(feed.max_used.load(Ordering::SeqCst) <= 2);
        // Four uses of a two-per-hour budget span at least one window reset.
        assert!(started.elapsed() >= Duration::from_millis(3_599_000));
    }

    #[tokio::test]
    async fn cancelled_wait_is_not_retried() {
        let limiter = Arc::new(RateLimiterGroup::new([LimiterSpec::new(
            "hour", 3_600_000, 1, false,
        )]));
        limiter.increment(limiter.now());
        let feed = Arc::new(Flaky {
            limiter: Arc::clone(&limiter),
            failures: 0,
            calls: AtomicU32::new(0),
            max_used: AtomicU32::new(0),
        });
        let ctx = SyncContext::builder()
            .store(Arc::new(MemoryStore::new()))
            .feed(feed.clone())
            .registry(Arc::new(ManifestRegistry::new()))
            .limiter(limiter)
            .build()
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let budgeted = BudgetedFeed::new(ctx, 1, cancel);

        let err = budgeted.check_connectivity().await.unwrap_err();
        assert!(matches!(err, FeedError::Cancelled));
        assert_eq!(feed.calls.load(Ordering::SeqCst), 0);
    }
}
