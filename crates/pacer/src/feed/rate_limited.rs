use async_trait::async_trait;

use crate::entity::prelude::StreamSet;
use crate::rate_limit::ApiRateLimiter;

use super::types::{FeedActivity, FeedEntry, MonthBucket};
use super::{ActivityFeed, Result};

/// A per-second burst limiter wrapped around any [`ActivityFeed`].
///
/// This smooths request bursts (e.g. concurrent peer bucket scans); the
/// multi-window upstream budget is enforced separately by
/// [`RateLimiterGroup`](crate::rate_limit::RateLimiterGroup).
pub struct RateLimitedFeed<F> {
    inner: F,
    rate_limiter: ApiRateLimiter,
}

impl<F> RateLimitedFeed<F> {
    /// Wrap `inner`, allowing at most `requests_per_second` (minimum 1).
    pub fn new(inner: F, requests_per_second: u32) -> Self {
        Self::with_limiter(inner, ApiRateLimiter::new(requests_per_second))
    }

    /// Wrap `inner` with a limiter shared with other callers.
    pub fn with_limiter(inner: F, rate_limiter: ApiRateLimiter) -> Self {
        Self {
            inner,
            rate_limiter,
        }
    }

    pub fn inner(&self) -> &F {
        &self.inner
    }

    async fn wait(&self) {
        self.rate_limiter.wait().await;
    }
}

impl<F: Clone> Clone for RateLimitedFeed<F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            rate_limiter: self.rate_limiter.clone(),
        }
    }
}

#[async_trait]
impl<F: ActivityFeed> ActivityFeed for RateLimitedFeed<F> {
    async fn check_connectivity(&self) -> Result<()> {
        self.wait().await;
        self.inner.check_connectivity().await
    }

    async fn fetch_self_page(&self, subject_id: i64, before: Option<i64>) -> Result<Vec<FeedEntry>> {
        self.wait().await;
        self.inner.fetch_self_page(subject_id, before).await
    }

    async fn fetch_peer_bucket(
        &self,
        subject_id: i64,
        bucket: MonthBucket,
    ) -> Result<Vec<FeedActivity>> {
        self.wait().await;
        self.inner.fetch_peer_bucket(subject_id, bucket).await
    }

    async fn fetch_streams(&self, activity_id: i64, names: &[String]) -> Result<StreamSet> {
        self.wait().await;
        self.inner.fetch_streams(activity_id, names).await
    }

    async fn fetch_summary(&self, activity_id: i64) -> Result<serde_json::Value> {
        self.wait().await;
        self.inner.fetch_summary(activity_id).await
    }
}
