//! Remote activity feed.
//!
//! [`ActivityFeed`] is the only way the engine talks to the remote service. The
//! production implementation is [`HttpFeed`]; [`RateLimitedFeed`] adds per-second
//! burst smoothing on top of any feed. Discovery walks feeds through the pull-based
//! pagers in [`pager`].

mod errors;
mod http;
pub mod pager;
mod rate_limited;
mod types;

use async_trait::async_trait;

use crate::entity::prelude::StreamSet;

pub use errors::{FeedError, short_error_message};
pub use http::HttpFeed;
pub use pager::{PeerBucketScanner, PeerScanOptions, SelfFeedPager};
pub use rate_limited::RateLimitedFeed;
pub use types::{FeedActivity, FeedEntry, MonthBucket};

/// Result type for feed operations.
pub type Result<T> = std::result::Result<T, FeedError>;

/// Operations the sync engine needs from the remote service.
#[async_trait]
pub trait ActivityFeed: Send + Sync {
    /// Cheap authenticated round-trip used before a job starts.
    async fn check_connectivity(&self) -> Result<()>;

    /// One page of the owner's feed, entries strictly older than `before`
    /// (newest page when `None`). An empty page means the end of the feed.
    async fn fetch_self_page(&self, subject_id: i64, before: Option<i64>) -> Result<Vec<FeedEntry>>;

    /// Every public activity of a peer within one calendar month.
    async fn fetch_peer_bucket(&self, subject_id: i64, bucket: MonthBucket)
    -> Result<Vec<FeedActivity>>;

    /// Named data series for an activity. [`FeedError::NotFound`] means the remote
    /// definitively has no streams for it.
    async fn fetch_streams(&self, activity_id: i64, names: &[String]) -> Result<StreamSet>;

    /// Summary fields for an activity; fallback when streams are absent.
    async fn fetch_summary(&self, activity_id: i64) -> Result<serde_json::Value>;
}

#[async_trait]
impl<F: ActivityFeed + ?Sized> ActivityFeed for std::sync::Arc<F> {
    async fn check_connectivity(&self) -> Result<()> {
        (**self).check_connectivity().await
    }

    async fn fetch_self_page(&self, subject_id: i64, before: Option<i64>) -> Result<Vec<FeedEntry>> {
        (**self).fetch_self_page(subject_id, before).await
    }

    async fn fetch_peer_bucket(
        &self,
        subject_id: i64,
        bucket: MonthBucket,
    ) -> Result<Vec<FeedActivity>> {
        (**self).fetch_peer_bucket(subject_id, bucket).await
    }

    async fn fetch_streams(&self, activity_id: i64, names: &[String]) -> Result<StreamSet> {
        (**self).fetch_streams(activity_id, names).await
    }

    async fn fetch_summary(&self, activity_id: i64) -> Result<serde_json::Value> {
        (**self).fetch_summary(activity_id).await
    }
}
