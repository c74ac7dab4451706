use std::num::NonZeroU32;
use std::sync::Arc;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

/// Type alias for the governor rate limiter.
type GovernorRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Default per-second request ceiling for the remote feed.
pub const DEFAULT_FEED_RPS: u32 = 5;

/// A per-second burst limiter using the governor crate.
///
/// Cloning shares the underlying limiter.
///
/// # Example
///
/// ```ignore
/// use pacer::rate_limit::ApiRateLimiter;
///
/// let limiter = ApiRateLimiter::new(5);
/// limiter.wait().await;
/// feed.fetch_summary(id).await?;
/// ```
#[derive(Clone)]
pub struct ApiRateLimiter {
    inner: Arc<GovernorRateLimiter>,
}

impl ApiRateLimiter {
    /// Create a limiter allowing `requests_per_second` (0 is treated as 1).
    pub fn new(requests_per_second: u32) -> Self {
        let rps = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            inner: Arc::new(RateLimiter::direct(Quota::per_second(rps))),
        }
    }

    /// Wait until another request is allowed.
    pub async fn wait(&self) {
        self.inner.until_ready().await;
    }

    /// Take a permit without waiting. Returns false if none is available.
    pub fn try_acquire(&self) -> bool {
        self.inner.check().is_ok()
    }
}
