//! Retry of transient upstream failures.
//!
//! Server errors, rate limiting and network failures are retried with exponential
//! backoff and jitter; everything else surfaces immediately.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};

use crate::feed::{FeedError, short_error_message};
use crate::sync::events::{RateLimitNotice, SyncObserver};
use crate::sync::types::{INITIAL_BACKOFF_MS, MAX_BACKOFF_MS, MAX_FEED_RETRIES};

/// Configuration for retry operations.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Minimum delay between retries.
    pub min_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Maximum number of retry attempts.
    pub max_retries: usize,
    /// Whether to add jitter to delays.
    pub with_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(INITIAL_BACKOFF_MS),
            max_delay: Duration::from_millis(MAX_BACKOFF_MS),
            max_retries: MAX_FEED_RETRIES,
            with_jitter: true,
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub fn new(min_delay: Duration, max_delay: Duration, max_retries: usize) -> Self {
        Self {
            min_delay,
            max_delay,
            max_retries,
            with_jitter: true,
        }
    }

    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.with_jitter = jitter;
        self
    }

    /// Build an exponential backoff strategy from this configuration.
    #[must_use]
    pub fn into_backoff(self) -> ExponentialBuilder {
        let builder = ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_retries);

        if self.with_jitter {
            builder.with_jitter()
        } else {
            builder
        }
    }
}

/// Run a feed operation, retrying transient failures.
///
/// Every retry is logged and reported to `observer` as a
/// [`RateLimitNotice::Retrying`] for `subject_id`.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    mut operation: F,
    observer: &dyn SyncObserver,
    subject_id: i64,
) -> Result<T, FeedError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FeedError>>,
{
    let attempt = AtomicU32::new(0);

    let retry_op = || {
        attempt.fetch_add(1, Ordering::SeqCst);
        operation()
    };

    retry_op
        .retry(config.clone().into_backoff())
        .notify(|err: &FeedError, dur: Duration| {
            let current = attempt.load(Ordering::SeqCst);
            let message = short_error_message(err);
            tracing::debug!(
                subject = subject_id,
                "Transient feed error, retrying in {:?} (attempt {}): {}",
                dur,
                current,
                message
            );
            observer.on_rate_limit(&RateLimitNotice::Retrying {
                subject_id,
                attempt: current,
                retry_after_ms: dur.as_millis() as u64,
                message,
            });
        })
        .when(FeedError::is_transient)
        .await
}
