//! Shared collaborators for jobs and the manager.
//!
//! # Example
//!
//! ```ignore
//! use pacer::sync::{SyncConfig, SyncContext};
//!
//! let ctx = SyncContext::builder()
//!     .store(store)
//!     .feed(feed)
//!     .registry(registry)
//!     .config(SyncConfig::default())
//!     .observer(observer)
//!     .build()?;
//! ```

use std::sync::Arc;

use crate::feed::ActivityFeed;
use crate::manifest::ManifestRegistry;
use crate::rate_limit::RateLimiterGroup;
use crate::retry::RetryConfig;
use crate::store::Store;

use super::events::{NoopObserver, ObserverRef};
use super::locks::SubjectLocks;
use super::types::SyncConfig;

/// Error type for context construction.
#[derive(Debug, thiserror::Error)]
pub enum SyncContextError {
    /// Missing required field in builder.
    #[error("Missing required field: {field}")]
    MissingField { field: &'static str },
}

/// Builder for [`SyncContext`].
///
/// Store, feed and registry are required. Everything else has a default: a
/// fresh limiter group built from the config's rate-limit specs, a no-op
/// observer and the standard retry policy.
#[derive(Default)]
pub struct SyncContextBuilder {
    store: Option<Arc<dyn Store>>,
    feed: Option<Arc<dyn ActivityFeed>>,
    registry: Option<Arc<ManifestRegistry>>,
    config: Option<SyncConfig>,
    limiter: Option<Arc<RateLimiterGroup>>,
    observer: Option<ObserverRef>,
    locks: Option<Arc<SubjectLocks>>,
    retry: Option<RetryConfig>,
}

impl SyncContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn feed(mut self, feed: Arc<dyn ActivityFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn registry(mut self, registry: Arc<ManifestRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Share a limiter group, e.g. between a replaced manager and its successor.
    pub fn limiter(mut self, limiter: Arc<RateLimiterGroup>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn observer(mut self, observer: ObserverRef) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn locks(mut self, locks: Arc<SubjectLocks>) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn build(self) -> Result<SyncContext, SyncContextError> {
        let store = self
            .store
            .ok_or(SyncContextError::MissingField { field: "store" })?;
        let feed = self
            .feed
            .ok_or(SyncContextError::MissingField { field: "feed" })?;
        let registry = self
            .registry
            .ok_or(SyncContextError::MissingField { field: "registry" })?;
        let config = self.config.unwrap_or_default();
        let limiter = self
            .limiter
            .unwrap_or_else(|| Arc::new(RateLimiterGroup::new(config.rate_limits.clone())));

        Ok(SyncContext {
            store,
            feed,
            registry,
            limiter,
            observer: self.observer.unwrap_or_else(|| Arc::new(NoopObserver)),
            config: Arc::new(config),
            locks: self.locks.unwrap_or_default(),
            retry: self.retry.unwrap_or_default(),
        })
    }
}

/// Everything a job needs, cheap to clone.
#[derive(Clone)]
pub struct SyncContext {
    pub store: Arc<dyn Store>,
    pub feed: Arc<dyn ActivityFeed>,
    pub registry: Arc<ManifestRegistry>,
    pub limiter: Arc<RateLimiterGroup>,
    pub observer: ObserverRef,
    pub config: Arc<SyncConfig>,
    pub locks: Arc<SubjectLocks>,
    pub retry: RetryConfig,
}

impl SyncContext {
    pub fn builder() -> SyncContextBuilder {
        SyncContextBuilder::new()
    }
}
