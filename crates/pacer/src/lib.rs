//! Pacer - an incremental activity sync engine.
//!
//! This library mirrors a remote athlete's activity timeline into a local store and
//! incrementally computes derived analytics. A registry of versioned, dependency-aware
//! manifests decides which work each activity still needs; a per-subject job discovers
//! activities, fetches remote streams under a multi-window rate budget, and schedules
//! local processors inline or on offloaded worker pools.
//!
//! # Features
//!
//! - `migrate` - Enables database migration support. When enabled, you can use
//!   [`connect_and_migrate`] to automatically run migrations on connection.
//! - `http` - Enables the reqwest-backed transport for [`feed::HttpFeed`].
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use pacer::{connect_and_migrate, processors, store::SqlStore, sync::{SyncConfig, SyncManager}};
//!
//! let db = connect_and_migrate("sqlite://pacer.db?mode=rwc").await?;
//! let store = Arc::new(SqlStore::new(db));
//! let registry = Arc::new(processors::default_registry(&Default::default())?);
//! let manager = SyncManager::new(store, feed, registry, SyncConfig::default())?;
//! manager.run(shutdown_token).await;
//! ```

pub mod db;
pub mod entity;
pub mod feed;
pub mod http;
pub mod manifest;
pub mod offload;
pub mod processors;
pub mod rate_limit;
pub mod retry;
pub mod store;
pub mod sync;

#[cfg(feature = "migrate")]
pub mod migration;

pub use db::connect;
#[cfg(feature = "migrate")]
pub use db::connect_and_migrate;
pub use entity::prelude::*;
pub use feed::{ActivityFeed, FeedError, HttpFeed, RateLimitedFeed};
pub use manifest::{Manifest, ManifestKind, ManifestRegistry, RegistryError};
pub use rate_limit::{ApiRateLimiter, RateLimiterGroup};
pub use store::{MemoryStore, SqlStore, Store, StoreError};
pub use sync::{SyncConfig, SyncManager, SyncObserver, SyncSupervisor};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
