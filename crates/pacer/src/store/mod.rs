//! Persistence contract used by the sync engine.
//!
//! The engine only assumes per-record atomicity: every method is atomic for the
//! records it touches, and no cross-record transactions are required. Callers
//! serialize read-modify-write sequences with the per-subject lock.

mod errors;
mod memory;
mod sql;

use async_trait::async_trait;

use crate::entity::prelude::*;

pub use errors::{Result, StoreError};
pub use memory::MemoryStore;
pub use sql::{DEFAULT_WRITE_BACKOFF_MS, DEFAULT_WRITE_RETRIES, SqlStore};

/// Indexed get/put/iterate access to subjects, activities, streams and
/// small named state items.
#[async_trait]
pub trait Store: Send + Sync {
    // ─── Subjects ────────────────────────────────────────────────────────────
    async fn get_subject(&self, id: i64) -> Result<Option<Subject>>;

    async fn list_subjects(&self) -> Result<Vec<Subject>>;

    async fn put_subject(&self, subject: &Subject) -> Result<()>;

    /// Delete a subject together with its activities and streams.
    ///
    /// Returns the number of activities removed.
    async fn delete_subject(&self, id: i64) -> Result<u64>;

    // ─── Activities ──────────────────────────────────────────────────────────
    async fn get_activity(&self, id: i64) -> Result<Option<Activity>>;

    /// Fetch several activities by id. Missing ids are skipped.
    async fn get_activities(&self, ids: &[i64]) -> Result<Vec<Activity>>;

    /// Insert or replace activities. Returns the number written.
    async fn put_activities(&self, activities: &[Activity]) -> Result<u64>;

    /// Every activity of a subject ordered by timestamp, oldest first.
    async fn activities_for_subject(&self, subject_id: i64) -> Result<Vec<Activity>>;

    /// Up to `limit` activities of a subject strictly before `ts`, newest first.
    async fn activities_before(&self, subject_id: i64, ts: i64, limit: u64)
    -> Result<Vec<Activity>>;

    /// Delete activities and their streams. Returns the number of activities removed.
    async fn delete_activities(&self, ids: &[i64]) -> Result<u64>;

    /// Delete activities and streams whose owning subject no longer exists.
    ///
    /// Returns the number of activities removed.
    async fn delete_orphans(&self) -> Result<u64>;

    // ─── Streams ─────────────────────────────────────────────────────────────
    async fn get_streams(&self, activity_id: i64) -> Result<Option<StreamSet>>;

    async fn put_streams(
        &self,
        activity_id: i64,
        subject_id: i64,
        streams: &StreamSet,
        fetched_at: i64,
    ) -> Result<()>;

    // ─── Key/Value State ─────────────────────────────────────────────────────
    async fn get_state(&self, key: &str) -> Result<Option<serde_json::Value>>;

    async fn put_state(&self, key: &str, value: serde_json::Value) -> Result<()>;
}
