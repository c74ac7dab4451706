//! SeaORM-backed store.

use async_trait::async_trait;
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set,
    sea_query::OnConflict,
};

use crate::entity::prelude::*;
use crate::entity::{activity, activity_stream, kv_state, subject};

use super::errors::{Result, StoreError};
use super::Store;

/// Default number of retry attempts for batched writes.
pub const DEFAULT_WRITE_RETRIES: u32 = 3;

/// Default initial backoff delay in milliseconds for batched write retries.
pub const DEFAULT_WRITE_BACKOFF_MS: u64 = 100;

/// Rows per INSERT statement; keeps SQLite well under its bound-variable limit.
const WRITE_CHUNK: usize = 100;

/// Store over a SeaORM connection.
pub struct SqlStore {
    db: DatabaseConnection,
    max_retries: u32,
    initial_backoff_ms: u64,
}

impl SqlStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self {
            db,
            max_retries: DEFAULT_WRITE_RETRIES,
            initial_backoff_ms: DEFAULT_WRITE_BACKOFF_MS,
        }
    }

    /// Override retry behaviour for batched writes.
    pub fn with_retry(mut self, max_retries: u32, initial_backoff_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.initial_backoff_ms = initial_backoff_ms;
        self
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    async fn upsert_activities_inner(&self, models: Vec<activity::ActiveModel>) -> Result<()> {
        if models.is_empty() {
            return Ok(());
        }
        ActivityEntity::insert_many(models)
            .on_conflict(activity_on_conflict())
            .exec_without_returning(&self.db)
            .await?;
        Ok(())
    }

    /// Upsert a chunk, retrying transient database errors with exponential backoff.
    async fn upsert_activities_with_retry(&self, models: Vec<activity::ActiveModel>) -> Result<()> {
        let mut backoff_ms = self.initial_backoff_ms;
        let mut attempt = 0;
        loop {
            match self.upsert_activities_inner(models.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        attempt,
                        max_retries = self.max_retries,
                        backoff_ms,
                        error = %e,
                        "Activity batch write failed, retrying..."
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn activity_on_conflict() -> OnConflict {
    OnConflict::column(ActivityColumn::Id)
        .update_columns([
            ActivityColumn::SubjectId,
            ActivityColumn::Ts,
            ActivityColumn::Kind,
            ActivityColumn::Name,
            ActivityColumn::ContentHash,
            ActivityColumn::SyncState,
            ActivityColumn::Stats,
            ActivityColumn::Summary,
            ActivityColumn::UpdatedAt,
        ])
        .to_owned()
}

fn activity_active_model(a: &Activity) -> activity::ActiveModel {
    activity::ActiveModel {
        id: Set(a.id),
        subject_id: Set(a.subject_id),
        ts: Set(a.ts),
        kind: Set(a.kind),
        name: Set(a.name.clone()),
        content_hash: Set(a.content_hash.clone()),
        sync_state: Set(a.sync_state.clone()),
        stats: Set(a.stats.clone()),
        summary: Set(a.summary.clone()),
        updated_at: Set(a.updated_at),
    }
}

fn subject_active_model(s: &Subject) -> subject::ActiveModel {
    subject::ActiveModel {
        id: Set(s.id),
        name: Set(s.name.clone()),
        enabled: Set(s.enabled),
        is_self: Set(s.is_self),
        last_sync_ts: Set(s.last_sync_ts),
        last_sync_error_ts: Set(s.last_sync_error_ts),
        last_sync_error: Set(s.last_sync_error.clone()),
        last_applied_manifest_hash: Set(s.last_applied_manifest_hash.clone()),
        discovery_cursor: Set(s.discovery_cursor),
        discovery_sentinel: Set(s.discovery_sentinel),
        ftp_history: Set(s.ftp_history.clone()),
        weight_history: Set(s.weight_history.clone()),
        created_at: Set(s.created_at),
    }
}

#[async_trait]
impl Store for SqlStore {
    async fn get_subject(&self, id: i64) -> Result<Option<Subject>> {
        Ok(SubjectEntity::find_by_id(id).one(&self.db).await?)
    }

    async fn list_subjects(&self) -> Result<Vec<Subject>> {
        Ok(SubjectEntity::find()
            .order_by_asc(SubjectColumn::Id)
            .all(&self.db)
            .await?)
    }

    async fn put_subject(&self, subject: &Subject) -> Result<()> {
        SubjectEntity::insert(subject_active_model(subject))
            .on_conflict(
                OnConflict::column(SubjectColumn::Id)
                    .update_columns([
                        SubjectColumn::Name,
                        SubjectColumn::Enabled,
                        SubjectColumn::IsSelf,
                        SubjectColumn::LastSyncTs,
                        SubjectColumn::LastSyncErrorTs,
                        SubjectColumn::LastSyncError,
                        SubjectColumn::LastAppliedManifestHash,
                        SubjectColumn::DiscoveryCursor,
                        SubjectColumn::DiscoverySentinel,
                        SubjectColumn::FtpHistory,
                        SubjectColumn::WeightHistory,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;
        Ok(())
    }

    async fn delete_subject(&self, id: i64) -> Result<u64> {
        ActivityStreamEntity::delete_many()
            .filter(ActivityStreamColumn::SubjectId.eq(id))
            .exec(&self.db)
            .await?;
        let removed = ActivityEntity::delete_many()
            .filter(ActivityColumn::SubjectId.eq(id))
            .exec(&self.db)
            .await?
            .rows_affected;
        let result = SubjectEntity::delete_by_id(id).exec(&self.db).await?;
        if result.rows_affected == 0 {
            return Err(StoreError::subject_not_found(id));
        }
        Ok(removed)
    }

    async fn get_activity(&self, id: i64) -> Result<Option<Activity>> {
        Ok(ActivityEntity::find_by_id(id).one(&self.db).await?)
    }

    async fn get_activities(&self, ids: &[i64]) -> Result<Vec<Activity>> {
        let mut out = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(WRITE_CHUNK) {
            let found = ActivityEntity::find()
                .filter(ActivityColumn::Id.is_in(chunk.to_vec()))
                .all(&self.db)
                .await?;
            out.extend(found);
        }
        Ok(out)
    }

    async fn put_activities(&self, activities: &[Activity]) -> Result<u64> {
        if activities.is_empty() {
            return Ok(0);
        }
        tracing::debug!(count = activities.len(), "Writing activity batch");
        for chunk in activities.chunks(WRITE_CHUNK) {
            let models = chunk.iter().map(activity_active_model).collect();
            self.upsert_activities_with_retry(models).await?;
        }
        Ok(activities.len() as u64)
    }

    async fn activities_for_subject(&self, subject_id: i64) -> Result<Vec<Activity>> {
        Ok(ActivityEntity::find()
            .filter(ActivityColumn::SubjectId.eq(subject_id))
            .order_by_asc(ActivityColumn::Ts)
            .all(&self.db)
            .await?)
    }

    async fn activities_before(
        &self,
        subject_id: i64,
        ts: i64,
        limit: u64,
    ) -> Result<Vec<Activity>> {
        Ok(ActivityEntity::find()
            .filter(ActivityColumn::SubjectId.eq(subject_id))
            .filter(ActivityColumn::Ts.lt(ts))
            .order_by_desc(ActivityColumn::Ts)
            .limit(limit)
            .all(&self.db)
            .await?)
    }

    async fn delete_activities(&self, ids: &[i64]) -> Result<u64> {
        let mut removed = 0;
        for chunk in ids.chunks(WRITE_CHUNK) {
            ActivityStreamEntity::delete_many()
                .filter(ActivityStreamColumn::ActivityId.is_in(chunk.to_vec()))
                .exec(&self.db)
                .await?;
            removed += ActivityEntity::delete_many()
                .filter(ActivityColumn::Id.is_in(chunk.to_vec()))
                .exec(&self.db)
                .await?
                .rows_affected;
        }
        Ok(removed)
    }

    async fn delete_orphans(&self) -> Result<u64> {
        let subject_ids: Vec<i64> = SubjectEntity::find()
            .select_only()
            .column(SubjectColumn::Id)
            .into_tuple()
            .all(&self.db)
            .await?;

        ActivityStreamEntity::delete_many()
            .filter(ActivityStreamColumn::SubjectId.is_not_in(subject_ids.clone()))
            .exec(&self.db)
            .await?;
        let result = ActivityEntity::delete_many()
            .filter(ActivityColumn::SubjectId.is_not_in(subject_ids))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }

    async fn get_streams(&self, activity_id: i64) -> Result<Option<StreamSet>> {
        Ok(ActivityStreamEntity::find_by_id(activity_id)
            .one(&self.db)
            .await?
            .map(|row| row.streams()))
    }

    async fn put_streams(
        &self,
        activity_id: i64,
        subject_id: i64,
        streams: &StreamSet,
        fetched_at: i64,
    ) -> Result<()> {
        let model = activity_stream::ActiveModel {
            activity_id: Set(activity_id),
            subject_id: Set(subject_id),
            data: Set(serde_json::to_value(streams)?),
            fetched_at: Set(fetched_at),
        };
        ActivityStreamEntity::insert(model)
            .on_conflict(
                OnConflict::column(ActivityStreamColumn::ActivityId)
                    .update_columns([
                        ActivityStreamColumn::SubjectId,
                        ActivityStreamColumn::Data,
                        ActivityStreamColumn::FetchedAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;
        Ok(())
    }

    async fn get_state(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(KvState::find_by_id(key.to_string())
            .one(&self.db)
            .await?
            .map(|row| row.value))
    }

    async fn put_state(&self, key: &str, value: serde_json::Value) -> Result<()> {
        let model = kv_state::ActiveModel {
            key: Set(key.to_string()),
            value: Set(value),
            updated_at: Set(crate::now_ms()),
        };
        KvState::insert(model)
            .on_conflict(
                OnConflict::column(KvStateColumn::Key)
                    .update_columns([KvStateColumn::Value, KvStateColumn::UpdatedAt])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::{DatabaseBackend, DbErr, MockDatabase, MockExecResult, QueryTrait, RuntimeErr};

    fn activity(id: i64) -> Activity {
        Activity::new(id, 1, id * 1_000, ActivityKind::Ride, format!("ride {id}"))
    }

    #[test]
    fn activity_upsert_updates_every_mutable_column() {
        let sql = ActivityEntity::insert(activity_active_model(&activity(1)))
            .on_conflict(activity_on_conflict())
            .build(DatabaseBackend::Sqlite)
            .to_string();
        assert!(sql.contains("ON CONFLICT (\"id\") DO UPDATE"));
        assert!(sql.contains("\"sync_state\" = \"excluded\".\"sync_state\""));
        assert!(sql.contains("\"stats\" = \"excluded\".\"stats\""));
    }

    #[tokio::test]
    async fn put_activities_returns_zero_for_empty_input() {
        let store = SqlStore::new(MockDatabase::new(DatabaseBackend::Sqlite).into_connection());
        assert_eq!(store.put_activities(&[]).await.expect("empty write"), 0);
    }

    #[tokio::test]
    async fn put_activities_retries_locked_database() {
        let db = MockDatabase::new(DatabaseBackend::Sqlite)
            .append_exec_errors([DbErr::Exec(RuntimeErr::Internal(
                "database is locked".to_string(),
            ))])
            .append_exec_results([MockExecResult {
                rows_affected: 2,
                last_insert_id: 0,
            }])
            .into_connection();
        let store = SqlStore::new(db).with_retry(2, 1);

        let written = store
            .put_activities(&[activity(1), activity(2)])
            .await
            .expect("retry should succeed");
        assert_eq!(written, 2);
    }

    #[tokio::test]
    async fn put_activities_surfaces_non_retryable_errors() {
        let db = MockDatabase::new(DatabaseBackend::Sqlite)
            .append_exec_errors([DbErr::Custom("constraint failed".to_string())])
            .into_connection();
        let store = SqlStore::new(db).with_retry(3, 1);

        let err = store
            .put_activities(&[activity(1)])
            .await
            .expect_err("custom error is terminal");
        assert!(!err.is_retryable());
    }
}
