//! In-memory store for tests and dry runs.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::entity::prelude::*;

use super::errors::{Result, StoreError};
use super::Store;

#[derive(Default)]
struct Tables {
    subjects: BTreeMap<i64, Subject>,
    activities: HashMap<i64, Activity>,
    streams: HashMap<i64, (i64, StreamSet)>,
    state: HashMap<String, serde_json::Value>,
}

/// Store holding everything in process memory.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of activities currently held.
    pub async fn activity_count(&self) -> usize {
        self.tables.lock().await.activities.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_subject(&self, id: i64) -> Result<Option<Subject>> {
        Ok(self.tables.lock().await.subjects.get(&id).cloned())
    }

    async fn list_subjects(&self) -> Result<Vec<Subject>> {
        Ok(self.tables.lock().await.subjects.values().cloned().collect())
    }

    async fn put_subject(&self, subject: &Subject) -> Result<()> {
        self.tables
            .lock()
            .await
            .subjects
            .insert(subject.id, subject.clone());
        Ok(())
    }

    async fn delete_subject(&self, id: i64) -> Result<u64> {
        let mut tables = self.tables.lock().await;
        if tables.subjects.remove(&id).is_none() {
            return Err(StoreError::subject_not_found(id));
        }
        let before = tables.activities.len();
        tables.activities.retain(|_, a| a.subject_id != id);
        tables.streams.retain(|_, (subject_id, _)| *subject_id != id);
        Ok((before - tables.activities.len()) as u64)
    }

    async fn get_activity(&self, id: i64) -> Result<Option<Activity>> {
        Ok(self.tables.lock().await.activities.get(&id).cloned())
    }

    async fn get_activities(&self, ids: &[i64]) -> Result<Vec<Activity>> {
        let tables = self.tables.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| tables.activities.get(id).cloned())
            .collect())
    }

    async fn put_activities(&self, activities: &[Activity]) -> Result<u64> {
        let mut tables = self.tables.lock().await;
        for activity in activities {
            tables.activities.insert(activity.id, activity.clone());
        }
        Ok(activities.len() as u64)
    }

    async fn activities_for_subject(&self, subject_id: i64) -> Result<Vec<Activity>> {
        let tables = self.tables.lock().await;
        let mut out: Vec<Activity> = tables
            .activities
            .values()
            .filter(|a| a.subject_id == subject_id)
            .cloned()
            .collect();
        out.sort_by_key(|a| (a.ts, a.id));
        Ok(out)
    }

    async fn activities_before(
        &self,
        subject_id: i64,
        ts: i64,
        limit: u64,
    ) -> Result<Vec<Activity>> {
        let tables = self.tables.lock().await;
        let mut out: Vec<Activity> = tables
            .activities
            .values()
            .filter(|a| a.subject_id == subject_id && a.ts < ts)
            .cloned()
            .collect();
        out.sort_by_key(|a| std::cmp::Reverse((a.ts, a.id)));
        out.truncate(limit as usize);
        Ok(out)
    }

    async fn delete_activities(&self, ids: &[i64]) -> Result<u64> {
        let mut tables = self.tables.lock().await;
        let mut removed = 0;
        for id in ids {
            tables.streams.remove(id);
            if tables.activities.remove(id).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn delete_orphans(&self) -> Result<u64> {
        let mut tables = self.tables.lock().await;
        let Tables {
            subjects,
            activities,
            streams,
            ..
        } = &mut *tables;
        let before = activities.len();
        activities.retain(|_, a| subjects.contains_key(&a.subject_id));
        streams.retain(|_, (subject_id, _)| subjects.contains_key(subject_id));
        Ok((before - activities.len()) as u64)
    }

    async fn get_streams(&self, activity_id: i64) -> Result<Option<StreamSet>> {
        Ok(self
            .tables
            .lock()
            .await
            .streams
            .get(&activity_id)
            .map(|(_, set)| set.clone()))
    }

    async fn put_streams(
        &self,
        activity_id: i64,
        subject_id: i64,
        streams: &StreamSet,
        _fetched_at: i64,
    ) -> Result<()> {
        self.tables
            .lock()
            .await
            .streams
            .insert(activity_id, (subject_id, streams.clone()));
        Ok(())
    }

    async fn get_state(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.tables.lock().await.state.get(key).cloned())
    }

    async fn put_state(&self, key: &str, value: serde_json::Value) -> Result<()> {
        self.tables
            .lock()
            .await
            .state
            .insert(key.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn activity(id: i64, subject_id: i64, ts: i64) -> Activity {
        Activity::new(id, subject_id, ts, ActivityKind::Run, "run")
    }

    #[tokio::test]
    async fn activities_before_is_newest_first_and_strict() {
        let store = MemoryStore::new();
        store
            .put_activities(&[activity(1, 1, 100), activity(2, 1, 200), activity(3, 1, 300)])
            .await
            .unwrap();

        let before = store.activities_before(1, 300, 10).await.unwrap();
        let ids: Vec<i64> = before.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![2, 1]);

        let limited = store.activities_before(1, 301, 1).await.unwrap();
        assert_eq!(limited[0].id, 3);
    }

    #[tokio::test]
    async fn delete_subject_cascades() {
        let store = MemoryStore::new();
        store.put_subject(&Subject::new(1, "a", true, 0)).await.unwrap();
        store.put_subject(&Subject::new(2, "b", false, 0)).await.unwrap();
        store
            .put_activities(&[activity(1, 1, 100), activity(2, 2, 100)])
            .await
            .unwrap();
        store.put_streams(1, 1, &StreamSet::new(), 0).await.unwrap();

        assert_eq!(store.delete_subject(1).await.unwrap(), 1);
        assert!(store.get_streams(1).await.unwrap().is_none());
        assert_eq!(store.activity_count().await, 1);
        assert!(matches!(
            store.delete_subject(1).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn delete_orphans_removes_unowned_rows() {
        let store = MemoryStore::new();
        store.put_subject(&Subject::new(1, "a", true, 0)).await.unwrap();
        store
            .put_activities(&[activity(1, 1, 100), activity(2, 9, 100)])
            .await
            .unwrap();

        assert_eq!(store.delete_orphans().await.unwrap(), 1);
        assert!(store.get_activity(2).await.unwrap().is_none());
        assert!(store.get_activity(1).await.unwrap().is_some());
    }
}
