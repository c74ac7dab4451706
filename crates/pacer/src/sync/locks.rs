//! Per-subject advisory locks.
//!
//! Every read-modify-write of a subject's records happens under its lock, so a
//! manual invalidation and a running job never interleave writes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Guard proving exclusive access to one subject's records.
pub type SubjectGuard = OwnedMutexGuard<()>;

#[derive(Default)]
pub struct SubjectLocks {
    locks: Mutex<HashMap<i64, Arc<AsyncMutex<()>>>>,
}

impl SubjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, subject_id: i64) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(subject_id).or_default())
    }

    /// Wait for exclusive access to `subject_id`.
    pub async fn lock(&self, subject_id: i64) -> SubjectGuard {
        self.slot(subject_id).lock_owned().await
    }

    /// Take the lock only if nobody holds it.
    pub fn try_lock(&self, subject_id: i64) -> Option<SubjectGuard> {
        self.slot(subject_id).try_lock_owned().ok()
    }

    /// Forget the lock slot of a removed subject.
    pub fn forget(&self, subject_id: i64) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = locks.get(&subject_id)
            && Arc::strong_count(slot) == 1
        {
            locks.remove(&subject_id);
        }
    }
}
