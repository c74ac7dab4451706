use std::sync::atomic::{AtomicUsize, Ordering};

use crate::sync::events::{ProgressSnapshot, SyncObserver};

/// Counters shared by the two processing stages.
#[derive(Debug)]
pub(super) struct JobProgress {
    subject_id: i64,
    total: usize,
    streams_pending: AtomicUsize,
    local_pending: AtomicUsize,
    completed: AtomicUsize,
    errored: AtomicUsize,
}

impl JobProgress {
    pub(super) fn new(subject_id: i64, fetch: usize, local: usize) -> Self {
        Self {
            subject_id,
            total: fetch + local,
            streams_pending: AtomicUsize::new(fetch),
            local_pending: AtomicUsize::new(local),
            completed: AtomicUsize::new(0),
            errored: AtomicUsize::new(0),
        }
    }

    /// An activity moved from the fetch stage to the local stage.
    pub(super) fn fetched(&self) {
        self.streams_pending.fetch_sub(1, Ordering::Relaxed);
        self.local_pending.fetch_add(1, Ordering::Relaxed);
    }

    /// An activity has nothing left to run in this job.
    pub(super) fn completed(&self) {
        self.local_pending.fetch_sub(1, Ordering::Relaxed);
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn errored(&self, count: usize) {
        self.errored.fetch_add(count, Ordering::Relaxed);
    }

    pub(super) fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            subject_id: self.subject_id,
            total: self.total,
            streams_pending: self.streams_pending.load(Ordering::Relaxed),
            local_pending: self.local_pending.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            errored: self.errored.load(Ordering::Relaxed),
        }
    }

    pub(super) fn emit(&self, observer: &dyn SyncObserver) {
        observer.on_progress(&self.snapshot());
    }
}
