//! Offload processors.
//!
//! An [`OffloadProcessor`] takes activities off the job's hands, works on them
//! outside the local-processing round and hands them back through a finished queue.
//! Two variants exist:
//!
//! - [`pool`] shards batches across worker threads that speak a request/ack
//!   protocol ([`worker`]).
//! - [`aggregate`] keeps running totals that depend on activity order.
//!
//! Both share the queue and lifecycle bookkeeping in [`OffloadShared`].

pub mod aggregate;
pub mod pool;
mod queue;
pub mod worker;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Notify;

use crate::entity::prelude::{Activity, Subject};
use crate::manifest::Manifest;
use crate::store::{Store, StoreError};
use crate::sync::types::OffloadConfig;

pub use aggregate::{AggregateFactory, RunningTotal};
pub use pool::{PoolFactory, PoolJob, dispatch_plan};
pub use queue::IncomingQueue;
pub use worker::{WorkItem, WorkerError, WorkerTask};

/// Errors from an offload instance.
#[derive(Debug, Error)]
pub enum OffloadError {
    /// The instance already terminated and accepts no more input.
    #[error("Offload instance terminated")]
    Terminated,

    /// A worker failed in a way that ends the instance.
    #[error("Worker failed: {0}")]
    Worker(#[from] WorkerError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Offload failed: {message}")]
    Failed { message: String },
}

/// What happened to one offloaded activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Done,
    Failed(String),
}

/// An activity handed back by an offload instance.
#[derive(Debug, Clone)]
pub struct Finished {
    pub activity: Activity,
    pub outcome: ItemOutcome,
}

/// Everything a factory needs to build an instance for one job.
#[derive(Clone)]
pub struct OffloadContext {
    pub manifest: Arc<Manifest>,
    pub subject: Subject,
    pub store: Arc<dyn Store>,
    pub config: OffloadConfig,
}

/// Creates offload instances for a manifest.
pub trait OffloadFactory: Send + Sync {
    fn create(&self, ctx: OffloadContext) -> Result<Arc<dyn OffloadProcessor>, OffloadError>;

    /// Instances of this manifest a job may keep alive at once.
    fn max_instances(&self, _config: &OffloadConfig) -> usize {
        1
    }

    /// Activities one instance should hold before another one is considered.
    fn instance_capacity(&self, config: &OffloadConfig) -> usize {
        config.worker_capacity.saturating_mul(config.max_workers).max(1)
    }
}

/// Queue-mediated processor running outside the local-processing round.
#[async_trait]
pub trait OffloadProcessor: Send + Sync {
    /// Enqueue activities, ordered by activity timestamp.
    fn put_incoming(&self, batch: Vec<Activity>) -> Result<(), OffloadError>;

    /// Take up to `max` completed items.
    fn get_finished(&self, max: usize) -> Vec<Finished>;

    /// Resolves once the finished queue is non-empty or the instance terminated.
    ///
    /// Not cancellable by itself; callers race it against their token.
    async fn wait_finished(&self);

    /// Emit partial results for buffered input without waiting for more.
    fn flush(&self);

    /// Finish current input, then terminate.
    fn stop(&self);

    /// Take every activity still queued or in flight. Only meaningful after the
    /// instance terminated with an error.
    fn drain_all(&self) -> Vec<Activity>;

    /// Activities queued or in flight.
    fn pending(&self) -> usize;

    /// Whether input is sitting in the incoming queue.
    fn has_buffered_input(&self) -> bool;

    fn is_terminated(&self) -> bool;

    /// Fatal error that terminated the instance, if any.
    fn terminal_error(&self) -> Option<String>;
}

/// Lifecycle of an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lifecycle {
    Running,
    Stopping,
    Terminated { error: Option<String> },
}

/// Bookkeeping shared by every offload variant.
pub struct OffloadState {
    pub incoming: IncomingQueue,
    pub in_flight: HashMap<i64, Activity>,
    pub finished: VecDeque<Finished>,
    pub lifecycle: Lifecycle,
    pub flush_requested: bool,
}

/// Queues plus wake-ups between an instance's driver task and its consumer.
pub struct OffloadShared {
    state: Mutex<OffloadState>,
    /// Wakes the driver: new input, flush or stop.
    input_ready: Notify,
    /// Wakes the consumer: finished items or termination.
    output_ready: Notify,
}

impl Default for OffloadShared {
    fn default() -> Self {
        Self {
            state: Mutex::new(OffloadState {
                incoming: IncomingQueue::new(),
                in_flight: HashMap::new(),
                finished: VecDeque::new(),
                lifecycle: Lifecycle::Running,
                flush_requested: false,
            }),
            input_ready: Notify::new(),
            output_ready: Notify::new(),
        }
    }
}

impl OffloadShared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn lock(&self) -> MutexGuard<'_, OffloadState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn put_incoming(&self, batch: Vec<Activity>) -> Result<(), OffloadError> {
        {
            let mut state = self.lock();
            if state.lifecycle != Lifecycle::Running {
                return Err(OffloadError::Terminated);
            }
            state.incoming.extend(batch);
        }
        self.input_ready.notify_one();
        Ok(())
    }

    /// Move up to `max` activities from incoming to in flight, oldest first.
    pub fn take_incoming(&self, max: usize) -> Vec<Activity> {
        let mut state = self.lock();
        let batch = state.incoming.pop_many(max);
        for activity in &batch {
            state.in_flight.insert(activity.id, activity.clone());
        }
        batch
    }

    /// Hand back processed activities.
    pub fn complete(&self, items: Vec<Finished>) {
        if items.is_empty() {
            return;
        }
        {
            let mut state = self.lock();
            for item in items {
                state.in_flight.remove(&item.activity.id);
                state.finished.push_back(item);
            }
        }
        self.output_ready.notify_one();
    }

    /// Return in-flight activities to the incoming queue.
    pub fn requeue(&self, ids: &[i64]) {
        let mut state = self.lock();
        for id in ids {
            if let Some(activity) = state.in_flight.remove(id) {
                state.incoming.push(activity);
            }
        }
        drop(state);
        self.input_ready.notify_one();
    }

    pub fn get_finished(&self, max: usize) -> Vec<Finished> {
        let mut state = self.lock();
        let n = max.min(state.finished.len());
        state.finished.drain(..n).collect()
    }

    pub async fn wait_finished(&self) {
        loop {
            {
                let state = self.lock();
                if !state.finished.is_empty() || matches!(state.lifecycle, Lifecycle::Terminated { .. })
                {
                    return;
                }
            }
            self.output_ready.notified().await;
        }
    }

    /// Wait for new input, a flush or a stop request.
    pub async fn wait_input(&self) {
        self.input_ready.notified().await;
    }

    pub fn flush(&self) {
        self.lock().flush_requested = true;
        self.input_ready.notify_one();
    }

    /// Consume a pending flush request.
    pub fn take_flush(&self) -> bool {
        std::mem::take(&mut self.lock().flush_requested)
    }

    pub fn stop(&self) {
        {
            let mut state = self.lock();
            if state.lifecycle == Lifecycle::Running {
                state.lifecycle = Lifecycle::Stopping;
            }
        }
        self.input_ready.notify_one();
    }

    pub fn is_stopping(&self) -> bool {
        self.lock().lifecycle == Lifecycle::Stopping
    }

    pub fn terminate(&self, error: Option<String>) {
        {
            let mut state = self.lock();
            if matches!(state.lifecycle, Lifecycle::Terminated { .. }) {
                return;
            }
            if let Some(message) = &error {
                tracing::error!("Offload instance terminated: {message}");
            }
            state.lifecycle = Lifecycle::Terminated { error };
        }
        self.output_ready.notify_one();
    }

    pub fn drain_all(&self) -> Vec<Activity> {
        let mut state = self.lock();
        let mut all: Vec<Activity> = state.in_flight.drain().map(|(_, a)| a).collect();
        all.extend(state.incoming.drain());
        all.sort_by_key(|a| a.ts);
        all
    }

    pub fn pending(&self) -> usize {
        let state = self.lock();
        state.incoming.len() + state.in_flight.len()
    }

    pub fn has_buffered_input(&self) -> bool {
        !self.lock().incoming.is_empty()
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self.lock().lifecycle, Lifecycle::Terminated { .. })
    }

    pub fn terminal_error(&self) -> Option<String> {
        match &self.lock().lifecycle {
            Lifecycle::Terminated { error } => error.clone(),
            _ => None,
        }
    }
}

/// An offload instance: shared queues plus the driver task working on them.
///
/// Dropping the handle aborts the driver.
pub struct OffloadHandle {
    shared: Arc<OffloadShared>,
    driver: tokio::task::JoinHandle<()>,
}

impl OffloadHandle {
    /// Spawn `driver` over `shared`.
    pub fn spawn<F>(shared: Arc<OffloadShared>, driver: F) -> Arc<Self>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        Arc::new(Self {
            shared,
            driver: tokio::spawn(driver),
        })
    }
}

impl Drop for OffloadHandle {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

#[async_trait]
impl OffloadProcessor for OffloadHandle {
    fn put_incoming(&self, batch: Vec<Activity>) -> Result<(), OffloadError> {
        self.shared.put_incoming(batch)
    }

    fn get_finished(&self, max: usize) -> Vec<Finished> {
        self.shared.get_finished(max)
    }

    async fn wait_finished(&self) {
        self.shared.wait_finished().await
    }

    fn flush(&self) {
        self.shared.flush()
    }

    fn stop(&self) {
        self.shared.stop()
    }

    fn drain_all(&self) -> Vec<Activity> {
        self.shared.drain_all()
    }

    fn pending(&self) -> usize {
        self.shared.pending()
    }

    fn has_buffered_input(&self) -> bool {
        self.shared.has_buffered_input()
    }

    fn is_terminated(&self) -> bool {
        self.shared.is_terminated()
    }

    fn terminal_error(&self) -> Option<String> {
        self.shared.terminal_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::prelude::ActivityKind;

    fn activity(id: i64, ts: i64) -> Activity {
        Activity::new(id, 1, ts, ActivityKind::Ride, "a")
    }

    #[test]
    fn take_incoming_moves_oldest_first_into_flight() {
        let shared = OffloadShared::new();
        shared
            .put_incoming(vec![activity(1, 300), activity(2, 100), activity(3, 200)])
            .unwrap();

        let batch = shared.take_incoming(2);
        assert_eq!(batch.iter().map(|a| a.id).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(shared.pending(), 3);
        assert!(shared.has_buffered_input());

        shared.complete(vec![Finished {
            activity: batch[0].clone(),
            outcome: ItemOutcome::Done,
        }]);
        assert_eq!(shared.pending(), 2);
        assert_eq!(shared.get_finished(10).len(), 1);
    }

    #[test]
    fn stopped_instance_rejects_input_and_drains() {
        let shared = OffloadShared::new();
        shared.put_incoming(vec![activity(1, 10)]).unwrap();
        let _ = shared.take_incoming(1);
        shared.put_incoming(vec![activity(2, 5)]).unwrap();

        shared.stop();
        assert!(matches!(
            shared.put_incoming(vec![activity(3, 1)]),
            Err(OffloadError::Terminated)
        ));

        shared.terminate(Some("worker crashed".into()));
        assert!(shared.is_terminated());
        assert_eq!(shared.terminal_error().as_deref(), Some("worker crashed"));
        let drained: Vec<i64> = shared.drain_all().iter().map(|a| a.id).collect();
        assert_eq!(drained, vec![2, 1]);
        assert_eq!(shared.pending(), 0);
    }

    #[tokio::test]
    async fn wait_finished_wakes_on_completion_and_termination() {
        let shared = OffloadShared::new();
        let waiter = {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move { shared.wait_finished().await })
        };
        shared.complete(vec![Finished {
            activity: activity(1, 1),
            outcome: ItemOutcome::Failed("bad data".into()),
        }]);
        waiter.await.unwrap();

        let _ = shared.get_finished(1);
        shared.terminate(None);
        shared.wait_finished().await;
    }

    #[test]
    fn requeue_returns_items_to_incoming() {
        let shared = OffloadShared::new();
        shared.put_incoming(vec![activity(1, 10), activity(2, 20)]).unwrap();
        let batch = shared.take_incoming(2);
        assert!(!shared.has_buffered_input());
        shared.requeue(&[batch[1].id]);
        assert!(shared.has_buffered_input());
        assert_eq!(shared.pending(), 2);
        assert!(!shared.take_flush());
        shared.flush();
        assert!(shared.take_flush());
    }
}
