//! Pool-backed offload processor.
//!
//! Incoming batches are sharded across up to `max_workers` worker threads, each
//! holding at most `worker_capacity` activities. A worker processes one batch at
//! a time; activities that do not fit wait in the incoming queue until a worker
//! frees up.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde_json::Value;

use crate::entity::prelude::Activity;
use crate::store::Store;

use super::worker::{ItemResult, WorkerClient, WorkerError};
use super::{
    Finished, ItemOutcome, OffloadContext, OffloadError, OffloadFactory, OffloadHandle,
    OffloadProcessor, OffloadShared, WorkItem, WorkerTask,
};

/// One batch to send: `size` activities to worker `worker`. Indices at or past the
/// number of existing workers mean a new worker must be spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatch {
    pub worker: usize,
    pub size: usize,
}

/// Plan batches for `pending` queued activities.
///
/// `loads` holds the in-flight count of each existing worker. Idle workers are
/// filled first, least loaded and lowest index first; new workers are added while
/// below `max_workers`. Whatever does not fit stays queued.
pub fn dispatch_plan(pending: usize, loads: &[usize], capacity: usize, max_workers: usize) -> Vec<Dispatch> {
    let capacity = capacity.max(1);
    let mut idle: Vec<(usize, usize)> = loads
        .iter()
        .enumerate()
        .filter(|(_, load)| **load == 0)
        .map(|(i, load)| (*load, i))
        .collect();
    idle.sort_unstable();
    let spawnable = max_workers.saturating_sub(loads.len());
    let candidates = idle
        .into_iter()
        .map(|(_, i)| i)
        .chain(loads.len()..loads.len() + spawnable);

    let mut remaining = pending;
    let mut plan = Vec::new();
    for worker in candidates {
        if remaining == 0 {
            break;
        }
        let size = remaining.min(capacity);
        plan.push(Dispatch { worker, size });
        remaining -= size;
    }
    plan
}

/// Work a pool-backed manifest performs.
///
/// `prepare` and `apply` run in the async driver; `Task::process` runs on a worker
/// thread with nothing but the prepared payload.
#[async_trait]
pub trait PoolJob: Send + Sync + 'static {
    type Task: WorkerTask;

    fn task(&self) -> Self::Task;

    /// Configuration sent with the start handshake.
    fn start_config(&self) -> Value {
        Value::Null
    }

    /// Build the worker payload for one activity.
    async fn prepare(&self, store: &dyn Store, activity: &Activity) -> Result<Value, String>;

    /// Write the worker's output back into the activity.
    fn apply(&self, activity: &mut Activity, output: Value);
}

/// [`OffloadFactory`] for a [`PoolJob`].
pub struct PoolFactory<J> {
    job: Arc<J>,
}

impl<J: PoolJob> PoolFactory<J> {
    pub fn new(job: J) -> Self {
        Self { job: Arc::new(job) }
    }
}

impl<J: PoolJob> OffloadFactory for PoolFactory<J> {
    fn create(&self, ctx: OffloadContext) -> Result<Arc<dyn OffloadProcessor>, OffloadError> {
        let shared = OffloadShared::new();
        let driver = drive(Arc::clone(&shared), Arc::clone(&self.job), ctx);
        Ok(OffloadHandle::spawn(shared, driver))
    }
}

enum Slot {
    Idle(WorkerClient),
    Busy(usize),
}

async fn drive<J: PoolJob>(shared: Arc<OffloadShared>, job: Arc<J>, ctx: OffloadContext) {
    let name = ctx.manifest.name.clone();
    let call_timeout = Duration::from_millis(ctx.config.call_timeout_ms);
    let stop_timeout = Duration::from_millis(ctx.config.stop_timeout_ms);
    let mut slots: Vec<Slot> = Vec::new();
    let mut calls = FuturesUnordered::new();

    loop {
        let _ = shared.take_flush();
        let loads: Vec<usize> = slots
            .iter()
            .map(|s| match s {
                Slot::Idle(_) => 0,
                Slot::Busy(n) => *n,
            })
            .collect();
        let pending = shared.lock().incoming.len();
        let plan = dispatch_plan(
            pending,
            &loads,
            ctx.config.worker_capacity,
            ctx.config.max_workers,
        );

        for dispatch in plan {
            let mut client = if dispatch.worker < slots.len() {
                match std::mem::replace(&mut slots[dispatch.worker], Slot::Busy(dispatch.size)) {
                    Slot::Idle(client) => client,
                    Slot::Busy(_) => continue,
                }
            } else {
                match spawn_worker(job.as_ref(), &name, slots.len(), call_timeout).await {
                    Ok(client) => {
                        slots.push(Slot::Busy(dispatch.size));
                        client
                    }
                    Err(e) => {
                        shared.terminate(Some(e.to_string()));
                        return;
                    }
                }
            };

            let batch = shared.take_incoming(dispatch.size);
            let mut items = Vec::with_capacity(batch.len());
            let mut sent = Vec::with_capacity(batch.len());
            let mut rejected = Vec::new();
            for activity in batch {
                match job.prepare(ctx.store.as_ref(), &activity).await {
                    Ok(payload) => {
                        items.push(WorkItem {
                            activity_id: activity.id,
                            ts: activity.ts,
                            payload,
                        });
                        sent.push(activity);
                    }
                    Err(message) => rejected.push(Finished {
                        activity,
                        outcome: ItemOutcome::Failed(message),
                    }),
                }
            }
            shared.complete(rejected);

            let worker = dispatch.worker;
            calls.push(async move {
                let result = client.process(items, call_timeout).await;
                (worker, client, sent, result)
            });
        }

        if calls.is_empty() && shared.is_stopping() && !shared.has_buffered_input() {
            for slot in &mut slots {
                if let Slot::Idle(client) = slot
                    && let Err(e) = client.stop(stop_timeout).await
                {
                    tracing::warn!(manifest = %name, "Worker did not stop cleanly: {e}");
                }
            }
            tracing::debug!(manifest = %name, workers = slots.len(), "Worker pool stopped");
            shared.terminate(None);
            return;
        }

        tokio::select! {
            Some((worker, client, batch, result)) = calls.next(), if !calls.is_empty() => {
                match result {
                    Ok(results) => {
                        shared.complete(finish_batch(job.as_ref(), batch, results));
                        slots[worker] = Slot::Idle(client);
                    }
                    Err(e) => {
                        // The worker is gone or wedged; every in-flight item fails with it.
                        shared.terminate(Some(format!("{name} worker {worker}: {e}")));
                        return;
                    }
                }
            }
            _ = shared.wait_input() => {}
        }
    }
}

async fn spawn_worker<J: PoolJob>(
    job: &J,
    name: &str,
    index: usize,
    timeout: Duration,
) -> Result<WorkerClient, WorkerError> {
    let mut client = WorkerClient::spawn(format!("{name}-worker-{index}"), job.task())?;
    client.start(job.start_config(), timeout).await?;
    tracing::debug!(manifest = %name, worker = index, "Spawned offload worker");
    Ok(client)
}

fn finish_batch<J: PoolJob>(job: &J, batch: Vec<Activity>, results: Vec<ItemResult>) -> Vec<Finished> {
    let mut by_id: std::collections::HashMap<i64, Result<Value, String>> = results
        .into_iter()
        .map(|r| (r.activity_id, r.result))
        .collect();
    batch
        .into_iter()
        .map(|mut activity| {
            let outcome = match by_id.remove(&activity.id) {
                Some(Ok(output)) => {
                    job.apply(&mut activity, output);
                    ItemOutcome::Done
                }
                Some(Err(message)) => ItemOutcome::Failed(message),
                None => ItemOutcome::Failed("worker returned no result".to_string()),
            };
            Finished { activity, outcome }
        })
        .collect()
}
