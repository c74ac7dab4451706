//! Local-processing stage.
//!
//! Rounds pull up to `batch_limit` activities from the queue, add whatever the
//! offload instances finished, group everything by the next runnable local
//! manifest and dispatch each group inline or to an offload instance. Activities
//! that ran inline go round again until nothing is runnable for them. Every round
//! ends with one batch write and one progress notification, and grows the batch
//! window up to its ceiling.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::select_all;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::error::TryRecvError;

use crate::entity::prelude::{Activity, Subject, SyncCategory, SyncErrorKind};
use crate::manifest::{InlineProcessor, Manifest, ManifestKind, ProcessorContext, ProcessorError};
use crate::offload::{ItemOutcome, OffloadContext, OffloadFactory, OffloadProcessor};
use crate::sync::cancel::{Cancelled, race};
use crate::sync::events::LogLevel;

use super::progress::JobProgress;
use super::{JobError, SyncJob};

/// Counters of one local stage.
#[derive(Debug, Default)]
pub(super) struct LocalStats {
    pub processed: usize,
    pub errors: usize,
}

struct Instance {
    processor: Arc<dyn OffloadProcessor>,
    stopping: bool,
}

enum Wake {
    Input(Activity),
    Closed,
    Finished,
}

struct Scheduler<'a> {
    job: &'a SyncJob,
    subject: &'a Subject,
    progress: &'a JobProgress,
    enforce_backoff: bool,
    batch_limit: usize,
    closed: bool,
    /// Activities that go round again.
    carry: Vec<Activity>,
    /// Offload instances by manifest name.
    instances: HashMap<String, Vec<Instance>>,
    /// Manifests already run per activity in this job, so a failing manifest whose
    /// backoff is ignored does not spin.
    attempted: HashMap<i64, HashSet<String>>,
    /// Mutated activities to write at the end of the round.
    touched: Vec<Activity>,
    stats: LocalStats,
}

impl SyncJob {
    pub(super) async fn local_stage(
        &self,
        subject: &Subject,
        mut input: UnboundedReceiver<Activity>,
        progress: &JobProgress,
    ) -> Result<LocalStats, JobError> {
        let mut scheduler = Scheduler {
            job: self,
            subject,
            progress,
            enforce_backoff: !self.options.ignore_backoff,
            batch_limit: self.ctx.config.batch_limit.max(1),
            closed: false,
            carry: Vec::new(),
            instances: HashMap::new(),
            attempted: HashMap::new(),
            touched: Vec::new(),
            stats: LocalStats::default(),
        };
        let result = scheduler.run(&mut input).await;
        scheduler.shutdown();
        result?;
        Ok(scheduler.stats)
    }
}

impl Scheduler<'_> {
    async fn run(&mut self, input: &mut UnboundedReceiver<Activity>) -> Result<(), JobError> {
        loop {
            let mut batch = std::mem::take(&mut self.carry);
            self.pull(input, &mut batch);
            self.collect_offloaded(&mut batch);

            if batch.is_empty() {
                self.persist().await?;
                self.idle();
                if self.closed && self.instances.is_empty() {
                    return Ok(());
                }
                match self.wait(input).await? {
                    Wake::Input(activity) => self.carry.push(activity),
                    Wake::Closed => self.closed = true,
                    Wake::Finished => {}
                }
                continue;
            }

            self.round(batch).await?;
            self.persist().await?;
            self.progress.emit(self.job.ctx.observer.as_ref());
            self.batch_limit = self.job.ctx.config.grow_batch(self.batch_limit);
        }
    }

    /// Take queued activities until the batch window is full.
    fn pull(&mut self, input: &mut UnboundedReceiver<Activity>, batch: &mut Vec<Activity>) {
        while !self.closed && batch.len() < self.batch_limit {
            match input.try_recv() {
                Ok(activity) => batch.push(activity),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => self.closed = true,
            }
        }
    }

    /// Fold finished offload results into the batch, and fail everything held by
    /// instances that terminated with an error.
    fn collect_offloaded(&mut self, batch: &mut Vec<Activity>) {
        let registry = &self.job.ctx.registry;
        let now = crate::now_ms();
        for (name, instances) in &mut self.instances {
            let Some(manifest) = registry.get(name).cloned() else {
                continue;
            };
            let mut alive = Vec::with_capacity(instances.len());
            for instance in instances.drain(..) {
                // Checked first: nothing completes after termination.
                let terminated = instance.processor.is_terminated();
                for finished in instance.processor.get_finished(usize::MAX) {
                    let mut activity = finished.activity;
                    match finished.outcome {
                        ItemOutcome::Done => {
                            registry.record_success(&mut activity.sync_state, &manifest, now);
                            self.stats.processed += 1;
                        }
                        ItemOutcome::Failed(message) => {
                            registry.record_error(
                                &mut activity.sync_state,
                                &manifest,
                                message,
                                SyncErrorKind::Processor,
                                now,
                            );
                            self.stats.errors += 1;
                            self.progress.errored(1);
                        }
                    }
                    batch.push(activity);
                }

                if !terminated {
                    alive.push(instance);
                    continue;
                }
                let leftovers = instance.processor.drain_all();
                match instance.processor.terminal_error() {
                    Some(message) => {
                        if !leftovers.is_empty() {
                            tracing::warn!(
                                subject = self.subject.id,
                                manifest = %name,
                                items = leftovers.len(),
                                "Offload instance failed: {message}"
                            );
                        }
                        for mut activity in leftovers {
                            registry.record_error(
                                &mut activity.sync_state,
                                &manifest,
                                message.clone(),
                                SyncErrorKind::Offload,
                                now,
                            );
                            self.stats.errors += 1;
                            self.progress.errored(1);
                            batch.push(activity);
                        }
                    }
                    // A graceful stop leaves nothing behind; anything that
                    // slipped in is dispatched again.
                    None => batch.extend(leftovers),
                }
            }
            *instances = alive;
        }
        self.instances.retain(|_, instances| !instances.is_empty());
    }

    /// Group the batch by next runnable manifest and dispatch every group.
    async fn round(&mut self, batch: Vec<Activity>) -> Result<(), JobError> {
        let registry = Arc::clone(&self.job.ctx.registry);
        let now = crate::now_ms();
        let mut groups: Vec<(Arc<Manifest>, Vec<Activity>)> = Vec::new();

        for activity in batch {
            let next = match self.attempted.get(&activity.id) {
                Some(done) => registry.next_runnable_excluding(
                    &activity.sync_state,
                    SyncCategory::Local,
                    self.enforce_backoff,
                    now,
                    done,
                ),
                None => registry.next_runnable(&activity.sync_state, SyncCategory::Local, self.enforce_backoff, now),
            };
            match next {
                Some(manifest) => match groups.iter_mut().find(|(m, _)| m.name == manifest.name) {
                    Some((_, group)) => group.push(activity),
                    None => groups.push((manifest, vec![activity])),
                },
                None => {
                    self.attempted.remove(&activity.id);
                    self.progress.completed();
                    self.touched.push(activity);
                }
            }
        }

        for (manifest, group) in groups {
            for activity in &group {
                self.attempted
                    .entry(activity.id)
                    .or_default()
                    .insert(manifest.name.clone());
            }
            match &manifest.kind {
                ManifestKind::Inline(processor) => {
                    let processor = Arc::clone(processor);
                    self.run_inline(&manifest, processor.as_ref(), group).await?;
                }
                ManifestKind::Offloaded(factory) => {
                    let factory = Arc::clone(factory);
                    self.dispatch(&manifest, factory.as_ref(), group);
                }
                ManifestKind::Remote { .. } => {
                    tracing::warn!(manifest = %manifest.name, "Remote manifest registered as local, skipping");
                    self.fail_group(&manifest, group, "remote manifest in local category", SyncErrorKind::Processor);
                }
            }
        }
        Ok(())
    }

    /// Run an inline processor. Activities without a recorded error are marked done.
    async fn run_inline(
        &mut self,
        manifest: &Manifest,
        processor: &dyn InlineProcessor,
        mut group: Vec<Activity>,
    ) -> Result<(), JobError> {
        let job = self.job;
        let mut ctx = ProcessorContext::new(
            manifest,
            &mut group,
            self.subject,
            &job.cancel,
            job.ctx.store.as_ref(),
        );
        let result = race(&job.cancel, processor.process(&mut ctx)).await?;
        let errors = ctx.into_errors();

        match result {
            Ok(()) => {
                let now = crate::now_ms();
                for mut activity in group {
                    match errors.get(&activity.id) {
                        Some(message) => {
                            job.ctx.registry.record_error(
                                &mut activity.sync_state,
                                manifest,
                                message.clone(),
                                SyncErrorKind::Processor,
                                now,
                            );
                            self.stats.errors += 1;
                            self.progress.errored(1);
                        }
                        None => {
                            job.ctx
                                .registry
                                .record_success(&mut activity.sync_state, manifest, now);
                            self.stats.processed += 1;
                        }
                    }
                    self.carry.push(activity);
                }
            }
            Err(ProcessorError::Cancelled) => return Err(Cancelled.into()),
            Err(e) => {
                job.log(
                    LogLevel::Warn,
                    &format!("{} failed for {} activities: {e}", manifest.name, group.len()),
                );
                self.fail_group(manifest, group, &e.to_string(), SyncErrorKind::Processor);
            }
        }
        Ok(())
    }

    /// Hand a group to the least-loaded live instance of its manifest, creating a
    /// new instance while all are full and the ceiling allows.
    fn dispatch(&mut self, manifest: &Arc<Manifest>, factory: &dyn OffloadFactory, group: Vec<Activity>) {
        let job = self.job;
        let config = &job.ctx.config.offload;
        let capacity = factory.instance_capacity(config);
        let max = factory.max_instances(config).max(1);
        let instances = self.instances.entry(manifest.name.clone()).or_default();

        let least = instances
            .iter()
            .filter(|i| !i.stopping && !i.processor.is_terminated())
            .min_by_key(|i| i.processor.pending())
            .map(|i| Arc::clone(&i.processor));
        let live = instances.iter().filter(|i| !i.stopping).count();

        let target = match least {
            Some(processor) if processor.pending() < capacity || live >= max => processor,
            _ => {
                let ctx = OffloadContext {
                    manifest: Arc::clone(manifest),
                    subject: self.subject.clone(),
                    store: Arc::clone(&job.ctx.store),
                    config: config.clone(),
                };
                match factory.create(ctx) {
                    Ok(processor) => {
                        tracing::debug!(
                            subject = self.subject.id,
                            manifest = %manifest.name,
                            "Started offload instance"
                        );
                        instances.push(Instance {
                            processor: Arc::clone(&processor),
                            stopping: false,
                        });
                        processor
                    }
                    Err(e) => {
                        let message = e.to_string();
                        self.fail_group(manifest, group, &message, SyncErrorKind::Offload);
                        return;
                    }
                }
            }
        };

        if let Err(e) = target.put_incoming(group.clone()) {
            self.fail_group(manifest, group, &e.to_string(), SyncErrorKind::Offload);
        }
    }

    fn fail_group(&mut self, manifest: &Manifest, group: Vec<Activity>, message: &str, kind: SyncErrorKind) {
        let now = crate::now_ms();
        for mut activity in group {
            self.job.ctx.registry.record_error(
                &mut activity.sync_state,
                manifest,
                message,
                kind,
                now,
            );
            self.stats.errors += 1;
            self.progress.errored(1);
            self.carry.push(activity);
        }
    }

    /// Nothing new to schedule: flush instances holding input, stop idle ones once
    /// no more input can arrive.
    fn idle(&mut self) {
        for instances in self.instances.values_mut() {
            for instance in instances.iter_mut() {
                if instance.processor.has_buffered_input() {
                    instance.processor.flush();
                } else if self.closed && !instance.stopping && instance.processor.pending() == 0 {
                    instance.processor.stop();
                    instance.stopping = true;
                }
            }
        }
    }

    /// Wait for new input, finished offload work or cancellation.
    async fn wait(&self, input: &mut UnboundedReceiver<Activity>) -> Result<Wake, Cancelled> {
        let waits: Vec<_> = self
            .instances
            .values()
            .flatten()
            .map(|i| i.processor.wait_finished())
            .collect();
        let any_finished = async move {
            if waits.is_empty() {
                std::future::pending::<()>().await;
            } else {
                select_all(waits).await;
            }
        };

        tokio::select! {
            biased;
            _ = self.job.cancel.cancelled() => Err(Cancelled),
            received = input.recv(), if !self.closed => Ok(match received {
                Some(activity) => Wake::Input(activity),
                None => Wake::Closed,
            }),
            _ = any_finished => Ok(Wake::Finished),
        }
    }

    async fn persist(&mut self) -> Result<(), JobError> {
        if self.touched.is_empty() && self.carry.is_empty() {
            return Ok(());
        }
        let now = crate::now_ms();
        let mut writes = std::mem::take(&mut self.touched);
        writes.extend(self.carry.iter().cloned());
        for activity in &mut writes {
            activity.updated_at = now;
        }
        self.job.ctx.store.put_activities(&writes).await?;
        tracing::debug!(subject = self.subject.id, written = writes.len(), "Round persisted");
        Ok(())
    }

    /// Stop every instance still alive. Their drivers are dropped with them.
    fn shutdown(&mut self) {
        for instance in self.instances.values().flatten() {
            instance.processor.stop();
        }
        self.instances.clear();
    }
}
