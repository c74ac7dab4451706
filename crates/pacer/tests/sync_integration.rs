//! Integration tests for sync jobs, the manager and the supervisor.
//!
//! Every test runs against a `MemoryStore` and a scripted feed, and is bounded by
//! a timeout so a hang shows up as a failure instead of a stuck test run.
//!
//! Key scenarios tested:
//! - Discovery, stream fetch and local processing in one job
//! - Incremental reruns stop at known pages and skip satisfied work
//! - Peer bucket scanning records the proven feed boundary
//! - Cancellation resolves the job and stops network calls
//! - Concurrency ceiling, refresh collapse and manual invalidation
//! - Timed-out jobs are requeued with their options; panicking jobs free their slot
//! - A failing manifest does not starve its siblings or the rest of the job

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use pacer::feed::{self, ActivityFeed, FeedActivity, FeedEntry, FeedError, MonthBucket};
use pacer::manifest::{InlineProcessor, Manifest, ManifestRegistry, ProcessorContext, ProcessorError};
use pacer::offload::{PoolFactory, PoolJob, WorkItem, WorkerTask};
use pacer::retry::RetryConfig;
use pacer::store::{MemoryStore, Store};
use pacer::sync::{
    JobStatus, OffloadConfig, RefreshOptions, SyncConfig, SyncContext, SyncJob, SyncManager, SyncSupervisor,
};
use pacer::{Activity, ActivityKind, StreamSet, Subject, SyncCategory, SyncErrorKind};

/// Upper bound for any single scenario.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

const BASE_TS: i64 = 1_700_000_000_000;
const DAY_MS: i64 = 86_400_000;

// ─── Scripted Feed ───────────────────────────────────────────────────────────

#[derive(Default)]
struct MockFeed {
    activities: Mutex<BTreeMap<i64, Vec<FeedActivity>>>,
    missing: Mutex<HashSet<i64>>,
    unauthorized: AtomicBool,
    block_streams: AtomicBool,
    connectivity_delay_ms: u64,
    page_calls: AtomicUsize,
    stream_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockFeed {
    fn with_delay(delay_ms: u64) -> Self {
        Self {
            connectivity_delay_ms: delay_ms,
            ..Self::default()
        }
    }

    fn add(&self, subject_id: i64, activity: FeedActivity) {
        let mut all = self.activities.lock().unwrap();
        let list = all.entry(subject_id).or_default();
        list.retain(|a| a.id != activity.id);
        list.push(activity);
    }

    fn mark_missing(&self, activity_id: i64) {
        self.missing.lock().unwrap().insert(activity_id);
    }

    fn subject_activities(&self, subject_id: i64) -> Vec<FeedActivity> {
        let mut list = self
            .activities
            .lock()
            .unwrap()
            .get(&subject_id)
            .cloned()
            .unwrap_or_default();
        list.sort_by_key(|a| std::cmp::Reverse(a.ts));
        list
    }
}

#[async_trait]
impl ActivityFeed for MockFeed {
    async fn check_connectivity(&self) -> feed::Result<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if self.connectivity_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.connectivity_delay_ms)).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    async fn fetch_self_page(&self, subject_id: i64, before: Option<i64>) -> feed::Result<Vec<FeedEntry>> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .subject_activities(subject_id)
            .into_iter()
            .filter(|a| before.is_none_or(|b| a.ts < b))
            .take(2)
            .map(|a| FeedEntry {
                cursor: a.ts,
                activity: Some(a),
            })
            .collect())
    }

    async fn fetch_peer_bucket(&self, subject_id: i64, bucket: MonthBucket) -> feed::Result<Vec<FeedActivity>> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .subject_activities(subject_id)
            .into_iter()
            .filter(|a| MonthBucket::containing(a.ts) == bucket)
            .collect())
    }

    async fn fetch_streams(&self, activity_id: i64, names: &[String]) -> feed::Result<StreamSet> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        if self.block_streams.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.unauthorized.load(Ordering::SeqCst) {
            return Err(FeedError::Unauthorized);
        }
        if self.missing.lock().unwrap().contains(&activity_id) {
            return Err(FeedError::not_found(format!("streams/{activity_id}")));
        }
        let mut set = StreamSet::new();
        for name in names {
            set.insert(name.clone(), vec![200.0, 250.0, 300.0]);
        }
        Ok(set)
    }

    async fn fetch_summary(&self, _activity_id: i64) -> feed::Result<serde_json::Value> {
        Ok(json!({"moving_time": 3600}))
    }
}

// ─── Processors ──────────────────────────────────────────────────────────────

/// Counts stream samples; refuses activities named "bad".
struct SampleCounter {
    runs: AtomicUsize,
}

#[async_trait]
impl InlineProcessor for SampleCounter {
    async fn process(&self, ctx: &mut ProcessorContext<'_>) -> Result<(), ProcessorError> {
        self.runs.fetch_add(ctx.activities.len(), Ordering::SeqCst);
        let store = ctx.store;
        for i in 0..ctx.activities.len() {
            let id = ctx.activities[i].id;
            if ctx.activities[i].name == "bad" {
                ctx.record_error(id, "bad activity");
                continue;
            }
            let samples = store
                .get_streams(id)
                .await?
                .and_then(|s| s.get("watts").map(<[f64]>::len))
                .unwrap_or(0);
            ctx.activities[i].set_stats_section("sample-count", json!({ "samples": samples }));
        }
        Ok(())
    }
}

/// Fails every activity it is given.
struct Rejecting;

#[async_trait]
impl InlineProcessor for Rejecting {
    async fn process(&self, ctx: &mut ProcessorContext<'_>) -> Result<(), ProcessorError> {
        let ids: Vec<i64> = ctx.activities.iter().map(|a| a.id).collect();
        for id in ids {
            ctx.record_error(id, "rejected");
        }
        Ok(())
    }
}

/// Counts its runs, then panics.
struct Exploding {
    runs: AtomicUsize,
}

#[async_trait]
impl InlineProcessor for Exploding {
    async fn process(&self, _ctx: &mut ProcessorContext<'_>) -> Result<(), ProcessorError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        panic!("processor blew up");
    }
}

/// Worker task that outlives any sensible call timeout.
struct Sluggish;

impl WorkerTask for Sluggish {
    fn process(&mut self, _item: &WorkItem) -> Result<serde_json::Value, String> {
        std::thread::sleep(Duration::from_millis(300));
        Ok(serde_json::Value::Null)
    }
}

struct SluggishJob;

#[async_trait]
impl PoolJob for SluggishJob {
    type Task = Sluggish;

    fn task(&self) -> Sluggish {
        Sluggish
    }

    async fn prepare(&self, _store: &dyn Store, _activity: &Activity) -> Result<serde_json::Value, String> {
        Ok(serde_json::Value::Null)
    }

    fn apply(&self, _activity: &mut Activity, _output: serde_json::Value) {}
}

// ─── Fixtures ────────────────────────────────────────────────────────────────

fn remote(id: i64, ts: i64, name: &str) -> FeedActivity {
    FeedActivity {
        id,
        ts,
        kind: "Ride".to_string(),
        name: name.to_string(),
        summary: json!({"distance": 1000.0 * id as f64}),
    }
}

fn registry(counter: Arc<SampleCounter>) -> Arc<ManifestRegistry> {
    let mut registry = ManifestRegistry::new();
    registry
        .register(Manifest::remote("streams", 1, &["watts"]))
        .unwrap();
    registry
        .register(Manifest::inline("sample-count", 1, counter).depends_on(&["streams"]))
        .unwrap();
    Arc::new(registry)
}

fn counter() -> Arc<SampleCounter> {
    Arc::new(SampleCounter {
        runs: AtomicUsize::new(0),
    })
}

fn config() -> SyncConfig {
    SyncConfig {
        rate_limits: Vec::new(),
        max_concurrent_jobs: 2,
        ..SyncConfig::default()
    }
}

fn context(store: Arc<MemoryStore>, feed: Arc<MockFeed>, registry: Arc<ManifestRegistry>, config: SyncConfig) -> SyncContext {
    SyncContext::builder()
        .store(store)
        .feed(feed)
        .registry(registry)
        .config(config)
        .retry(RetryConfig::new(Duration::from_millis(1), Duration::from_millis(5), 2))
        .build()
        .unwrap()
}

async fn add_subject(store: &MemoryStore, id: i64, is_self: bool) {
    store
        .put_subject(&Subject::new(id, format!("subject-{id}"), is_self, 0))
        .await
        .unwrap();
}

async fn run_job(ctx: &SyncContext, subject_id: i64, options: RefreshOptions) -> pacer::sync::JobOutcome {
    let job = SyncJob::new(ctx.clone(), subject_id, options, CancellationToken::new());
    tokio::time::timeout(TEST_TIMEOUT, job.run())
        .await
        .expect("job timed out")
}

// ─── Jobs ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn self_job_discovers_fetches_and_processes() {
    let store = Arc::new(MemoryStore::new());
    let feed = Arc::new(MockFeed::default());
    let counter = counter();
    add_subject(&store, 1, true).await;
    feed.add(1, remote(10, BASE_TS, "a"));
    feed.add(1, remote(11, BASE_TS + DAY_MS, "b"));
    feed.add(1, remote(12, BASE_TS + 2 * DAY_MS, "bad"));
    feed.add(1, remote(13, BASE_TS + 3 * DAY_MS, "no streams"));
    feed.mark_missing(13);

    let ctx = context(store.clone(), feed.clone(), registry(counter.clone()), config());
    let outcome = run_job(&ctx, 1, RefreshOptions::default()).await;

    assert_eq!(outcome.status, JobStatus::Complete, "{:?}", outcome.error);
    assert_eq!(outcome.summary.discovered, 4);
    assert_eq!(outcome.summary.streams_fetched, 3);
    assert_eq!(outcome.summary.streams_missing, 1);
    assert_eq!(outcome.summary.processed, 2);
    assert_eq!(
        outcome.history.iter().map(|(s, _)| *s).collect::<Vec<_>>(),
        vec![
            JobStatus::Init,
            JobStatus::CheckingConnectivity,
            JobStatus::Discovering,
            JobStatus::Processing,
            JobStatus::Complete
        ]
    );

    let good = store.get_activity(10).await.unwrap().unwrap();
    assert_eq!(good.stats["sample-count"]["samples"], 3);
    assert_eq!(
        good.sync_state.get(SyncCategory::Local, "sample-count").unwrap().version,
        Some(1)
    );

    let bad = store.get_activity(12).await.unwrap().unwrap();
    let error = bad
        .sync_state
        .get(SyncCategory::Local, "sample-count")
        .and_then(|e| e.error.clone())
        .unwrap();
    assert_eq!(error.kind, SyncErrorKind::Processor);
    assert_eq!(error.count, 1);

    let missing = store.get_activity(13).await.unwrap().unwrap();
    let error = missing
        .sync_state
        .get(SyncCategory::Streams, "streams")
        .and_then(|e| e.error.clone())
        .unwrap();
    assert_eq!(error.kind, SyncErrorKind::NoData);
    assert!(missing.sync_state.get(SyncCategory::Local, "sample-count").is_none());
    assert_eq!(missing.summary["moving_time"], 3600);

    let subject = store.get_subject(1).await.unwrap().unwrap();
    assert!(subject.last_sync_ts.is_some());
    assert_eq!(subject.discovery_cursor, None);
    assert_eq!(
        subject.last_applied_manifest_hash,
        Some(ctx.registry.manifest_set_hash())
    );
}

#[tokio::test]
async fn rerun_stops_at_known_page_and_skips_satisfied_work() {
    let store = Arc::new(MemoryStore::new());
    let feed = Arc::new(MockFeed::default());
    let counter = counter();
    add_subject(&store, 1, true).await;
    for id in 0..5 {
        feed.add(1, remote(id, BASE_TS + id * DAY_MS, "ride"));
    }
    feed.mark_missing(0);

    let ctx = context(store.clone(), feed.clone(), registry(counter.clone()), config());
    run_job(&ctx, 1, RefreshOptions::default()).await;
    let pages = feed.page_calls.load(Ordering::SeqCst);
    let streams = feed.stream_calls.load(Ordering::SeqCst);
    let runs = counter.runs.load(Ordering::SeqCst);
    assert_eq!(streams, 5);
    assert_eq!(runs, 4);

    let outcome = run_job(&ctx, 1, RefreshOptions::default()).await;
    assert_eq!(outcome.status, JobStatus::Complete);
    assert_eq!(outcome.summary.discovered, 0);
    // One fully-known page ends discovery; the no-data activity is backing off.
    assert_eq!(feed.page_calls.load(Ordering::SeqCst), pages + 1);
    assert_eq!(feed.stream_calls.load(Ordering::SeqCst), streams);
    assert_eq!(counter.runs.load(Ordering::SeqCst), runs);
}

#[tokio::test]
async fn changed_remote_activity_is_reprocessed() {
    let store = Arc::new(MemoryStore::new());
    let feed = Arc::new(MockFeed::default());
    let counter = counter();
    add_subject(&store, 1, true).await;
    feed.add(1, remote(1, BASE_TS, "ride"));
    feed.add(1, remote(2, BASE_TS + DAY_MS, "ride"));

    let ctx = context(store.clone(), feed.clone(), registry(counter.clone()), config());
    run_job(&ctx, 1, RefreshOptions::default()).await;
    assert_eq!(counter.runs.load(Ordering::SeqCst), 2);

    feed.add(1, remote(2, BASE_TS + DAY_MS, "renamed"));
    let outcome = run_job(&ctx, 1, RefreshOptions::default()).await;

    assert_eq!(outcome.summary.updated, 1);
    assert_eq!(counter.runs.load(Ordering::SeqCst), 3);
    assert_eq!(store.get_activity(2).await.unwrap().unwrap().name, "renamed");
}

#[tokio::test]
async fn ignore_backoff_retries_no_data_once() {
    let store = Arc::new(MemoryStore::new());
    let feed = Arc::new(MockFeed::default());
    add_subject(&store, 1, true).await;
    feed.add(1, remote(1, BASE_TS, "ride"));
    feed.mark_missing(1);

    let ctx = context(store.clone(), feed.clone(), registry(counter()), config());
    run_job(&ctx, 1, RefreshOptions::default()).await;
    let options = RefreshOptions {
        skip_discovery: true,
        ignore_backoff: true,
        ..RefreshOptions::default()
    };
    let outcome = run_job(&ctx, 1, options).await;

    assert_eq!(outcome.status, JobStatus::Complete);
    assert_eq!(feed.stream_calls.load(Ordering::SeqCst), 2);
    let activity = store.get_activity(1).await.unwrap().unwrap();
    let error = activity
        .sync_state
        .get(SyncCategory::Streams, "streams")
        .and_then(|e| e.error.clone())
        .unwrap();
    assert_eq!(error.count, 2);
}

#[tokio::test]
async fn peer_job_scans_buckets_and_records_boundary() {
    let store = Arc::new(MemoryStore::new());
    let feed = Arc::new(MockFeed::default());
    add_subject(&store, 2, false).await;

    let current = MonthBucket::containing(pacer::now_ms());
    let older = current.prev().prev();
    let older_ts = Utc
        .with_ymd_and_hms(older.year, older.month, 15, 12, 0, 0)
        .unwrap()
        .timestamp_millis();
    feed.add(2, remote(20, pacer::now_ms() - 1_000, "recent"));
    feed.add(2, remote(21, older_ts, "older"));

    let mut config = config();
    config.peer_scan.initial_concurrency = 1;
    config.peer_scan.stop_after = 2;
    let ctx = context(store.clone(), feed.clone(), registry(counter()), config);
    let outcome = run_job(&ctx, 2, RefreshOptions::default()).await;

    assert_eq!(outcome.status, JobStatus::Complete, "{:?}", outcome.error);
    assert_eq!(outcome.summary.discovered, 2);
    let subject = store.get_subject(2).await.unwrap().unwrap();
    assert_eq!(subject.discovery_sentinel, Some(older.index()));
}

#[tokio::test]
async fn cancelled_job_resolves_and_stops_calling_the_feed() {
    let store = Arc::new(MemoryStore::new());
    let feed = Arc::new(MockFeed::default());
    add_subject(&store, 1, true).await;
    for id in 0..3 {
        feed.add(1, remote(id, BASE_TS + id * DAY_MS, "ride"));
    }
    feed.block_streams.store(true, Ordering::SeqCst);

    let ctx = context(store.clone(), feed.clone(), registry(counter()), config());
    let token = CancellationToken::new();
    let job = SyncJob::new(ctx, 1, RefreshOptions::default(), token.clone());
    let handle = tokio::spawn(job.run());

    tokio::time::timeout(TEST_TIMEOUT, async {
        while feed.stream_calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("stream fetch never started");
    token.cancel();

    let outcome = tokio::time::timeout(TEST_TIMEOUT, handle)
        .await
        .expect("cancelled job did not resolve")
        .unwrap();
    assert_eq!(outcome.status, JobStatus::Cancelled);
    assert!(outcome.error.is_none());

    let calls = feed.stream_calls.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(feed.stream_calls.load(Ordering::SeqCst), calls);

    let subject = store.get_subject(1).await.unwrap().unwrap();
    assert!(subject.last_sync_error.is_none());
    assert!(subject.last_sync_ts.is_none());
    // Discovered activities survive the cancellation.
    assert_eq!(store.activity_count().await, 3);
}

#[tokio::test]
async fn unauthorized_stream_fetch_fails_the_job() {
    let store = Arc::new(MemoryStore::new());
    let feed = Arc::new(MockFeed::default());
    add_subject(&store, 1, true).await;
    feed.add(1, remote(1, BASE_TS, "ride"));
    feed.unauthorized.store(true, Ordering::SeqCst);

    let ctx = context(store.clone(), feed.clone(), registry(counter()), config());
    let outcome = run_job(&ctx, 1, RefreshOptions::default()).await;

    assert_eq!(outcome.status, JobStatus::Error);
    assert_eq!(outcome.error.as_deref(), Some("Unauthorized"));
    let subject = store.get_subject(1).await.unwrap().unwrap();
    assert!(subject.last_sync_error_ts.is_some());
    assert!(subject.last_sync_ts.is_none());
}

#[tokio::test]
async fn missing_subject_ends_in_error() {
    let store = Arc::new(MemoryStore::new());
    let feed = Arc::new(MockFeed::default());
    let ctx = context(store, feed.clone(), registry(counter()), config());

    let outcome = run_job(&ctx, 99, RefreshOptions::default()).await;
    assert_eq!(outcome.status, JobStatus::Error);
    assert_eq!(feed.page_calls.load(Ordering::SeqCst), 0);
}

// ─── Manager ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn manager_never_exceeds_concurrency_ceiling() {
    let store = Arc::new(MemoryStore::new());
    let feed = Arc::new(MockFeed::with_delay(30));
    for id in 1..=5 {
        add_subject(&store, id, true).await;
        feed.add(id, remote(id * 100, BASE_TS, "ride"));
    }

    let ctx = context(store.clone(), feed.clone(), registry(counter()), config());
    let manager = Arc::new(SyncManager::from_context(ctx));
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn({
        let manager = Arc::clone(&manager);
        let shutdown = shutdown.clone();
        async move { manager.run(shutdown).await }
    });

    tokio::time::timeout(TEST_TIMEOUT, async {
        loop {
            let subjects = store.list_subjects().await.unwrap();
            if subjects.iter().all(|s| s.last_sync_ts.is_some()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("not every subject was synced");

    shutdown.cancel();
    tokio::time::timeout(TEST_TIMEOUT, handle)
        .await
        .expect("manager did not stop")
        .unwrap();
    assert!(feed.max_in_flight.load(Ordering::SeqCst) <= 2);
    assert!(manager.running().is_empty());
}

#[tokio::test]
async fn overlapping_refresh_requests_collapse_to_latest() {
    let store = Arc::new(MemoryStore::new());
    let feed = Arc::new(MockFeed::default());
    let manager = SyncManager::from_context(context(store, feed, registry(counter()), config()));

    manager.request_refresh(1, RefreshOptions::default());
    let latest = RefreshOptions {
        full_discovery: true,
        ..RefreshOptions::default()
    };
    manager.request_refresh(1, latest);

    assert_eq!(manager.pending(), vec![(1, latest)]);
}

#[tokio::test]
async fn invalidate_clears_state_and_requests_reprocessing() {
    let store = Arc::new(MemoryStore::new());
    let feed = Arc::new(MockFeed::default());
    let counter = counter();
    add_subject(&store, 1, true).await;
    feed.add(1, remote(1, BASE_TS, "ride"));
    feed.add(1, remote(2, BASE_TS + DAY_MS, "ride"));

    let manager = SyncManager::from_context(context(
        store.clone(),
        feed.clone(),
        registry(counter.clone()),
        config(),
    ));
    let outcome = manager
        .run_once(1, RefreshOptions::default())
        .await
        .unwrap();
    assert!(outcome.is_complete());

    let changed = manager
        .invalidate(1, SyncCategory::Local, Some("sample-count"))
        .await
        .unwrap();
    assert_eq!(changed, 2);
    let activity = store.get_activity(1).await.unwrap().unwrap();
    assert!(activity.sync_state.get(SyncCategory::Local, "sample-count").is_none());
    assert!(activity.sync_state.get(SyncCategory::Streams, "streams").is_some());

    let (subject_id, options) = manager.pending()[0];
    assert_eq!(subject_id, 1);
    assert!(options.skip_discovery);

    manager.run_once(1, options).await.unwrap();
    assert_eq!(counter.runs.load(Ordering::SeqCst), 4);
    assert_eq!(feed.stream_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn invalidate_rejects_unknown_manifest() {
    let store = Arc::new(MemoryStore::new());
    add_subject(&store, 1, true).await;
    let manager = SyncManager::from_context(context(
        store,
        Arc::new(MockFeed::default()),
        registry(counter()),
        config(),
    ));

    let err = manager
        .invalidate(1, SyncCategory::Streams, Some("sample-count"))
        .await
        .unwrap_err();
    assert!(matches!(err, pacer::sync::ManagerError::UnknownManifest { .. }));
}

#[tokio::test]
async fn job_timeout_cancels_the_job() {
    let store = Arc::new(MemoryStore::new());
    let feed = Arc::new(MockFeed::default());
    add_subject(&store, 1, true).await;
    feed.add(1, remote(1, BASE_TS, "ride"));
    feed.block_streams.store(true, Ordering::SeqCst);

    let mut config = config();
    config.job_timeout_ms = 50;
    let manager = SyncManager::from_context(context(store, feed, registry(counter()), config));

    let outcome = tokio::time::timeout(TEST_TIMEOUT, manager.run_once(1, RefreshOptions::default()))
        .await
        .expect("timeout did not cancel the job")
        .unwrap();
    assert_eq!(outcome.status, JobStatus::Cancelled);
    assert!(manager.running().is_empty());
    assert_eq!(manager.pending(), vec![(1, RefreshOptions::default())]);
}

#[tokio::test]
async fn timed_out_job_reruns_with_its_original_options() {
    let store = Arc::new(MemoryStore::new());
    let feed = Arc::new(MockFeed::default());
    let mut subject = Subject::new(1, "subject-1", true, 0);
    subject.last_sync_ts = Some(pacer::now_ms());
    store.put_subject(&subject).await.unwrap();
    store
        .put_activities(&[Activity::new(1, 1, BASE_TS, ActivityKind::Ride, "ride")])
        .await
        .unwrap();
    feed.block_streams.store(true, Ordering::SeqCst);

    let mut config = config();
    config.job_timeout_ms = 50;
    let manager = Arc::new(SyncManager::from_context(context(
        store,
        feed.clone(),
        registry(counter()),
        config,
    )));
    let skip = RefreshOptions {
        skip_discovery: true,
        ..RefreshOptions::default()
    };
    manager.request_refresh(1, skip);

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn({
        let manager = Arc::clone(&manager);
        let shutdown = shutdown.clone();
        async move { manager.run(shutdown).await }
    });

    tokio::time::timeout(TEST_TIMEOUT, async {
        while feed.stream_calls.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed-out job was not rerun");

    shutdown.cancel();
    tokio::time::timeout(TEST_TIMEOUT, handle)
        .await
        .expect("manager did not stop")
        .unwrap();
    // Both runs skipped discovery.
    assert_eq!(feed.page_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn panicking_job_frees_its_slot_and_records_the_error() {
    let store = Arc::new(MemoryStore::new());
    let feed = Arc::new(MockFeed::default());
    add_subject(&store, 1, true).await;
    feed.add(1, remote(1, BASE_TS, "ride"));

    let exploding = Arc::new(Exploding {
        runs: AtomicUsize::new(0),
    });
    let mut registry = ManifestRegistry::new();
    registry
        .register(Manifest::remote("streams", 1, &["watts"]))
        .unwrap();
    registry
        .register(Manifest::inline("exploding", 1, exploding.clone()).depends_on(&["streams"]))
        .unwrap();
    let manager = Arc::new(SyncManager::from_context(context(
        store.clone(),
        feed,
        Arc::new(registry),
        config(),
    )));

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn({
        let manager = Arc::clone(&manager);
        let shutdown = shutdown.clone();
        async move { manager.run(shutdown).await }
    });

    tokio::time::timeout(TEST_TIMEOUT, async {
        loop {
            let subject = store.get_subject(1).await.unwrap().unwrap();
            if subject.last_sync_error_ts.is_some() && manager.running().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("panicked job was never released");

    let subject = store.get_subject(1).await.unwrap().unwrap();
    assert!(subject.last_sync_error.unwrap().contains("processor blew up"));
    assert_eq!(exploding.runs.load(Ordering::SeqCst), 1);

    // The subject is schedulable again.
    manager.request_refresh(1, RefreshOptions::default());
    tokio::time::timeout(TEST_TIMEOUT, async {
        while exploding.runs.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("subject stayed stuck after a panic");

    shutdown.cancel();
    tokio::time::timeout(TEST_TIMEOUT, handle)
        .await
        .expect("manager did not stop")
        .unwrap();
}

#[tokio::test]
async fn failing_manifest_does_not_starve_siblings_when_ignoring_backoff() {
    let store = Arc::new(MemoryStore::new());
    let feed = Arc::new(MockFeed::default());
    add_subject(&store, 1, true).await;
    for id in 1..=3 {
        feed.add(1, remote(id, BASE_TS + id * DAY_MS, "ride"));
    }

    let counter = counter();
    let mut registry = ManifestRegistry::new();
    registry
        .register(Manifest::remote("streams", 1, &["watts"]))
        .unwrap();
    registry
        .register(Manifest::inline("rejecting", 1, Arc::new(Rejecting)).depends_on(&["streams"]))
        .unwrap();
    registry
        .register(Manifest::inline("sample-count", 1, counter.clone()).depends_on(&["streams"]))
        .unwrap();
    let ctx = context(store.clone(), feed, Arc::new(registry), config());

    let outcome = run_job(
        &ctx,
        1,
        RefreshOptions {
            ignore_backoff: true,
            ..RefreshOptions::default()
        },
    )
    .await;
    assert_eq!(outcome.status, JobStatus::Complete);
    assert_eq!(counter.runs.load(Ordering::SeqCst), 3);

    for activity in store.activities_for_subject(1).await.unwrap() {
        let rejected = activity.sync_state.get(SyncCategory::Local, "rejecting").unwrap();
        assert_eq!(rejected.error.as_ref().unwrap().message, "rejected");
        assert_eq!(activity.stats["sample-count"]["samples"], 3);
    }
}

#[tokio::test]
async fn offload_worker_timeout_fails_its_activities_not_the_job() {
    let store = Arc::new(MemoryStore::new());
    let feed = Arc::new(MockFeed::default());
    add_subject(&store, 1, true).await;
    for id in 1..=3 {
        feed.add(1, remote(id, BASE_TS + id * DAY_MS, "ride"));
    }

    let mut registry = ManifestRegistry::new();
    registry
        .register(Manifest::remote("streams", 1, &["watts"]))
        .unwrap();
    registry
        .register(
            Manifest::offloaded("sluggish", 1, Arc::new(PoolFactory::new(SluggishJob)))
                .depends_on(&["streams"]),
        )
        .unwrap();
    let mut config = config();
    config.offload = OffloadConfig {
        max_workers: 1,
        worker_capacity: 3,
        call_timeout_ms: 20,
        ..OffloadConfig::default()
    };
    let ctx = context(store.clone(), feed, Arc::new(registry), config);

    let outcome = run_job(&ctx, 1, RefreshOptions::default()).await;
    assert_eq!(outcome.status, JobStatus::Complete);
    assert!(outcome.error.is_none());

    let activities = store.activities_for_subject(1).await.unwrap();
    assert_eq!(activities.len(), 3);
    for activity in activities {
        let entry = activity.sync_state.get(SyncCategory::Local, "sluggish").unwrap();
        assert_eq!(entry.version, None);
        let error = entry.error.as_ref().unwrap();
        assert_eq!(error.kind, SyncErrorKind::Offload);
        assert!(error.message.contains("timed out"));
    }
}

#[tokio::test]
async fn remove_subject_deletes_activities() {
    let store = Arc::new(MemoryStore::new());
    let feed = Arc::new(MockFeed::default());
    add_subject(&store, 1, true).await;
    feed.add(1, remote(1, BASE_TS, "ride"));
    let manager = SyncManager::from_context(context(store.clone(), feed, registry(counter()), config()));
    manager.run_once(1, RefreshOptions::default()).await.unwrap();

    assert_eq!(manager.remove_subject(1).await.unwrap(), 1);
    assert!(store.get_subject(1).await.unwrap().is_none());
    assert_eq!(store.activity_count().await, 0);
}

// ─── Supervisor ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn supervisor_keeps_same_owner_and_replaces_on_change() {
    let store = Arc::new(MemoryStore::new());
    let feed = Arc::new(MockFeed::default());
    let make = || {
        Arc::new(SyncManager::from_context(context(
            store.clone(),
            feed.clone(),
            registry(counter()),
            config(),
        )))
    };
    let supervisor = SyncSupervisor::new();

    assert!(supervisor.start(1, make()).await);
    assert!(!supervisor.start(1, make()).await);
    assert_eq!(supervisor.current_owner().await, Some(1));

    assert!(supervisor.start(2, make()).await);
    assert_eq!(supervisor.current_owner().await, Some(2));

    assert!(tokio::time::timeout(TEST_TIMEOUT, supervisor.stop()).await.unwrap());
    assert_eq!(supervisor.current_owner().await, None);
    assert!(!supervisor.stop().await);
}
