//! Running-totals offload processor.
//!
//! Totals that depend on every earlier activity (training load, cumulative
//! distance) cannot be sharded. This variant processes its input in timestamp
//! order inside one driver task and batches by a quiet period (`min_wait_ms`), a
//! latency bound (`max_wait_ms`) and a size bound (`max_batch`).
//!
//! Each processed activity stores a [`Cursor`] next to its output. The cursor of
//! the previous activity is kept in memory; stored activities that fall between
//! it and the next one are folded in before continuing. Without a cached cursor
//! the driver walks back through earlier activities until it finds a cursor
//! written by the current manifest version and config, then replays the gap as
//! zero-contribution periods.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use crate::entity::prelude::Activity;
use crate::manifest::Manifest;
use crate::store::{Store, StoreError};
use crate::sync::types::OffloadConfig;

use super::{
    Finished, ItemOutcome, OffloadContext, OffloadError, OffloadFactory, OffloadHandle,
    OffloadProcessor, OffloadShared,
};

/// One calendar day.
pub const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Activities read per walk-back page.
const WALK_PAGE: u64 = 100;

/// Walk-back gives up and starts from scratch after this many activities.
const MAX_WALK: usize = 5_000;

/// Gap periods replayed at most; longer gaps are indistinguishable from a fresh start.
const MAX_GAP_PERIODS: i64 = 3_650;

/// An order-dependent accumulation over a subject's activities.
pub trait RunningTotal: Send + Sync + 'static {
    type State: Clone + Default + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Stats section holding the output and the cursor.
    fn section(&self) -> &'static str;

    fn period_ms(&self) -> i64 {
        DAY_MS
    }

    /// What one activity adds to its period.
    fn contribution(&self, activity: &Activity) -> Result<f64, String>;

    /// Fold a finished period with total contribution `load` into the state.
    fn close_period(&self, state: &mut Self::State, load: f64);

    /// Output for an activity, given the state and the still-open period's load.
    fn output(&self, state: &Self::State, open_load: f64) -> serde_json::Map<String, Value>;
}

/// Position of a running total right after one activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor<S> {
    /// Index of the open period.
    pub period: i64,
    /// Contribution accumulated in the open period so far.
    pub open_load: f64,
    /// State at the start of the open period.
    pub state: S,
}

impl<S: Clone + Default> Cursor<S> {
    fn fresh(period: i64) -> Self {
        Self {
            period,
            open_load: 0.0,
            state: S::default(),
        }
    }
}

fn period_of<T: RunningTotal>(total: &T, ts: i64) -> i64 {
    ts.div_euclid(total.period_ms().max(1))
}

/// Move `cursor` forward to `period`, closing the open period and replaying
/// every skipped period with zero contribution.
pub fn advance<T: RunningTotal>(total: &T, cursor: &mut Cursor<T::State>, period: i64) {
    if period <= cursor.period {
        return;
    }
    total.close_period(&mut cursor.state, cursor.open_load);
    let gap = (period - cursor.period - 1).min(MAX_GAP_PERIODS);
    for _ in 0..gap {
        total.close_period(&mut cursor.state, 0.0);
    }
    cursor.period = period;
    cursor.open_load = 0.0;
}

/// The cursor stored on `activity`, if it was written by the current manifest.
pub fn stored_cursor<T: RunningTotal>(
    total: &T,
    manifest: &Manifest,
    activity: &Activity,
) -> Option<Cursor<T::State>> {
    let entry = activity.sync_state.get(manifest.category, &manifest.name)?;
    if entry.version != Some(manifest.version)
        || entry.config_hash.as_deref() != Some(manifest.config_hash.as_str())
        || entry.error.is_some()
    {
        return None;
    }
    let raw = activity.stats_section(total.section())?.get("cursor")?;
    serde_json::from_value(raw.clone()).ok()
}

struct Cached<S> {
    id: i64,
    ts: i64,
    cursor: Cursor<S>,
}

/// [`OffloadFactory`] for a [`RunningTotal`].
pub struct AggregateFactory<T> {
    total: Arc<T>,
}

impl<T: RunningTotal> AggregateFactory<T> {
    pub fn new(total: T) -> Self {
        Self {
            total: Arc::new(total),
        }
    }
}

impl<T: RunningTotal> OffloadFactory for AggregateFactory<T> {
    fn create(&self, ctx: OffloadContext) -> Result<Arc<dyn OffloadProcessor>, OffloadError> {
        let shared = OffloadShared::new();
        let driver = drive(Arc::clone(&shared), Arc::clone(&self.total), ctx);
        Ok(OffloadHandle::spawn(shared, driver))
    }

    fn instance_capacity(&self, config: &OffloadConfig) -> usize {
        config.max_batch.max(1)
    }
}

async fn drive<T: RunningTotal>(shared: Arc<OffloadShared>, total: Arc<T>, ctx: OffloadContext) {
    let min_wait = Duration::from_millis(ctx.config.min_wait_ms);
    let max_wait = Duration::from_millis(ctx.config.max_wait_ms);
    let max_batch = ctx.config.max_batch.max(1);
    let mut cache: Option<Cached<T::State>> = None;

    loop {
        if !shared.has_buffered_input() {
            if shared.is_stopping() {
                shared.terminate(None);
                return;
            }
            shared.wait_input().await;
            continue;
        }

        let first_seen = Instant::now();
        loop {
            let buffered = shared.lock().incoming.len();
            if buffered >= max_batch || shared.take_flush() || shared.is_stopping() {
                break;
            }
            let now = Instant::now();
            let deadline = (now + min_wait).min(first_seen + max_wait);
            if now >= deadline {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                _ = shared.wait_input() => {}
            }
        }

        let batch = shared.take_incoming(max_batch);
        match process_batch(total.as_ref(), &ctx, &mut cache, batch).await {
            Ok(finished) => shared.complete(finished),
            Err(e) => {
                shared.terminate(Some(format!("{}: {e}", ctx.manifest.name)));
                return;
            }
        }
    }
}

async fn process_batch<T: RunningTotal>(
    total: &T,
    ctx: &OffloadContext,
    cache: &mut Option<Cached<T::State>>,
    batch: Vec<Activity>,
) -> Result<Vec<Finished>, OffloadError> {
    let mut finished = Vec::with_capacity(batch.len());
    for mut activity in batch {
        let mut cursor = match cache.take() {
            Some(c) if activity.ts >= c.ts => match catch_up(total, ctx, c, &activity).await? {
                Some(cursor) => cursor,
                None => seed(total, ctx, &activity).await?,
            },
            _ => seed(total, ctx, &activity).await?,
        };
        advance(total, &mut cursor, period_of(total, activity.ts));

        let outcome = match total.contribution(&activity) {
            Ok(load) => {
                cursor.open_load += load;
                let mut output = total.output(&cursor.state, cursor.open_load);
                output.insert("cursor".to_string(), serde_json::to_value(&cursor).map_err(StoreError::from)?);
                activity.set_stats_section(total.section(), Value::Object(output));
                ItemOutcome::Done
            }
            Err(message) => ItemOutcome::Failed(message),
        };

        *cache = Some(Cached {
            id: activity.id,
            ts: activity.ts,
            cursor,
        });
        finished.push(Finished { activity, outcome });
    }
    Ok(finished)
}

/// Carry the cached cursor forward to `activity`, folding in every stored
/// activity that lies between the two. `None` when the gap is too long to walk.
async fn catch_up<T: RunningTotal>(
    total: &T,
    ctx: &OffloadContext,
    cached: Cached<T::State>,
    activity: &Activity,
) -> Result<Option<Cursor<T::State>>, OffloadError> {
    let mut between = Vec::new();
    let mut before = activity.ts;
    'walk: loop {
        let page = ctx
            .store
            .activities_before(ctx.subject.id, before, WALK_PAGE)
            .await?;
        for prior in &page {
            if prior.id == cached.id || prior.ts < cached.ts {
                break 'walk;
            }
            if between.len() >= MAX_WALK {
                return Ok(None);
            }
            between.push(prior.clone());
        }
        match page.last() {
            Some(oldest) if page.len() as u64 == WALK_PAGE => before = oldest.ts,
            _ => break,
        }
    }

    let mut cursor = cached.cursor;
    if !between.is_empty() {
        tracing::debug!(
            manifest = %ctx.manifest.name,
            activity = activity.id,
            folded = between.len(),
            "Folded stored activities into running total"
        );
    }
    for prior in between.iter().rev() {
        advance(total, &mut cursor, period_of(total, prior.ts));
        if let Ok(load) = total.contribution(prior) {
            cursor.open_load += load;
        }
    }
    Ok(Some(cursor))
}

/// Walk back from `activity` to the nearest valid stored cursor.
async fn seed<T: RunningTotal>(
    total: &T,
    ctx: &OffloadContext,
    activity: &Activity,
) -> Result<Cursor<T::State>, OffloadError> {
    let mut before = activity.ts;
    let mut walked = 0usize;
    while walked < MAX_WALK {
        let page = ctx
            .store
            .activities_before(ctx.subject.id, before, WALK_PAGE)
            .await?;
        for prior in &page {
            if let Some(cursor) = stored_cursor(total, &ctx.manifest, prior) {
                tracing::debug!(
                    manifest = %ctx.manifest.name,
                    activity = activity.id,
                    seed = prior.id,
                    walked = walked,
                    "Seeded running total"
                );
                return Ok(cursor);
            }
            walked += 1;
        }
        match page.last() {
            Some(oldest) if page.len() as u64 == WALK_PAGE => before = oldest.ts,
            _ => break,
        }
    }
    Ok(Cursor::fresh(period_of(total, activity.ts)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::prelude::{ActivityKind, Subject, SyncCategory};
    use crate::store::{MemoryStore, Store};
    use serde_json::json;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Count {
        days: i64,
        total: f64,
    }

    struct DailyCount;

    impl RunningTotal for DailyCount {
        type State = Count;

        fn section(&self) -> &'static str {
            "count"
        }

        fn contribution(&self, activity: &Activity) -> Result<f64, String> {
            activity.summary_f64("load").ok_or_else(|| "no load".to_string())
        }

        fn close_period(&self, state: &mut Count, load: f64) {
            state.days += 1;
            state.total += load;
        }

        fn output(&self, state: &Count, open_load: f64) -> serde_json::Map<String, Value> {
            let mut out = serde_json::Map::new();
            out.insert("total".into(), json!(state.total + open_load));
            out.insert("days".into(), json!(state.days));
            out
        }
    }

    fn activity(id: i64, day: i64, load: Option<f64>) -> Activity {
        let mut a = Activity::new(id, 1, day * DAY_MS + id, ActivityKind::Ride, "ride");
        if let Some(load) = load {
            a.summary = json!({ "load": load });
        }
        a
    }

    fn context(store: Arc<MemoryStore>, config: OffloadConfig) -> OffloadContext {
        let factory: Arc<dyn OffloadFactory> = Arc::new(AggregateFactory::new(DailyCount));
        OffloadContext {
            manifest: Arc::new(Manifest::offloaded("count", 1, factory)),
            subject: Subject::new(1, "Ada", true, 0),
            store,
            config,
        }
    }

    #[test]
    fn advance_closes_open_period_and_replays_gap() {
        let mut cursor = Cursor {
            period: 2,
            open_load: 3.0,
            state: Count { days: 2, total: 10.0 },
        };
        advance(&DailyCount, &mut cursor, 5);
        assert_eq!(cursor.period, 5);
        assert_eq!(cursor.open_load, 0.0);
        assert_eq!(cursor.state, Count { days: 5, total: 13.0 });

        // Same or earlier period is a no-op.
        advance(&DailyCount, &mut cursor, 5);
        assert_eq!(cursor.state.days, 5);
    }

    #[tokio::test]
    async fn walks_back_to_valid_seed_and_skips_stale_ones() {
        let store = Arc::new(MemoryStore::new());
        store.put_subject(&Subject::new(1, "Ada", true, 0)).await.unwrap();
        let ctx = context(Arc::clone(&store), OffloadConfig::default());

        let mut seeded = activity(1, 2, Some(3.0));
        seeded.set_stats_section(
            "count",
            json!({"cursor": {"period": 2, "open_load": 3.0, "state": {"days": 2, "total": 10.0}}}),
        );
        let entry = seeded.sync_state.entry_mut(SyncCategory::Local, "count");
        entry.version = Some(1);
        entry.config_hash = Some(ctx.manifest.config_hash.clone());

        // Newer, but written by an older manifest version: not a valid seed.
        let mut stale = activity(2, 3, Some(1.0));
        stale.set_stats_section(
            "count",
            json!({"cursor": {"period": 3, "open_load": 99.0, "state": {"days": 0, "total": 0.0}}}),
        );
        stale.sync_state.entry_mut(SyncCategory::Local, "count").version = Some(0);
        store.put_activities(&[seeded, stale]).await.unwrap();

        let mut cache = None;
        let finished = process_batch(
            &DailyCount,
            &ctx,
            &mut cache,
            vec![activity(3, 5, Some(4.0)), activity(4, 5, Some(1.0)), activity(5, 6, None)],
        )
        .await
        .unwrap();

        let out = finished[0].activity.stats_section("count").unwrap();
        assert_eq!(out["total"], json!(17.0));
        assert_eq!(out["days"], json!(5));

        // Same day accumulates in the open period.
        let out = finished[1].activity.stats_section("count").unwrap();
        assert_eq!(out["total"], json!(18.0));

        assert_eq!(finished[2].outcome, ItemOutcome::Failed("no load".into()));
        assert!(finished[2].activity.stats_section("count").is_none());
        assert_eq!(cache.unwrap().ts, finished[2].activity.ts);
    }

    #[tokio::test]
    async fn stored_activities_between_batch_items_are_folded_in() {
        let store = Arc::new(MemoryStore::new());
        store.put_subject(&Subject::new(1, "Ada", true, 0)).await.unwrap();
        let ctx = context(Arc::clone(&store), OffloadConfig::default());

        // Day 5 was processed earlier and holds a valid cursor.
        let mut middle = activity(2, 5, Some(10.0));
        middle.set_stats_section(
            "count",
            json!({"cursor": {"period": 5, "open_load": 10.0, "state": {"days": 0, "total": 0.0}}}),
        );
        let entry = middle.sync_state.entry_mut(SyncCategory::Local, "count");
        entry.version = Some(1);
        entry.config_hash = Some(ctx.manifest.config_hash.clone());

        let early = activity(1, 1, Some(10.0));
        let late = activity(3, 10, Some(10.0));
        store
            .put_activities(&[early.clone(), middle, late.clone()])
            .await
            .unwrap();

        let mut cache = None;
        let finished = process_batch(&DailyCount, &ctx, &mut cache, vec![early, late])
            .await
            .unwrap();

        assert_eq!(finished[0].activity.stats_section("count").unwrap()["total"], json!(10.0));
        let out = finished[1].activity.stats_section("count").unwrap();
        assert_eq!(out["total"], json!(30.0));
        assert_eq!(out["days"], json!(9));
    }

    #[tokio::test]
    async fn missing_seed_starts_fresh() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(store, OffloadConfig::default());
        let mut cache = None;
        let finished = process_batch(&DailyCount, &ctx, &mut cache, vec![activity(1, 9, Some(2.0))])
            .await
            .unwrap();
        let out = finished[0].activity.stats_section("count").unwrap();
        assert_eq!(out["total"], json!(2.0));
        assert_eq!(out["days"], json!(0));
    }

    #[tokio::test(start_paused = true)]
    async fn driver_batches_after_quiet_period_then_stops() {
        let store = Arc::new(MemoryStore::new());
        let config = OffloadConfig {
            min_wait_ms: 100,
            max_wait_ms: 1_000,
            max_batch: 10,
            ..OffloadConfig::default()
        };
        let ctx = context(store, config);
        let instance = AggregateFactory::new(DailyCount).create(ctx).unwrap();

        instance
            .put_incoming(vec![activity(2, 1, Some(1.0)), activity(1, 0, Some(1.0))])
            .unwrap();
        assert_eq!(instance.pending(), 2);

        instance.wait_finished().await;
        let finished = instance.get_finished(10);
        assert_eq!(finished.iter().map(|f| f.activity.id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(
            finished[1].activity.stats_section("count").unwrap()["total"],
            json!(2.0)
        );

        instance.stop();
        instance.wait_finished().await;
        assert!(instance.is_terminated());
        assert_eq!(instance.terminal_error(), None);
    }
}
