//! Compact persisted form of a [`RateLimiterGroup`].
//!
//! Snapshots are delta-encoded against the oldest open window so they stay small,
//! and windows that already closed are dropped. Loading a snapshot never adds
//! counts together: an external window is adopted only when it is newer than the
//! in-memory one, or the same window with a higher count.

use serde::{Deserialize, Serialize};

use crate::entity::prelude::KvStateModel;
use crate::store::{Store, StoreError};

use super::group::RateLimiterGroup;
use super::window::WindowState;

/// Minimum spacing between persisted snapshots.
pub const PERSIST_INTERVAL_MS: i64 = 5_000;

/// One member: `(label, first - base, last - base, count)`.
pub type MemberDelta = (String, i64, i64, u32);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    #[serde(rename = "b")]
    pub base: i64,
    #[serde(rename = "m")]
    pub members: Vec<MemberDelta>,
}

impl RateLimiterGroup {
    /// Open windows at `now`, delta-encoded.
    pub fn snapshot(&self, now: i64) -> RateLimitSnapshot {
        let members = self.lock();
        let open: Vec<(&str, WindowState)> = members
            .iter()
            .filter_map(|m| m.state(now).map(|s| (m.label(), s)))
            .collect();
        let Some(base) = open.iter().map(|(_, s)| s.first).min() else {
            return RateLimitSnapshot::default();
        };
        RateLimitSnapshot {
            base,
            members: open
                .into_iter()
                .map(|(label, s)| (label.to_string(), s.first - base, s.last - base, s.count))
                .collect(),
        }
    }

    /// Adopt external windows not already subsumed by in-memory state. Returns
    /// the number of members updated.
    pub fn merge(&self, snapshot: &RateLimitSnapshot, now: i64) -> usize {
        let mut members = self.lock();
        let mut adopted = 0;
        for (label, first_delta, last_delta, count) in &snapshot.members {
            let Some(member) = members.iter_mut().find(|m| m.label() == label) else {
                continue;
            };
            let external = WindowState {
                first: snapshot.base + first_delta,
                last: snapshot.base + last_delta,
                count: *count,
            };
            if external.first + member.spec().period_ms <= now {
                continue;
            }
            let take = match member.state(now) {
                None => true,
                Some(local) => {
                    external.first > local.first
                        || (external.first == local.first && external.count > local.count)
                }
            };
            if take {
                member.set_state(Some(external));
                adopted += 1;
            }
        }
        adopted
    }

    /// Merge the persisted snapshot, if any.
    pub async fn load(&self, store: &dyn Store) -> Result<usize, StoreError> {
        let Some(value) = store.get_state(KvStateModel::RATE_LIMITS_KEY).await? else {
            return Ok(0);
        };
        match serde_json::from_value::<RateLimitSnapshot>(value) {
            Ok(snapshot) => Ok(self.merge(&snapshot, self.now())),
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring unreadable rate limit snapshot");
                Ok(0)
            }
        }
    }

    /// Persist a snapshot unless one was written less than
    /// [`PERSIST_INTERVAL_MS`] ago. Returns whether a write happened.
    pub async fn persist(&self, store: &dyn Store, force: bool) -> Result<bool, StoreError> {
        let now = self.now();
        {
            let mut last = self.last_persist.lock().unwrap_or_else(|e| e.into_inner());
            if !force && last.is_some_and(|t| now - t < PERSIST_INTERVAL_MS) {
                return Ok(false);
            }
            *last = Some(now);
        }
        let value = serde_json::to_value(self.snapshot(now))?;
        store.put_state(KvStateModel::RATE_LIMITS_KEY, value).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::LimiterSpec;
    use crate::store::MemoryStore;

    fn group() -> RateLimiterGroup {
        RateLimiterGroup::new([
            LimiterSpec::new("minute", 60_000, 10, false),
            LimiterSpec::new("day", 86_400_000, 100, false),
        ])
    }

    #[test]
    fn snapshot_is_delta_encoded_and_compacted() {
        let g = group();
        g.increment(1_000_000);
        g.increment(1_000_500);

        let snap = g.snapshot(1_000_500);
        assert_eq!(snap.base, 1_000_000);
        assert!(snap.members.contains(&("minute".to_string(), 0, 500, 2)));

        // After the minute window closes only the day window remains.
        let later = g.snapshot(1_000_000 + 60_000);
        assert_eq!(later.members.len(), 1);
        assert_eq!(later.members[0].0, "day");

        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.starts_with("{\"b\":"));
    }

    #[test]
    fn merge_never_double_counts() {
        let g = group();
        g.increment(1_000);
        g.increment(1_000);
        let snap = g.snapshot(1_000);

        // Same windows, same counts: subsumed.
        assert_eq!(g.merge(&snap, 1_000), 0);
        assert_eq!(g.status(1_000)[0].used, 2);

        // Same window with a higher count wins, but is not added.
        let other = group();
        for _ in 0..5 {
            other.increment(1_000);
        }
        assert_eq!(g.merge(&other.snapshot(1_000), 1_000), 2);
        assert_eq!(g.status(1_000)[0].used, 5);
    }

    #[test]
    fn merge_adopts_newer_window_and_skips_expired() {
        let g = group();
        g.increment(0);

        let newer = group();
        newer.increment(30_000);
        assert_eq!(g.merge(&newer.snapshot(30_000), 30_000), 2);
        assert_eq!(g.status(30_000)[0].resets_in_ms, 60_000);

        let stale = group();
        stale.increment(0);
        let fresh = group();
        assert_eq!(fresh.merge(&stale.snapshot(0), 60_000), 1);
        assert_eq!(fresh.status(60_000)[0].used, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn persist_is_throttled_and_load_restores() {
        let store = MemoryStore::new();
        let g = group();
        g.increment(g.now());

        assert!(g.persist(&store, false).await.unwrap());
        assert!(!g.persist(&store, false).await.unwrap());
        assert!(g.persist(&store, true).await.unwrap());

        let restored = group();
        assert_eq!(restored.load(&store).await.unwrap(), 2);
        assert_eq!(restored.status(restored.now())[1].used, 1);
    }
}
