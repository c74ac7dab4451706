use std::sync::Mutex;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::sync::Cancelled;

use super::window::{FixedWindowLimiter, LimiterSpec};

/// Per-member status for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimiterStatus {
    pub label: String,
    pub period_ms: i64,
    pub limit: u32,
    pub used: u32,
    pub resets_in_ms: i64,
    pub suspend_ms: i64,
}

/// Several fixed-window counters enforced jointly.
///
/// Every use counts against all members at once, and a caller may proceed only when
/// every member permits one more use.
pub struct RateLimiterGroup {
    pub(super) members: Mutex<Vec<FixedWindowLimiter>>,
    origin_ms: i64,
    origin: tokio::time::Instant,
    pub(super) last_persist: Mutex<Option<i64>>,
}

impl RateLimiterGroup {
    pub fn new(specs: impl IntoIterator<Item = LimiterSpec>) -> Self {
        Self {
            members: Mutex::new(specs.into_iter().map(FixedWindowLimiter::new).collect()),
            origin_ms: crate::now_ms(),
            origin: tokio::time::Instant::now(),
            last_persist: Mutex::new(None),
        }
    }

    /// Per-minute, per-hour and per-day budget typical for public fitness APIs.
    pub fn default_specs() -> Vec<LimiterSpec> {
        vec![
            LimiterSpec::new("minute", 60_000, 60, true),
            LimiterSpec::new("hour", 3_600_000, 600, false),
            LimiterSpec::new("day", 86_400_000, 3_000, false),
        ]
    }

    /// Wall-clock ms, advanced with tokio's clock so paused-time tests see it move.
    pub fn now(&self) -> i64 {
        self.origin_ms + self.origin.elapsed().as_millis() as i64
    }

    pub(super) fn lock(&self) -> std::sync::MutexGuard<'_, Vec<FixedWindowLimiter>> {
        self.members.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Count one use against every member.
    pub fn increment(&self, now: i64) {
        for member in self.lock().iter_mut() {
            member.increment(now);
        }
    }

    /// Largest suspension any member would impose on one more use at `now`.
    pub fn will_suspend_for(&self, now: i64) -> i64 {
        self.lock()
            .iter()
            .map(|m| m.suspend_for(now))
            .max()
            .unwrap_or(0)
    }

    /// Suspend until every member permits one more use, or until cancelled.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), Cancelled> {
        loop {
            let delay = self.will_suspend_for(self.now());
            if delay <= 0 {
                return Ok(());
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Cancelled),
                _ = tokio::time::sleep(std::time::Duration::from_millis(delay as u64)) => {}
            }
        }
    }

    pub fn status(&self, now: i64) -> Vec<LimiterStatus> {
        self.lock()
            .iter()
            .map(|m| LimiterStatus {
                label: m.label().to_string(),
                period_ms: m.spec().period_ms,
                limit: m.spec().limit,
                used: m.used(now),
                resets_in_ms: m.resets_in(now),
                suspend_ms: m.suspend_for(now),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group() -> RateLimiterGroup {
        RateLimiterGroup::new([
            LimiterSpec::new("short", 1_000, 2, false),
            LimiterSpec::new("long", 10_000, 3, false),
        ])
    }

    #[test]
    fn increment_updates_every_member() {
        let g = group();
        g.increment(0);
        let status = g.status(0);
        assert!(status.iter().all(|s| s.used == 1));
    }

    #[test]
    fn will_suspend_for_is_max_over_members() {
        let g = group();
        g.increment(0);
        g.increment(0);
        assert_eq!(g.will_suspend_for(0), 1_000);
        g.increment(1_000);
        // short has room again, long is exhausted until its window closes.
        assert_eq!(g.will_suspend_for(1_000), 9_000);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_returns_only_when_all_members_permit() {
        let g = group();
        let now = g.now();
        g.increment(now);
        g.increment(now);
        g.increment(now);

        let started = tokio::time::Instant::now();
        g.wait(&CancellationToken::new()).await.unwrap();
        assert!(started.elapsed() >= std::time::Duration::from_millis(10_000));
        assert_eq!(g.will_suspend_for(g.now()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_is_cancellable() {
        let g = group();
        let now = g.now();
        for _ in 0..3 {
            g.increment(now);
        }
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(g.wait(&cancel).await, Err(Cancelled));
    }
}
