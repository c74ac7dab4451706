//! Pull-based pagers over the remote feed.
//!
//! Both pagers are plain state machines: each call fetches the next page (or batch of
//! calendar buckets) and advances an explicit cursor that can be persisted and handed
//! back to a new pager to resume.

use futures::future::try_join_all;

use super::types::{FeedActivity, MonthBucket};
use super::{ActivityFeed, Result};

/// First cursor nudge applied when a page yields no activities (1 hour).
pub const INITIAL_CURSOR_NUDGE_MS: i64 = 60 * 60 * 1000;

/// Largest cursor nudge (30 days).
pub const MAX_CURSOR_NUDGE_MS: i64 = 30 * 24 * 60 * 60 * 1000;

/// Pager over the owner's own feed, newest first.
///
/// The feed is not chronological and may contain pages made entirely of
/// non-activity entries whose cursors do not advance. When a page carries no
/// activity, or the cursor fails to move, the next cursor is pushed back by an
/// exponentially growing nudge so paging cannot stall.
#[derive(Debug, Clone)]
pub struct SelfFeedPager {
    subject_id: i64,
    cursor: Option<i64>,
    nudge_ms: i64,
    pages: u32,
    done: bool,
}

impl SelfFeedPager {
    /// Start at the newest page, or resume from a persisted cursor.
    pub fn new(subject_id: i64, resume_from: Option<i64>) -> Self {
        Self {
            subject_id,
            cursor: resume_from,
            nudge_ms: INITIAL_CURSOR_NUDGE_MS,
            pages: 0,
            done: false,
        }
    }

    /// Cursor the next page will be requested with.
    pub fn cursor(&self) -> Option<i64> {
        self.cursor
    }

    pub fn pages(&self) -> u32 {
        self.pages
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Fetch the next page. `Ok(None)` marks the end of the feed.
    pub async fn next_page<F: ActivityFeed + ?Sized>(
        &mut self,
        feed: &F,
    ) -> Result<Option<Vec<FeedActivity>>> {
        if self.done {
            return Ok(None);
        }

        let entries = feed.fetch_self_page(self.subject_id, self.cursor).await?;
        let Some(min_cursor) = entries.iter().map(|e| e.cursor).min() else {
            self.done = true;
            return Ok(None);
        };
        self.pages += 1;

        let activities: Vec<FeedActivity> =
            entries.into_iter().filter_map(|e| e.activity).collect();
        let stalled = self.cursor.is_some_and(|c| min_cursor >= c);

        let next = if activities.is_empty() || stalled {
            let base = self.cursor.map_or(min_cursor, |c| c.min(min_cursor));
            let nudged = base - self.nudge_ms;
            tracing::debug!(
                subject = self.subject_id,
                cursor = base,
                nudge_ms = self.nudge_ms,
                "Feed page had no anchored activities, nudging cursor"
            );
            self.nudge_ms = (self.nudge_ms * 2).min(MAX_CURSOR_NUDGE_MS);
            nudged
        } else {
            self.nudge_ms = INITIAL_CURSOR_NUDGE_MS;
            min_cursor
        };
        self.cursor = Some(next);

        Ok(Some(activities))
    }
}

/// Tuning for [`PeerBucketScanner`].
#[derive(Debug, Clone)]
pub struct PeerScanOptions {
    /// Buckets fetched concurrently in the first batch.
    pub initial_concurrency: usize,
    /// Upper bound for the doubling concurrency.
    pub max_concurrency: usize,
    /// Consecutive empty or fully-redundant batches that end the scan.
    pub stop_after: usize,
    /// Never scan before this month.
    pub floor: MonthBucket,
}

impl Default for PeerScanOptions {
    fn default() -> Self {
        Self {
            initial_concurrency: 1,
            max_concurrency: 8,
            stop_after: 3,
            floor: MonthBucket::new(2000, 1),
        }
    }
}

/// Scanner over a peer's public feed, one calendar month per request, newest first.
///
/// Each batch fetches `concurrency` consecutive months at once and doubles the
/// concurrency for the next batch. The scan ends after `stop_after` consecutive
/// batches that were empty or contained only already-known unchanged activities,
/// at the floor, or at a previously proven sentinel. A run made only of empty
/// batches proves the feed boundary and yields a new sentinel.
#[derive(Debug, Clone)]
pub struct PeerBucketScanner {
    subject_id: i64,
    next: MonthBucket,
    sentinel: Option<MonthBucket>,
    concurrency: usize,
    quiet_run: usize,
    empty_run: usize,
    oldest_with_data: Option<MonthBucket>,
    proven_sentinel: Option<MonthBucket>,
    buckets_scanned: usize,
    done: bool,
    options: PeerScanOptions,
}

impl PeerBucketScanner {
    /// Start at `start` and walk backwards; stop at `sentinel` (a bucket index) if set.
    pub fn new(
        subject_id: i64,
        start: MonthBucket,
        sentinel: Option<i64>,
        options: PeerScanOptions,
    ) -> Self {
        Self {
            subject_id,
            next: start,
            sentinel: sentinel.map(MonthBucket::from_index),
            concurrency: options.initial_concurrency.max(1),
            quiet_run: 0,
            empty_run: 0,
            oldest_with_data: None,
            proven_sentinel: None,
            buckets_scanned: 0,
            done: false,
            options,
        }
    }

    fn lower_bound(&self) -> MonthBucket {
        match self.sentinel {
            Some(sentinel) => sentinel.max(self.options.floor),
            None => self.options.floor,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn buckets_scanned(&self) -> usize {
        self.buckets_scanned
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Sentinel to persist after the scan, as a bucket index. Only set when this
    /// scan proved a boundary; never newer than an already-known sentinel.
    pub fn sentinel(&self) -> Option<i64> {
        let proven = self.proven_sentinel?;
        let merged = match self.sentinel {
            Some(existing) => existing.min(proven),
            None => proven,
        };
        Some(merged.index())
    }

    /// Fetch the next batch of buckets. `is_known` reports whether an activity is
    /// already stored unchanged. `Ok(None)` marks the end of the scan.
    pub async fn next_batch<F, K>(&mut self, feed: &F, is_known: K) -> Result<Option<Vec<FeedActivity>>>
    where
        F: ActivityFeed + ?Sized,
        K: Fn(&FeedActivity) -> bool,
    {
        if self.done {
            return Ok(None);
        }

        let lower = self.lower_bound();
        let mut buckets = Vec::with_capacity(self.concurrency);
        let mut bucket = self.next;
        while buckets.len() < self.concurrency && bucket >= lower {
            buckets.push(bucket);
            bucket = bucket.prev();
        }
        if buckets.is_empty() {
            self.done = true;
            return Ok(None);
        }
        self.next = bucket;

        let subject_id = self.subject_id;
        let pages = try_join_all(buckets.iter().map(|b| feed.fetch_peer_bucket(subject_id, *b)))
            .await?;
        self.buckets_scanned += buckets.len();

        for (bucket, page) in buckets.iter().zip(&pages) {
            if !page.is_empty() {
                self.oldest_with_data = Some(match self.oldest_with_data {
                    Some(oldest) => oldest.min(*bucket),
                    None => *bucket,
                });
            }
        }

        let activities: Vec<FeedActivity> = pages.into_iter().flatten().collect();
        let empty = activities.is_empty();
        let redundant = !empty && activities.iter().all(&is_known);

        if empty {
            self.empty_run += 1;
            self.quiet_run += 1;
        } else if redundant {
            self.empty_run = 0;
            self.quiet_run += 1;
        } else {
            self.empty_run = 0;
            self.quiet_run = 0;
        }

        if self.quiet_run >= self.options.stop_after {
            self.done = true;
            if self.empty_run >= self.options.stop_after {
                self.proven_sentinel = self.oldest_with_data;
            }
            tracing::debug!(
                subject = self.subject_id,
                buckets = self.buckets_scanned,
                boundary = ?self.proven_sentinel,
                "Peer scan stopped after quiet run"
            );
        }

        self.concurrency = (self.concurrency * 2).min(self.options.max_concurrency.max(1));
        Ok(Some(activities))
    }
}
