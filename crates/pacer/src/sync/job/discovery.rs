//! Discovery: mirror the remote feed into the store.
//!
//! Records are matched by id and compared by content hash. A changed record keeps
//! its sync state for remote data but loses every local result, since derived
//! analytics depend on the fields that changed.

use std::collections::HashMap;

use crate::entity::prelude::{Activity, Subject, SyncCategory};
use crate::feed::{FeedActivity, MonthBucket, PeerBucketScanner, SelfFeedPager};
use crate::sync::cancel::race;
use crate::sync::events::LogLevel;

use super::{JobError, SyncJob, index};

impl SyncJob {
    #[tracing::instrument(skip_all, fields(subject = self.subject_id))]
    pub(super) async fn discover(&mut self, subject: &mut Subject) -> Result<HashMap<i64, Activity>, JobError> {
        let mut known = index(self.ctx.store.activities_for_subject(subject.id).await?);
        let before = (self.summary.discovered, self.summary.updated);

        if subject.is_self {
            self.discover_self(subject, &mut known).await?;
        } else {
            self.discover_peer(subject, &mut known).await?;
        }

        let discovered = self.summary.discovered - before.0;
        let updated = self.summary.updated - before.1;
        if discovered > 0 || updated > 0 {
            self.log(
                LogLevel::Info,
                &format!("Discovered {discovered} new and {updated} changed activities"),
            );
        }
        Ok(known)
    }

    /// Page the owner's feed newest first.
    ///
    /// When the backlog was fully walked before, the first page made only of known
    /// records ends discovery. Otherwise paging jumps to the persisted resume cursor
    /// once it reaches known territory, and keeps walking back to the end of the
    /// feed. The cursor is persisted after every page that moves it further back,
    /// so an interrupted walk resumes where it stopped.
    async fn discover_self(&mut self, subject: &mut Subject, known: &mut HashMap<i64, Activity>) -> Result<(), JobError> {
        let full = self.options.full_discovery;
        let backlog_complete = subject.last_sync_ts.is_some() && subject.discovery_cursor.is_none();
        let resume = if full { None } else { subject.discovery_cursor };
        let mut pager = SelfFeedPager::new(subject.id, None);
        let mut jumped = false;

        loop {
            let Some(page) = race(&self.cancel, pager.next_page(&self.feed)).await?? else {
                break;
            };
            let changed = self.merge_page(subject.id, known, page);
            if !changed.is_empty() {
                self.ctx.store.put_activities(&changed).await?;
            }

            if !full && changed.is_empty() {
                if backlog_complete {
                    break;
                }
                if !jumped && let Some(cursor) = resume {
                    tracing::debug!(subject = subject.id, cursor, "Jumping to resume cursor");
                    pager = SelfFeedPager::new(subject.id, Some(cursor));
                    jumped = true;
                    continue;
                }
            }

            if let Some(cursor) = pager.cursor()
                && subject.discovery_cursor.is_none_or(|saved| cursor < saved)
            {
                subject.discovery_cursor = Some(cursor);
                self.ctx.store.put_subject(subject).await?;
            }
        }

        if subject.discovery_cursor.is_some() {
            subject.discovery_cursor = None;
            self.ctx.store.put_subject(subject).await?;
        }
        tracing::debug!(subject = subject.id, pages = pager.pages(), "Self feed walked");
        Ok(())
    }

    /// Scan a peer's public feed one month bucket at a time, newest first.
    async fn discover_peer(&mut self, subject: &mut Subject, known: &mut HashMap<i64, Activity>) -> Result<(), JobError> {
        let full = self.options.full_discovery;
        let sentinel = if full { None } else { subject.discovery_sentinel };
        let start = MonthBucket::containing(crate::now_ms());
        let mut scanner = PeerBucketScanner::new(
            subject.id,
            start,
            sentinel,
            self.ctx.config.peer_scan.to_options(),
        );

        loop {
            let is_known = |fa: &FeedActivity| {
                !full
                    && known
                        .get(&fa.id)
                        .is_some_and(|a| a.content_hash == fa.content_hash())
            };
            let Some(batch) = race(&self.cancel, scanner.next_batch(&self.feed, is_known)).await?? else {
                break;
            };
            let changed = self.merge_page(subject.id, known, batch);
            if !changed.is_empty() {
                self.ctx.store.put_activities(&changed).await?;
            }
        }

        if let Some(boundary) = scanner.sentinel()
            && subject.discovery_sentinel != Some(boundary)
        {
            tracing::debug!(
                subject = subject.id,
                boundary = %MonthBucket::from_index(boundary),
                "Recorded peer feed boundary"
            );
            subject.discovery_sentinel = Some(boundary);
            self.ctx.store.put_subject(subject).await?;
        }
        Ok(())
    }

    /// Fold one page into `known`, returning the records that are new or changed.
    fn merge_page(&mut self, subject_id: i64, known: &mut HashMap<i64, Activity>, page: Vec<FeedActivity>) -> Vec<Activity> {
        let now = crate::now_ms();
        let mut changed = Vec::new();
        for remote in page {
            match known.get_mut(&remote.id) {
                Some(local) if local.content_hash == remote.content_hash() => {}
                Some(local) => {
                    remote.apply_to(local, now);
                    self.ctx
                        .registry
                        .invalidate(&mut local.sync_state, SyncCategory::Local, None);
                    self.summary.updated += 1;
                    changed.push(local.clone());
                }
                None => {
                    let activity = remote.to_activity(subject_id, now);
                    self.summary.discovered += 1;
                    changed.push(activity.clone());
                    known.insert(activity.id, activity);
                }
            }
        }
        changed
    }
}
