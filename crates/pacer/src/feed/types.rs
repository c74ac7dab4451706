use chrono::{Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::prelude::{Activity, ActivityKind};

/// An activity as described by the remote feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedActivity {
    pub id: i64,
    /// Start time, ms since the epoch.
    pub ts: i64,
    /// Remote type label, e.g. "VirtualRide".
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    /// Mutable summary fields (distance, moving time, ...).
    #[serde(default)]
    pub summary: serde_json::Value,
}

impl FeedActivity {
    /// Digest of the fields that may change remotely after upload.
    pub fn content_hash(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.ts.to_le_bytes());
        hasher.update(self.kind.as_bytes());
        hasher.update(&[0]);
        hasher.update(self.name.as_bytes());
        hasher.update(&[0]);
        hasher.update(self.summary.to_string().as_bytes());
        hasher.finalize().to_hex()[..16].to_string()
    }

    /// Build a fresh local record.
    pub fn to_activity(&self, subject_id: i64, now: i64) -> Activity {
        let mut activity = Activity::new(
            self.id,
            subject_id,
            self.ts,
            ActivityKind::from_label(&self.kind),
            self.name.clone(),
        );
        self.apply_to(&mut activity, now);
        activity
    }

    /// Copy mutable fields onto an existing record, keeping its sync state.
    pub fn apply_to(&self, activity: &mut Activity, now: i64) {
        activity.ts = self.ts;
        activity.kind = ActivityKind::from_label(&self.kind);
        activity.name = self.name.clone();
        activity.summary = if self.summary.is_object() {
            self.summary.clone()
        } else {
            serde_json::Value::Object(Default::default())
        };
        activity.content_hash = self.content_hash();
        activity.updated_at = now;
    }
}

/// One entry of the owner's own feed. Entries without an activity (posts,
/// challenges, ...) still carry a server cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedEntry {
    pub cursor: i64,
    #[serde(default)]
    pub activity: Option<FeedActivity>,
}

/// A calendar month, the unit of peer feed scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MonthBucket {
    pub year: i32,
    /// 1-based month.
    pub month: u32,
}

impl MonthBucket {
    pub fn new(year: i32, month: u32) -> Self {
        Self { year, month }
    }

    /// Bucket containing the given instant.
    pub fn containing(ts_ms: i64) -> Self {
        let dt = Utc
            .timestamp_millis_opt(ts_ms)
            .single()
            .unwrap_or_default();
        Self::new(dt.year(), dt.month())
    }

    /// Monotonic index, used as the persisted sentinel.
    pub fn index(self) -> i64 {
        i64::from(self.year) * 12 + i64::from(self.month) - 1
    }

    pub fn from_index(index: i64) -> Self {
        Self::new(index.div_euclid(12) as i32, index.rem_euclid(12) as u32 + 1)
    }

    /// The preceding month.
    pub fn prev(self) -> Self {
        Self::from_index(self.index() - 1)
    }
}

impl std::fmt::Display for MonthBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}
