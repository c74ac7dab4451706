//! Subject entity - the athlete whose activity timeline is mirrored.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Subject model.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "subjects")]
pub struct Model {
    /// Remote athlete id.
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: i64,

    /// Display name.
    pub name: String,

    /// Disabled subjects are never admitted by the manager.
    #[sea_orm(default_value = true)]
    pub enabled: bool,

    /// True for the authenticated owner (own feed), false for a peer (public feed).
    #[sea_orm(default_value = false)]
    pub is_self: bool,

    // ─── Sync Cursors ────────────────────────────────────────────────────────
    /// Completion time (ms) of the last successful job.
    pub last_sync_ts: Option<i64>,
    /// Time (ms) of the last failed job.
    pub last_sync_error_ts: Option<i64>,
    /// Message of the last failed job.
    #[sea_orm(column_type = "Text", nullable)]
    pub last_sync_error: Option<String>,
    /// Manifest-set hash applied by the last successful job.
    pub last_applied_manifest_hash: Option<String>,
    /// Resume point for self-feed discovery.
    pub discovery_cursor: Option<i64>,
    /// Proven feed boundary for peer discovery (month bucket index).
    pub discovery_sentinel: Option<i64>,

    // ─── Domain Attributes ───────────────────────────────────────────────────
    /// FTP history as `[{ts, value}]`.
    #[sea_orm(column_type = "Json")]
    pub ftp_history: Json,
    /// Weight history (kg) as `[{ts, value}]`.
    #[sea_orm(column_type = "Json")]
    pub weight_history: Json,

    /// Creation time (ms).
    pub created_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// A subject owns many activities.
    #[sea_orm(has_many = "super::activity::Entity")]
    Activities,
}

impl Related<super::activity::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Activities.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// A value that took effect at a point in time.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DatedValue {
    pub ts: i64,
    pub value: f64,
}

impl Model {
    /// Create an enabled subject with empty cursors.
    pub fn new(id: i64, name: impl Into<String>, is_self: bool, created_at: i64) -> Self {
        Self {
            id,
            name: name.into(),
            enabled: true,
            is_self,
            last_sync_ts: None,
            last_sync_error_ts: None,
            last_sync_error: None,
            last_applied_manifest_hash: None,
            discovery_cursor: None,
            discovery_sentinel: None,
            ftp_history: Json::Array(Vec::new()),
            weight_history: Json::Array(Vec::new()),
            created_at,
        }
    }

    /// FTP in effect at `ts`.
    pub fn ftp_at(&self, ts: i64) -> Option<f64> {
        value_at(&self.ftp_history, ts)
    }

    /// Weight in effect at `ts`.
    pub fn weight_at(&self, ts: i64) -> Option<f64> {
        value_at(&self.weight_history, ts)
    }

    /// Record a new FTP value effective from `ts`.
    pub fn push_ftp(&mut self, ts: i64, value: f64) {
        push_value(&mut self.ftp_history, ts, value);
    }

    /// Record a new weight value effective from `ts`.
    pub fn push_weight(&mut self, ts: i64, value: f64) {
        push_value(&mut self.weight_history, ts, value);
    }
}

fn history(json: &Json) -> Vec<DatedValue> {
    serde_json::from_value::<Vec<DatedValue>>(json.clone()).unwrap_or_default()
}

/// The latest entry at or before `ts`; entries after `ts` are ignored unless
/// nothing earlier exists, in which case the oldest known value is used.
fn value_at(json: &Json, ts: i64) -> Option<f64> {
    let mut entries = history(json);
    entries.sort_by_key(|e| e.ts);
    entries
        .iter()
        .rev()
        .find(|e| e.ts <= ts)
        .or_else(|| entries.first())
        .map(|e| e.value)
}

fn push_value(json: &mut Json, ts: i64, value: f64) {
    let mut entries = history(json);
    entries.retain(|e| e.ts != ts);
    entries.push(DatedValue { ts, value });
    entries.sort_by_key(|e| e.ts);
    *json = serde_json::to_value(entries).unwrap_or(Json::Array(Vec::new()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ftp_at_picks_latest_effective_value() {
        let mut subject = Model::new(1, "Ada", true, 0);
        subject.push_ftp(1_000, 250.0);
        subject.push_ftp(5_000, 270.0);

        assert_eq!(subject.ftp_at(500), Some(250.0));
        assert_eq!(subject.ftp_at(1_000), Some(250.0));
        assert_eq!(subject.ftp_at(4_999), Some(250.0));
        assert_eq!(subject.ftp_at(9_000), Some(270.0));
    }

    #[test]
    fn push_replaces_same_timestamp() {
        let mut subject = Model::new(1, "Ada", true, 0);
        subject.push_weight(1_000, 70.0);
        subject.push_weight(1_000, 68.5);
        assert_eq!(subject.weight_at(2_000), Some(68.5));
        assert_eq!(history(&subject.weight_history).len(), 1);
    }

    #[test]
    fn empty_history_yields_none() {
        let subject = Model::new(1, "Ada", false, 0);
        assert_eq!(subject.ftp_at(1_000), None);
    }
}
