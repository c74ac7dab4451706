//! Activity entity - one entry of a subject's timeline plus its sync state.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::entity::activity_kind::ActivityKind;
use crate::entity::sync_state::SyncStateMap;

/// Activity model.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "activities")]
pub struct Model {
    /// Remote activity id.
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: i64,

    /// Owning subject.
    #[sea_orm(indexed)]
    pub subject_id: i64,

    // ─── Timeline ────────────────────────────────────────────────────────────
    /// Start time, milliseconds since the epoch.
    pub ts: i64,
    /// Normalized activity category.
    pub kind: ActivityKind,
    /// Display name.
    pub name: String,

    // ─── Change Detection ────────────────────────────────────────────────────
    /// Digest of the mutable remote fields, compared during discovery.
    pub content_hash: String,

    // ─── Sync Bookkeeping ────────────────────────────────────────────────────
    /// Per-manifest applied version/config and error history.
    #[sea_orm(column_type = "Json")]
    pub sync_state: SyncStateMap,

    // ─── Derived Analytics ───────────────────────────────────────────────────
    /// Processor output, keyed by section (e.g. "summary", "peaks", "load").
    #[sea_orm(column_type = "Json")]
    pub stats: Json,

    /// Remote summary fields kept for processors (distance, moving time, ...).
    #[sea_orm(column_type = "Json")]
    pub summary: Json,

    /// When this record was last written locally (ms).
    pub updated_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// An activity belongs to a subject.
    #[sea_orm(
        belongs_to = "super::subject::Entity",
        from = "Column::SubjectId",
        to = "super::subject::Column::Id",
        on_delete = "Cascade"
    )]
    Subject,
}

impl Related<super::subject::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Subject.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Create a freshly discovered activity with empty sync state.
    pub fn new(id: i64, subject_id: i64, ts: i64, kind: ActivityKind, name: impl Into<String>) -> Self {
        Self {
            id,
            subject_id,
            ts,
            kind,
            name: name.into(),
            content_hash: String::new(),
            sync_state: SyncStateMap::new(),
            stats: Json::Object(Default::default()),
            summary: Json::Object(Default::default()),
            updated_at: 0,
        }
    }

    /// Read one section of processor output.
    pub fn stats_section(&self, key: &str) -> Option<&Json> {
        self.stats.get(key)
    }

    /// Replace one section of processor output.
    pub fn set_stats_section(&mut self, key: &str, value: Json) {
        if !self.stats.is_object() {
            self.stats = Json::Object(Default::default());
        }
        if let Json::Object(map) = &mut self.stats {
            map.insert(key.to_string(), value);
        }
    }

    /// Read a numeric field from the remote summary.
    pub fn summary_f64(&self, key: &str) -> Option<f64> {
        self.summary.get(key).and_then(Json::as_f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stats_sections_round_trip() {
        let mut activity = Model::new(1, 7, 1_000, ActivityKind::Ride, "Morning Ride");
        assert!(activity.stats_section("peaks").is_none());

        activity.set_stats_section("peaks", json!({"60": 310.0}));
        assert_eq!(activity.stats_section("peaks"), Some(&json!({"60": 310.0})));
    }

    #[test]
    fn set_stats_section_repairs_non_object_stats() {
        let mut activity = Model::new(1, 7, 1_000, ActivityKind::Run, "Run");
        activity.stats = Json::Null;
        activity.set_stats_section("summary", json!({"tss": 40.0}));
        assert_eq!(activity.stats["summary"]["tss"], 40.0);
    }

    #[test]
    fn summary_f64_reads_numbers_only() {
        let mut activity = Model::new(1, 7, 1_000, ActivityKind::Run, "Run");
        activity.summary = json!({"distance": 10_000.0, "name": "x"});
        assert_eq!(activity.summary_f64("distance"), Some(10_000.0));
        assert_eq!(activity.summary_f64("name"), None);
        assert_eq!(activity.summary_f64("missing"), None);
    }
}
