//! ActivityStream entity - named data series fetched for an activity.

use std::collections::BTreeMap;

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// ActivityStream model - one row per activity holding every fetched series.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "activity_streams")]
pub struct Model {
    /// Activity this row belongs to.
    #[sea_orm(primary_key, auto_increment = false)]
    pub activity_id: i64,

    /// Owning subject (denormalized for pruning).
    #[sea_orm(indexed)]
    pub subject_id: i64,

    /// Series keyed by name, e.g. `{"watts": [...], "time": [...]}`.
    #[sea_orm(column_type = "Json")]
    pub data: Json,

    /// When the series were fetched (ms).
    pub fetched_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

/// Typed view over the `data` column.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamSet(pub BTreeMap<String, Vec<f64>>);

impl StreamSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&[f64]> {
        self.0.get(name).map(Vec::as_slice)
    }

    pub fn insert(&mut self, name: impl Into<String>, series: Vec<f64>) {
        self.0.insert(name.into(), series);
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(Vec::is_empty)
    }

    /// Parse the JSON column. Non-numeric samples are dropped.
    pub fn from_json(value: &Json) -> Self {
        let Some(map) = value.as_object() else {
            return Self::default();
        };
        let series = map
            .iter()
            .filter_map(|(name, samples)| {
                let samples = samples.as_array()?;
                Some((
                    name.clone(),
                    samples.iter().filter_map(Json::as_f64).collect(),
                ))
            })
            .collect();
        Self(series)
    }

    pub fn to_json(&self) -> Json {
        serde_json::to_value(self).unwrap_or(Json::Object(Default::default()))
    }
}

impl Model {
    pub fn new(activity_id: i64, subject_id: i64, streams: &StreamSet, fetched_at: i64) -> Self {
        Self {
            activity_id,
            subject_id,
            data: streams.to_json(),
            fetched_at,
        }
    }

    pub fn streams(&self) -> StreamSet {
        StreamSet::from_json(&self.data)
    }
}
