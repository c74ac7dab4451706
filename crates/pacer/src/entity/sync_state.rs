//! Per-activity sync bookkeeping stored as a JSON column.
//!
//! The layout is `category -> manifest name -> entry`, where an entry records the
//! manifest version and config hash that were last applied and, optionally, the
//! error history of the most recent failures.

use std::collections::BTreeMap;

use sea_orm::FromJsonQueryResult;
use serde::{Deserialize, Serialize};

/// Manifest category. Remote data acquisition and local computation are
/// scheduled by different stages of a sync job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncCategory {
    /// Remote data series fetched from the feed.
    Streams,
    /// Locally computed analytics.
    Local,
}

impl std::fmt::Display for SyncCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncCategory::Streams => write!(f, "streams"),
            SyncCategory::Local => write!(f, "local"),
        }
    }
}

impl std::str::FromStr for SyncCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "streams" => Ok(SyncCategory::Streams),
            "local" => Ok(SyncCategory::Local),
            other => Err(format!("unknown sync category: {other}")),
        }
    }
}

/// Classification of a recorded error.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncErrorKind {
    /// Network or server failure; retried after backoff.
    #[default]
    Transient,
    /// The remote definitively has no data for this activity.
    NoData,
    /// A processor reported a failure for this activity.
    Processor,
    /// The offload instance carrying this activity died.
    Offload,
}

/// Error history for one manifest on one activity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncErrorInfo {
    /// Consecutive failures since the last success.
    pub count: u32,
    /// Timestamp (ms) of the most recent failure.
    pub last_ts: i64,
    /// Message of the most recent failure.
    pub message: String,
    #[serde(default)]
    pub kind: SyncErrorKind,
}

/// Applied state of one manifest on one activity.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SyncErrorInfo>,
}

/// Full sync state of an activity.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, FromJsonQueryResult)]
#[serde(transparent)]
pub struct SyncStateMap(BTreeMap<SyncCategory, BTreeMap<String, SyncEntry>>);

impl SyncStateMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the entry for a manifest.
    pub fn get(&self, category: SyncCategory, name: &str) -> Option<&SyncEntry> {
        self.0.get(&category).and_then(|names| names.get(name))
    }

    /// Mutable entry for a manifest, created empty if missing.
    pub fn entry_mut(&mut self, category: SyncCategory, name: &str) -> &mut SyncEntry {
        self.0
            .entry(category)
            .or_default()
            .entry(name.to_string())
            .or_default()
    }

    /// Remove the entry for a manifest. Returns true if one existed.
    pub fn clear(&mut self, category: SyncCategory, name: &str) -> bool {
        let Some(names) = self.0.get_mut(&category) else {
            return false;
        };
        let removed = names.remove(name).is_some();
        if names.is_empty() {
            self.0.remove(&category);
        }
        removed
    }

    /// Remove every entry in a category. Returns true if anything was removed.
    pub fn clear_category(&mut self, category: SyncCategory) -> bool {
        self.0.remove(&category).is_some()
    }

    /// Iterate over `(category, name, entry)` triples.
    pub fn iter(&self) -> impl Iterator<Item = (SyncCategory, &str, &SyncEntry)> {
        self.0.iter().flat_map(|(category, names)| {
            names
                .iter()
                .map(move |(name, entry)| (*category, name.as_str(), entry))
        })
    }

    /// Whether any manifest currently carries an error.
    pub fn has_errors(&self) -> bool {
        self.iter().any(|(_, _, entry)| entry.error.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_mut_creates_and_clear_removes() {
        let mut state = SyncStateMap::new();
        state.entry_mut(SyncCategory::Local, "peaks").version = Some(2);

        assert_eq!(
            state.get(SyncCategory::Local, "peaks").and_then(|e| e.version),
            Some(2)
        );
        assert!(state.clear(SyncCategory::Local, "peaks"));
        assert!(!state.clear(SyncCategory::Local, "peaks"));
        assert!(state.is_empty());
    }

    #[test]
    fn serializes_as_nested_maps() {
        let mut state = SyncStateMap::new();
        state.entry_mut(SyncCategory::Streams, "streams").version = Some(1);
        state.entry_mut(SyncCategory::Local, "peaks").error = Some(SyncErrorInfo {
            count: 1,
            last_ts: 10,
            message: "boom".to_string(),
            kind: SyncErrorKind::Processor,
        });

        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["streams"]["streams"]["version"], 1);
        assert_eq!(value["local"]["peaks"]["error"]["kind"], "processor");

        let back: SyncStateMap = serde_json::from_value(value).unwrap();
        assert_eq!(back, state);
        assert!(back.has_errors());
    }

    #[test]
    fn category_parses_from_str() {
        assert_eq!("local".parse::<SyncCategory>(), Ok(SyncCategory::Local));
        assert!("remote".parse::<SyncCategory>().is_err());
    }
}
