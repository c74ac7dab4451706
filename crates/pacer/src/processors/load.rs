//! `training-load`: chronic and acute training load as daily exponentially
//! weighted averages of training stress.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::entity::prelude::Activity;
use crate::manifest::ProcessorConfig;
use crate::offload::RunningTotal;

use super::stats;

/// Stats section written by this processor.
pub const SECTION: &str = "load";

pub const DEFAULT_CTL_DAYS: f64 = 42.0;
pub const DEFAULT_ATL_DAYS: f64 = 7.0;

/// Fitness (`ctl`) and fatigue (`atl`) at the start of a day.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadState {
    pub ctl: f64,
    pub atl: f64,
}

#[derive(Debug, Clone)]
pub struct TrainingLoad {
    ctl_days: f64,
    atl_days: f64,
}

impl Default for TrainingLoad {
    fn default() -> Self {
        Self {
            ctl_days: DEFAULT_CTL_DAYS,
            atl_days: DEFAULT_ATL_DAYS,
        }
    }
}

impl TrainingLoad {
    pub fn from_config(config: &ProcessorConfig) -> Self {
        let read = |key: &str, default: f64| {
            config
                .get(key)
                .and_then(Value::as_f64)
                .filter(|d| *d >= 1.0)
                .unwrap_or(default)
        };
        Self {
            ctl_days: read("ctl_days", DEFAULT_CTL_DAYS),
            atl_days: read("atl_days", DEFAULT_ATL_DAYS),
        }
    }

    fn step(&self, state: &LoadState, load: f64) -> LoadState {
        LoadState {
            ctl: state.ctl + (load - state.ctl) / self.ctl_days,
            atl: state.atl + (load - state.atl) / self.atl_days,
        }
    }
}

impl RunningTotal for TrainingLoad {
    type State = LoadState;

    fn section(&self) -> &'static str {
        SECTION
    }

    /// Training stress from `activity-stats`; activities without power count as rest.
    fn contribution(&self, activity: &Activity) -> Result<f64, String> {
        let Some(summary) = activity.stats_section(stats::SECTION) else {
            return Err("activity stats missing".to_string());
        };
        Ok(summary.get("tss").and_then(Value::as_f64).unwrap_or(0.0))
    }

    fn close_period(&self, state: &mut LoadState, load: f64) {
        *state = self.step(state, load);
    }

    fn output(&self, state: &LoadState, open_load: f64) -> serde_json::Map<String, Value> {
        let today = self.step(state, open_load);
        let mut out = serde_json::Map::new();
        out.insert("ctl".into(), json!(today.ctl));
        out.insert("atl".into(), json!(today.atl));
        // Form is measured against the start of the day.
        out.insert("tsb".into(), json!(state.ctl - state.atl));
        out
    }
}
