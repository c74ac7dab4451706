//! `peaks`: best average power over fixed durations, computed on worker threads.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::entity::prelude::Activity;
use crate::manifest::ProcessorConfig;
use crate::offload::{PoolJob, WorkItem, WorkerTask};
use crate::store::Store;

/// Stats section written by this processor.
pub const SECTION: &str = "peaks";

/// Stream the peaks are computed from. Samples are one second apart.
pub const POWER_STREAM: &str = "watts";

/// Durations (seconds) reported unless configured otherwise.
pub const DEFAULT_PEAK_PERIODS: &[u32] = &[5, 15, 60, 300, 1200, 3600];

/// Highest mean over every window of `period` consecutive samples.
pub fn best_average(samples: &[f64], period: usize) -> Option<f64> {
    if period == 0 || samples.len() < period {
        return None;
    }
    let mut sum: f64 = samples[..period].iter().sum();
    let mut best = sum;
    for i in period..samples.len() {
        sum += samples[i] - samples[i - period];
        best = best.max(sum);
    }
    Some(best / period as f64)
}

/// Best averages for every period that fits in `samples`.
pub fn peak_curve(samples: &[f64], periods: &[u32]) -> BTreeMap<u32, f64> {
    periods
        .iter()
        .filter_map(|&p| best_average(samples, p as usize).map(|avg| (p, avg)))
        .collect()
}

/// Worker-side computation.
#[derive(Debug, Default)]
pub struct PeakTask {
    periods: Vec<u32>,
}

impl WorkerTask for PeakTask {
    fn start(&mut self, config: &Value) -> Result<(), String> {
        self.periods = serde_json::from_value(config.clone()).map_err(|e| e.to_string())?;
        Ok(())
    }

    fn process(&mut self, item: &WorkItem) -> Result<Value, String> {
        let Some(raw) = item.payload.get(POWER_STREAM) else {
            return Ok(json!({}));
        };
        let samples: Vec<f64> = serde_json::from_value(raw.clone()).map_err(|e| e.to_string())?;
        let curve: serde_json::Map<String, Value> = peak_curve(&samples, &self.periods)
            .into_iter()
            .map(|(period, watts)| (period.to_string(), json!(watts)))
            .collect();
        Ok(Value::Object(curve))
    }
}

/// Pool job feeding power streams to [`PeakTask`] workers.
#[derive(Debug, Clone)]
pub struct PeakPower {
    periods: Vec<u32>,
}

impl PeakPower {
    pub fn from_config(config: &ProcessorConfig) -> Self {
        let periods = config
            .get("peak_periods")
            .and_then(|v| serde_json::from_value::<Vec<u32>>(v.clone()).ok())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| DEFAULT_PEAK_PERIODS.to_vec());
        Self { periods }
    }
}

#[async_trait]
impl PoolJob for PeakPower {
    type Task = PeakTask;

    fn task(&self) -> PeakTask {
        PeakTask::default()
    }

    fn start_config(&self) -> Value {
        json!(self.periods)
    }

    async fn prepare(&self, store: &dyn Store, activity: &Activity) -> Result<Value, String> {
        let streams = store
            .get_streams(activity.id)
            .await
            .map_err(|e| e.to_string())?;
        // Activities without power get an empty curve rather than an error.
        Ok(match streams.as_ref().and_then(|s| s.get(POWER_STREAM)) {
            Some(watts) => json!({ "watts": watts }),
            None => json!({}),
        })
    }

    fn apply(&self, activity: &mut Activity, output: Value) {
        activity.set_stats_section(SECTION, output);
    }
}
