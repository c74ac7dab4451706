//! Built-in manifests.
//!
//! | name             | category | kind                  | depends on       |
//! |------------------|----------|-----------------------|------------------|
//! | `streams`        | streams  | remote                |                  |
//! | `activity-stats` | local    | inline                |                  |
//! | `peaks`          | local    | offloaded (pool)      | `streams`        |
//! | `training-load`  | local    | offloaded (aggregate) | `activity-stats` |

pub mod load;
pub mod peaks;
pub mod stats;

use std::sync::Arc;

use crate::manifest::{Manifest, ManifestRegistry, ProcessorConfig, RegistryError};
use crate::offload::{AggregateFactory, PoolFactory};

pub use load::TrainingLoad;
pub use peaks::PeakPower;
pub use stats::ActivityStats;

pub const STREAMS: &str = "streams";
pub const ACTIVITY_STATS: &str = "activity-stats";
pub const PEAKS: &str = "peaks";
pub const TRAINING_LOAD: &str = "training-load";

/// Streams fetched for every activity.
pub const DEFAULT_STREAMS: &[&str] = &["time", "watts", "heartrate", "distance", "altitude"];

/// Registry with every built-in manifest, config hashes computed from `config`.
pub fn default_registry(config: &ProcessorConfig) -> Result<ManifestRegistry, RegistryError> {
    let mut registry = ManifestRegistry::new();
    registry.register(Manifest::remote(STREAMS, 1, DEFAULT_STREAMS))?;
    registry.register(
        Manifest::inline(ACTIVITY_STATS, 1, Arc::new(ActivityStats::from_config(config)))
            .config_triggers(&["default_ftp"]),
    )?;
    registry.register(
        Manifest::offloaded(PEAKS, 1, Arc::new(PoolFactory::new(PeakPower::from_config(config))))
            .depends_on(&[STREAMS])
            .config_triggers(&["peak_periods"]),
    )?;
    registry.register(
        Manifest::offloaded(
            TRAINING_LOAD,
            1,
            Arc::new(AggregateFactory::new(TrainingLoad::from_config(config))),
        )
        .depends_on(&[ACTIVITY_STATS])
        .config_triggers(&["ctl_days", "atl_days"]),
    )?;
    Ok(registry.with_config(config))
}
