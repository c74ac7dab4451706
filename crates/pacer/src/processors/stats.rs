//! `activity-stats`: per-activity summary metrics.

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::entity::prelude::{Activity, Subject};
use crate::manifest::{InlineProcessor, ProcessorConfig, ProcessorContext, ProcessorError};

/// Stats section written by this processor.
pub const SECTION: &str = "summary";

/// Summary metrics from the remote summary and the subject's FTP/weight history.
#[derive(Debug, Clone, Default)]
pub struct ActivityStats {
    /// FTP used when the subject has no history.
    default_ftp: Option<f64>,
}

impl ActivityStats {
    pub fn from_config(config: &ProcessorConfig) -> Self {
        Self {
            default_ftp: config.get("default_ftp").and_then(Value::as_f64),
        }
    }

    /// Compute the summary section for one activity.
    pub fn summarize(&self, activity: &Activity, subject: &Subject) -> Result<Value, String> {
        let duration = activity
            .summary_f64("moving_time")
            .or_else(|| activity.summary_f64("elapsed_time"))
            .filter(|d| *d > 0.0)
            .ok_or_else(|| "activity has no duration".to_string())?;

        let avg_power = activity.summary_f64("average_watts");
        let np = activity.summary_f64("weighted_average_watts").or(avg_power);
        let ftp = subject
            .ftp_at(activity.ts)
            .or(self.default_ftp)
            .filter(|f| *f > 0.0);
        let intensity = np.zip(ftp).map(|(np, ftp)| np / ftp);
        let tss = intensity
            .zip(np)
            .zip(ftp)
            .map(|((intensity, np), ftp)| duration * np * intensity / (ftp * 3600.0) * 100.0);
        let watts_per_kg = avg_power
            .zip(subject.weight_at(activity.ts).filter(|w| *w > 0.0))
            .map(|(p, w)| p / w);

        Ok(json!({
            "duration_s": duration,
            "distance_m": activity.summary_f64("distance"),
            "avg_power": avg_power,
            "normalized_power": np,
            "ftp": ftp,
            "intensity": intensity,
            "tss": tss,
            "watts_per_kg": watts_per_kg,
        }))
    }
}

#[async_trait]
impl InlineProcessor for ActivityStats {
    async fn process(&self, ctx: &mut ProcessorContext<'_>) -> Result<(), ProcessorError> {
        let mut failures = Vec::new();
        for activity in ctx.activities.iter_mut() {
            if ctx.cancel.is_cancelled() {
                return Err(ProcessorError::Cancelled);
            }
            match self.summarize(activity, ctx.subject) {
                Ok(section) => activity.set_stats_section(SECTION, section),
                Err(message) => failures.push((activity.id, message)),
            }
        }
        for (id, message) in failures {
            ctx.record_error(id, message);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::prelude::ActivityKind;
    use crate::manifest::Manifest;
    use crate::store::MemoryStore;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn ride(id: i64, summary: Value) -> Activity {
        let mut a = Activity::new(id, 1, 10_000, ActivityKind::Ride, "ride");
        a.summary = summary;
        a
    }

    #[test]
    fn tss_uses_ftp_in_effect() {
        let mut subject = Subject::new(1, "Ada", true, 0);
        subject.push_ftp(0, 250.0);
        subject.push_weight(0, 62.5);

        let stats = ActivityStats::default()
            .summarize(
                &ride(1, json!({"moving_time": 3600.0, "average_watts": 200.0, "weighted_average_watts": 250.0})),
                &subject,
            )
            .unwrap();

        assert_eq!(stats["intensity"], json!(1.0));
        assert_eq!(stats["tss"], json!(100.0));
        assert_eq!(stats["watts_per_kg"], json!(3.2));
    }

    #[test]
    fn missing_ftp_leaves_tss_empty_unless_defaulted() {
        let subject = Subject::new(1, "Ada", true, 0);
        let activity = ride(1, json!({"moving_time": 1800.0, "average_watts": 200.0}));

        let stats = ActivityStats::default().summarize(&activity, &subject).unwrap();
        assert!(stats["tss"].is_null());

        let config = ProcessorConfig::from([("default_ftp".to_string(), json!(200.0))]);
        let stats = ActivityStats::from_config(&config).summarize(&activity, &subject).unwrap();
        assert_eq!(stats["tss"], json!(50.0));
    }

    #[tokio::test]
    async fn process_records_per_activity_errors() {
        let processor = Arc::new(ActivityStats::default());
        let manifest = Manifest::inline("activity-stats", 1, processor.clone());
        let subject = Subject::new(1, "Ada", true, 0);
        let cancel = CancellationToken::new();
        let store = MemoryStore::new();
        let mut activities = vec![ride(1, json!({"elapsed_time": 60.0})), ride(2, json!({}))];

        let mut ctx = ProcessorContext::new(&manifest, &mut activities, &subject, &cancel, &store);
        processor.process(&mut ctx).await.unwrap();

        assert_eq!(ctx.errors().len(), 1);
        assert!(ctx.errors().contains_key(&2));
        drop(ctx);
        assert_eq!(activities[0].stats[SECTION]["duration_s"], json!(60.0));
    }
}
