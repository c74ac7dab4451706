use clap::ValueEnum;
use pacer::RateLimiterGroup;
use pacer::rate_limit::LimiterStatus;

use super::shared::Env;
use crate::progress::format_ms;

/// Output format for tables.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub(crate) enum OutputFormat {
    /// Display as a formatted table (default)
    #[default]
    Table,
    /// Display as JSON
    Json,
}

/// Show the rate limit budget as last persisted by a sync.
pub(crate) async fn handle_limits(
    env: &Env<'_>,
    output: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let group = RateLimiterGroup::new(env.config.sync.rate_limits.clone());
    group.load(env.store.as_ref()).await?;

    let items: Vec<RateLimitDisplay> = group
        .status(group.now())
        .iter()
        .map(RateLimitDisplay::from)
        .collect();
    if items.is_empty() {
        println!("No rate limits configured.");
        return Ok(());
    }
    RateLimitDisplay::print_many(items, output)
}

/// Rate limit information for display.
#[derive(Debug, Clone, serde::Serialize, tabled::Tabled)]
pub(crate) struct RateLimitDisplay {
    #[tabled(rename = "Window")]
    pub window: String,
    #[tabled(rename = "Limit")]
    pub limit: u32,
    #[tabled(rename = "Used")]
    pub used: u32,
    #[tabled(rename = "Remaining")]
    pub remaining: u32,
    #[tabled(rename = "Usage %")]
    pub usage_percent: String,
    #[tabled(rename = "Resets In")]
    pub resets_in: String,
    #[tabled(rename = "Pause")]
    pub pause: String,
}

impl From<&LimiterStatus> for RateLimitDisplay {
    fn from(status: &LimiterStatus) -> Self {
        let usage_percent = if status.limit > 0 {
            (status.used as f64 / status.limit as f64) * 100.0
        } else {
            0.0
        };
        Self {
            window: status.label.clone(),
            limit: status.limit,
            used: status.used,
            remaining: status.limit.saturating_sub(status.used),
            usage_percent: format!("{usage_percent:.1}%"),
            resets_in: format_ms(status.resets_in_ms),
            pause: if status.suspend_ms > 0 {
                format_ms(status.suspend_ms)
            } else {
                "-".to_string()
            },
        }
    }
}

impl RateLimitDisplay {
    pub(crate) fn print_many(
        items: Vec<Self>,
        format: OutputFormat,
    ) -> Result<(), Box<dyn std::error::Error>> {
        match format {
            OutputFormat::Table => {
                let mut table = tabled::Table::new(items);
                table.with(tabled::settings::Style::rounded());
                println!("{}", table);
            }
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(&items)?);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(limit: u32, used: u32, suspend_ms: i64) -> LimiterStatus {
        LimiterStatus {
            label: "15 min".to_string(),
            period_ms: 900_000,
            limit,
            used,
            resets_in_ms: 125_000,
            suspend_ms,
        }
    }

    #[test]
    fn display_computes_remaining_and_usage() {
        let display = RateLimitDisplay::from(&status(100, 25, 0));
        assert_eq!(display.remaining, 75);
        assert_eq!(display.usage_percent, "25.0%");
        assert_eq!(display.resets_in, "2m 05s");
        assert_eq!(display.pause, "-");
    }

    #[test]
    fn exhausted_window_shows_pause() {
        let display = RateLimitDisplay::from(&status(10, 10, 60_000));
        assert_eq!(display.remaining, 0);
        assert_eq!(display.pause, "1m 00s");
    }

    #[test]
    fn zero_limit_does_not_divide_by_zero() {
        assert_eq!(RateLimitDisplay::from(&status(0, 0, 0)).usage_percent, "0.0%");
    }
}
