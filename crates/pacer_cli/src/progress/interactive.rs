use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use pacer::sync::{JobStatus, LogLevel, ProgressSnapshot, RateLimitNotice};

use super::format_ms;

/// Interactive progress reporter using indicatif.
///
/// Each subject gets one line: a spinner while connecting and discovering, turned
/// into a bar over the subject's activities once processing starts.
pub struct InteractiveReporter {
    multi: MultiProgress,
    bars: Mutex<HashMap<i64, ProgressBar>>,
}

impl InteractiveReporter {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
        }
    }

    fn bars(&self) -> MutexGuard<'_, HashMap<i64, ProgressBar>> {
        self.bars.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn bar(&self, bars: &mut HashMap<i64, ProgressBar>, subject_id: i64) -> ProgressBar {
        bars.entry(subject_id)
            .or_insert_with(|| {
                let bar = self.multi.add(ProgressBar::new_spinner());
                bar.set_style(Self::spinner_style());
                bar.set_prefix(format!("{subject_id:>10}"));
                bar.enable_steady_tick(Duration::from_millis(100));
                bar
            })
            .clone()
    }

    pub fn on_status(&self, subject_id: i64, status: JobStatus) {
        let mut bars = self.bars();
        let bar = self.bar(&mut bars, subject_id);
        match status {
            JobStatus::Complete => {
                bar.finish_with_message(format!("{} complete", style("✓").green().bold()));
                bars.remove(&subject_id);
            }
            JobStatus::Error => {
                bar.abandon_with_message(format!("{} failed", style("✗").red().bold()));
                bars.remove(&subject_id);
            }
            JobStatus::Cancelled => {
                bar.abandon_with_message(format!("{} cancelled", style("⚠").yellow().bold()));
                bars.remove(&subject_id);
            }
            other => bar.set_message(format!("{other}...")),
        }
    }

    pub fn on_progress(&self, progress: &ProgressSnapshot) {
        let mut bars = self.bars();
        let bar = self.bar(&mut bars, progress.subject_id);
        if bar.length().is_none() {
            bar.disable_steady_tick();
            bar.set_style(Self::bar_style());
        }
        bar.set_length(progress.total as u64);
        bar.set_position(progress.completed as u64);

        let mut message = format!(
            "{} streams, {} local pending",
            progress.streams_pending, progress.local_pending
        );
        if progress.errored > 0 {
            message.push_str(&format!(", {}", style(format!("{} errors", progress.errored)).red()));
        }
        bar.set_message(message);
    }

    pub fn on_rate_limit(&self, notice: &RateLimitNotice) {
        let line = match notice {
            RateLimitNotice::Suspending {
                subject_id,
                suspend_ms,
            } => format!(
                "{} [{subject_id}] Rate limit budget exhausted, pausing for {}",
                style("⏸").yellow(),
                format_ms(*suspend_ms)
            ),
            RateLimitNotice::Retrying {
                subject_id,
                attempt,
                message,
                ..
            } => format!(
                "{} [{subject_id}] Retry {attempt}: {message}",
                style("↻").yellow()
            ),
        };
        self.multi.println(line).ok();
    }

    pub fn on_log(&self, subject_id: i64, level: LogLevel, message: &str) {
        let marker = match level {
            LogLevel::Debug | LogLevel::Info => return,
            LogLevel::Warn => style("⚠").yellow().bold(),
            LogLevel::Error => style("✗").red().bold(),
        };
        self.multi
            .println(format!("{marker} [{subject_id}] {message}"))
            .ok();
    }

    /// Finish all progress bars.
    pub fn finish(&self) {
        for (_, bar) in self.bars().drain() {
            if !bar.is_finished() {
                bar.finish();
            }
        }
    }

    fn spinner_style() -> ProgressStyle {
        ProgressStyle::default_spinner()
            .template("{prefix:.bold.cyan} {spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
    }

    fn bar_style() -> ProgressStyle {
        ProgressStyle::default_bar()
            .template("{prefix:.bold.cyan} [{bar:40.cyan/blue}] {pos:>4}/{len:4} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓░")
    }
}

impl Default for InteractiveReporter {
    fn default() -> Self {
        Self::new()
    }
}
