//! Foreground sync commands: one job, or the scheduling loop.

use std::sync::Arc;

use console::{Term, style};
use pacer::store::Store;
use pacer::sync::{RefreshOptions, SyncManager, SyncSupervisor};

use super::shared::{Env, report_outcome};
use crate::progress::ProgressReporter;
use crate::shutdown::setup_shutdown_handler;

/// Run one job for `subject_id`; Ctrl+C cancels it.
pub(crate) async fn handle_sync(
    env: &Env<'_>,
    subject_id: i64,
    options: RefreshOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    let reporter = Arc::new(ProgressReporter::new());
    let manager = env.manager(reporter.as_observer())?;
    run_job(&manager, &reporter, subject_id, options).await
}

/// Run a job through `manager`, cancelling it on Ctrl+C, and report the outcome.
pub(crate) async fn run_job(
    manager: &Arc<SyncManager>,
    reporter: &ProgressReporter,
    subject_id: i64,
    options: RefreshOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = setup_shutdown_handler();
    let watcher = tokio::spawn({
        let manager = Arc::clone(manager);
        async move {
            shutdown.cancelled().await;
            manager.cancel(subject_id);
        }
    });

    let result = manager.run_once(subject_id, options).await;
    watcher.abort();
    reporter.finish();

    report_outcome(&result?)
}

/// Keep every enabled subject in sync until Ctrl+C.
pub(crate) async fn handle_run(env: &Env<'_>) -> Result<(), Box<dyn std::error::Error>> {
    let subjects = env.store.list_subjects().await?;
    let enabled = subjects.iter().filter(|s| s.enabled).count();
    if enabled == 0 {
        println!("No enabled subjects. Add one with: pacer subject add <id> <name>");
        return Ok(());
    }
    let owner = subjects
        .iter()
        .find(|s| s.is_self && s.enabled)
        .map_or(0, |s| s.id);

    let shutdown = setup_shutdown_handler();
    let reporter = Arc::new(ProgressReporter::new());
    let manager = env.manager(reporter.as_observer())?;

    if Term::stdout().is_term() {
        println!(
            "{} Syncing {} subjects, press Ctrl+C to stop",
            style("▶").green().bold(),
            style(enabled).cyan()
        );
    } else {
        tracing::info!(subjects = enabled, "Sync manager starting");
    }

    let supervisor = SyncSupervisor::new();
    supervisor.start(owner, manager).await;
    shutdown.cancelled().await;
    supervisor.stop().await;
    reporter.finish();

    Ok(())
}
