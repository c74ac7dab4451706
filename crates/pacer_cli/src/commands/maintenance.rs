//! Repair commands: manual invalidation and orphan pruning.

use std::sync::Arc;

use console::style;
use pacer::SyncCategory;
use pacer::store::Store;
use pacer::sync::RefreshOptions;

use super::shared::Env;
use super::sync::run_job;
use crate::progress::ProgressReporter;

/// Clear manifest state for a subject, then run the follow-up job unless told not to.
pub(crate) async fn handle_invalidate(
    env: &Env<'_>,
    subject_id: i64,
    category: SyncCategory,
    name: Option<&str>,
    no_sync: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let reporter = Arc::new(ProgressReporter::new());
    let manager = env.manager(reporter.as_observer())?;

    let changed = manager.invalidate(subject_id, category, name).await?;
    let target = match name {
        Some(name) => format!("{category}/{name}"),
        None => format!("all {category} manifests"),
    };
    println!(
        "{} Cleared {target} on {} activities of subject {}",
        style("✓").green().bold(),
        changed,
        style(subject_id).cyan()
    );

    if no_sync || changed == 0 {
        return Ok(());
    }
    let options = manager
        .pending()
        .into_iter()
        .find(|(id, _)| *id == subject_id)
        .map_or(
            RefreshOptions {
                skip_discovery: true,
                ..RefreshOptions::default()
            },
            |(_, options)| options,
        );
    run_job(&manager, &reporter, subject_id, options).await
}

pub(crate) async fn handle_prune(env: &Env<'_>) -> Result<(), Box<dyn std::error::Error>> {
    let removed = env.store.delete_orphans().await?;
    if removed == 0 {
        println!("No orphaned activities.");
    } else {
        println!(
            "{} Removed {} orphaned activities",
            style("✓").green().bold(),
            removed
        );
    }
    Ok(())
}
