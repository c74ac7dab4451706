//! Subject management commands.
//!
//! Commands for managing tracked subjects (add, list, enable, disable, remove).

use std::io::{BufRead, Write};

use clap::Subcommand;
use console::style;
use tabled::{Table, Tabled, settings::Style};

use pacer::Subject;
use pacer::store::Store;

use super::limits::OutputFormat;
use super::shared::{Env, format_ts};

/// Subject management subcommands.
#[derive(Subcommand)]
pub enum SubjectAction {
    /// Track a new subject
    Add {
        /// Remote id of the subject
        id: i64,
        /// Display name
        name: String,
        /// The signed-in athlete (paged timeline) rather than a followed peer
        #[arg(long = "self")]
        is_self: bool,
        /// Add without scheduling syncs
        #[arg(long)]
        disabled: bool,
    },
    /// List tracked subjects
    List {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,
    },
    /// Resume scheduled syncs for a subject
    Enable {
        /// Subject id
        id: i64,
    },
    /// Pause scheduled syncs for a subject
    Disable {
        /// Subject id
        id: i64,
    },
    /// Stop tracking a subject
    ///
    /// Warning: This also deletes all of the subject's activities and streams.
    Remove {
        /// Subject id
        id: i64,

        /// Skip confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },
}

/// Display struct for subject listing.
#[derive(Debug, Clone, serde::Serialize, Tabled)]
struct SubjectDisplay {
    #[tabled(rename = "ID")]
    id: i64,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Kind")]
    kind: &'static str,
    #[tabled(rename = "Enabled")]
    enabled: bool,
    #[tabled(rename = "Last Sync")]
    last_sync: String,
    #[tabled(rename = "Last Error")]
    last_error: String,
}

impl From<&Subject> for SubjectDisplay {
    fn from(subject: &Subject) -> Self {
        Self {
            id: subject.id,
            name: subject.name.clone(),
            kind: if subject.is_self { "self" } else { "peer" },
            enabled: subject.enabled,
            last_sync: format_ts(subject.last_sync_ts),
            last_error: match (&subject.last_sync_error, subject.last_sync_error_ts) {
                (Some(error), ts) => format!("{} ({error})", format_ts(ts)),
                (None, _) => "-".to_string(),
            },
        }
    }
}

/// Handle subject management commands.
pub async fn handle_subject(
    action: SubjectAction,
    env: &Env<'_>,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = env.store.as_ref();
    match action {
        SubjectAction::Add {
            id,
            name,
            is_self,
            disabled,
        } => add_subject(store, id, &name, is_self, !disabled).await?,
        SubjectAction::List { output } => list_subjects(store, output).await?,
        SubjectAction::Enable { id } => set_enabled(store, id, true).await?,
        SubjectAction::Disable { id } => set_enabled(store, id, false).await?,
        SubjectAction::Remove { id, yes } => remove_subject(store, id, yes).await?,
    }
    Ok(())
}

async fn add_subject(
    store: &dyn Store,
    id: i64,
    name: &str,
    is_self: bool,
    enabled: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if store.get_subject(id).await?.is_some() {
        return Err(format!("Subject {id} already exists").into());
    }

    let mut subject = Subject::new(id, name, is_self, pacer::now_ms());
    subject.enabled = enabled;
    store.put_subject(&subject).await?;

    println!(
        "{} Added subject {} '{}' ({})",
        style("✓").green().bold(),
        style(id).cyan(),
        name,
        if is_self { "self" } else { "peer" }
    );
    Ok(())
}

async fn list_subjects(
    store: &dyn Store,
    output: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let subjects = store.list_subjects().await?;

    if subjects.is_empty() {
        println!("No subjects tracked.");
        println!();
        println!("Add one with:");
        println!("  pacer subject add 1001 \"Me\" --self");
        return Ok(());
    }

    let displays: Vec<SubjectDisplay> = subjects.iter().map(SubjectDisplay::from).collect();
    match output {
        OutputFormat::Table => {
            let mut table = Table::new(displays);
            table.with(Style::rounded());
            println!("{}", table);
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&displays)?);
        }
    }
    Ok(())
}

async fn set_enabled(
    store: &dyn Store,
    id: i64,
    enabled: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut subject = store
        .get_subject(id)
        .await?
        .ok_or_else(|| format!("Subject {id} not found"))?;
    subject.enabled = enabled;
    store.put_subject(&subject).await?;

    let state = if enabled { "enabled" } else { "disabled" };
    println!("{} Subject {} {state}", style("✓").green().bold(), style(id).cyan());
    Ok(())
}

async fn remove_subject(
    store: &dyn Store,
    id: i64,
    skip_confirm: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let subject = store
        .get_subject(id)
        .await?
        .ok_or_else(|| format!("Subject {id} not found"))?;

    if !skip_confirm {
        let activities = store.activities_for_subject(id).await?.len();
        println!(
            "{} About to remove subject {} '{}' and its {} activities",
            style("⚠").yellow().bold(),
            style(id).cyan(),
            subject.name,
            activities
        );
        if !confirm("Continue?")? {
            println!("Aborted.");
            return Ok(());
        }
    }

    let removed = store.delete_subject(id).await?;
    println!(
        "{} Removed subject {} ({} activities deleted)",
        style("✓").green().bold(),
        style(id).cyan(),
        removed
    );
    Ok(())
}

fn confirm(prompt: &str) -> std::io::Result<bool> {
    print!("{prompt} [y/N] ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}
