//! Pacer CLI - command-line interface for the activity sync engine.

mod commands;
mod config;
mod progress;
mod shutdown;

use clap::{Parser, Subcommand};
use console::Term;
use tracing_subscriber::EnvFilter;

use crate::commands::limits::OutputFormat;
use crate::commands::subject::SubjectAction;

#[derive(Parser)]
#[command(name = "pacer")]
#[command(version)]
#[command(about = "An incremental activity sync engine")]
#[command(
    long_about = "Pacer mirrors remote activity timelines into a local database and keeps \
derived analytics (activity stats, peak power, training load) up to date. Work is \
tracked per activity and per manifest, so only what changed is fetched or recomputed."
)]
#[command(after_long_help = r#"EXAMPLES
    Track your own timeline and a followed athlete:
        $ pacer subject add 1001 "Me" --self
        $ pacer subject add 2002 "Teammate"

    Sync one subject in the foreground:
        $ pacer sync 1001

    Keep every enabled subject in sync until Ctrl+C:
        $ pacer run

    Recompute peak power for every activity of a subject:
        $ pacer invalidate 1001 local peaks

    Generate shell completions:
        $ pacer completions bash > ~/.local/share/bash-completion/completions/pacer

CONFIGURATION
    Pacer reads configuration from:
      1. ~/.config/pacer/config.toml (or $XDG_CONFIG_HOME/pacer/config.toml)
      2. ./pacer.toml
      3. Environment variables (PACER_* prefix, e.g., PACER_FEED_TOKEN)
      4. .env file in current directory

ENVIRONMENT VARIABLES
    PACER_DATABASE_URL    Database connection string (default: ~/.local/state/pacer/pacer.db)
    PACER_FEED_URL        Base URL of the activity feed API
    PACER_FEED_TOKEN      Bearer token for the activity feed API
"#)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run database migrations
    Migrate {
        #[command(subcommand)]
        action: MigrateAction,
    },
    /// Manage tracked subjects
    Subject {
        #[command(subcommand)]
        action: SubjectAction,
    },
    /// Run one sync job for a subject in the foreground
    Sync {
        /// Subject id
        subject: i64,

        #[command(flatten)]
        refresh: RefreshArgs,
    },
    /// Keep every enabled subject in sync until Ctrl+C
    Run,
    /// Clear manifest state so the work is redone on the next job
    Invalidate {
        /// Subject id
        subject: i64,
        /// Manifest category (streams, local)
        category: pacer::SyncCategory,
        /// Manifest name; every manifest of the category when omitted
        name: Option<String>,
        /// Only clear state, don't run the follow-up job now
        #[arg(long)]
        no_sync: bool,
    },
    /// Show rate limit budget usage
    Limits {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,
    },
    /// Delete activities whose subject no longer exists
    Prune,
    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum MigrateAction {
    /// Apply all pending migrations
    Up,
    /// Rollback the last migration
    Down,
    /// Show migration status
    Status,
    /// Fresh install - drop all tables and reapply migrations
    Fresh,
}

/// Options for a single sync job.
#[derive(Debug, Clone, Copy, clap::Args)]
struct RefreshArgs {
    /// Re-scan the whole remote timeline instead of stopping at known activities
    #[arg(short = 'f', long, conflicts_with = "skip_discovery")]
    full: bool,

    /// Only process already-known activities
    #[arg(short = 's', long)]
    skip_discovery: bool,

    /// Retry failed work even if it is still backing off
    #[arg(short = 'b', long)]
    ignore_backoff: bool,
}

impl From<RefreshArgs> for pacer::sync::RefreshOptions {
    fn from(args: RefreshArgs) -> Self {
        Self {
            full_discovery: args.full,
            skip_discovery: args.skip_discovery,
            ignore_backoff: args.ignore_backoff,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // Structured logging when not attached to a terminal; progress bars otherwise
    if !Term::stdout().is_term() {
        let env_filter = match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => EnvFilter::new("pacer=info,pacer_cli=info"),
        };

        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
    }

    let config = config::Config::load();

    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        commands::meta::handle_completions(*shell)?;
        return Ok(());
    }

    let database_url = config
        .database_url()
        .ok_or(config::ConfigError::Missing { key: "database.url" })?;
    ensure_sqlite_dir(&database_url)?;

    match cli.command {
        Commands::Migrate { action } => {
            commands::migrate::handle_migrate(action, &database_url).await?;
        }
        Commands::Subject { action } => {
            let env = commands::shared::Env::open(&config, &database_url).await?;
            commands::subject::handle_subject(action, &env).await?;
        }
        Commands::Sync { subject, refresh } => {
            let env = commands::shared::Env::open(&config, &database_url).await?;
            commands::sync::handle_sync(&env, subject, refresh.into()).await?;
        }
        Commands::Run => {
            let env = commands::shared::Env::open(&config, &database_url).await?;
            commands::sync::handle_run(&env).await?;
        }
        Commands::Invalidate {
            subject,
            category,
            name,
            no_sync,
        } => {
            let env = commands::shared::Env::open(&config, &database_url).await?;
            commands::maintenance::handle_invalidate(&env, subject, category, name.as_deref(), no_sync)
                .await?;
        }
        Commands::Limits { output } => {
            let env = commands::shared::Env::open(&config, &database_url).await?;
            commands::limits::handle_limits(&env, output).await?;
        }
        Commands::Prune => {
            let env = commands::shared::Env::open(&config, &database_url).await?;
            commands::maintenance::handle_prune(&env).await?;
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

/// Create the parent directory of a file-backed SQLite database.
fn ensure_sqlite_dir(database_url: &str) -> std::io::Result<()> {
    let Some(db_path) = database_url.strip_prefix("sqlite://") else {
        return Ok(());
    };
    // Strip query parameters (e.g., ?mode=rwc) before path operations
    let db_path = db_path.split('?').next().unwrap_or(db_path);
    let db_path = std::path::Path::new(db_path);

    if db_path.is_relative() && !db_path.as_os_str().is_empty() {
        tracing::warn!(
            "Database path '{}' is relative - behavior depends on current directory. \
             Consider using an absolute path.",
            db_path.display()
        );
    }

    if let Some(parent) = db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}
