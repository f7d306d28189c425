//! siphon - keep an embedding pipeline in step with LMS content.
//!
//! `sync` turns content changes into jobs; `claim`/`drain` hand jobs to a
//! downstream pipeline; `kind` toggles which content kinds are indexed.

use anyhow::Result;
use clap::{Parser, Subcommand};
use siphon_db::JobState;
use siphon_ids::JobId;
use std::path::PathBuf;
use std::process::ExitCode;

mod cli;

#[derive(Parser, Debug)]
#[command(name = "siphon", version, about = "Sync LMS content into embedding jobs")]
struct Cli {
    /// Enable verbose logging (info/debug to stderr)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Configuration file (default: ~/.siphon/config.toml)
    #[arg(long, global = true, env = "SIPHON_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database (overrides the configured path)
    #[arg(long, global = true, env = "SIPHON_DATABASE")]
    database: Option<PathBuf>,

    /// JSON snapshot of the source to read content from
    #[arg(long, global = true, env = "SIPHON_MANIFEST")]
    manifest: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the sync engine once: apply kind toggles, enqueue changes and deletes
    Sync {
        /// Ignore the minimum interval between runs
        #[arg(long)]
        force: bool,

        /// Output the run report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Lease jobs and print their work items as JSON lines
    Claim {
        /// Maximum jobs to lease (default: claim.claim_limit)
        #[arg(short = 'n', long)]
        limit: Option<i64>,
    },

    /// Claim, deliver to a JSONL file and acknowledge until the queue is empty
    Drain {
        /// Jobs per claim cycle (default: claim.claim_limit)
        #[arg(short = 'n', long)]
        limit: Option<i64>,

        /// Append work items here instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Mark a claimed job done
    Ack {
        job_id: JobId,
    },

    /// Record a failed attempt for a claimed job
    Fail {
        job_id: JobId,

        /// Error message to store on the job
        #[arg(short, long)]
        message: String,

        /// Move the job straight to error
        #[arg(long)]
        no_retry: bool,
    },

    /// List jobs, newest first
    Jobs {
        /// Filter by state (pending, running, done, error, superseded)
        #[arg(long, value_parser = parse_state)]
        state: Option<JobState>,

        /// Filter by content kind
        #[arg(long)]
        kind: Option<String>,

        #[arg(short = 'n', long, default_value = "50")]
        limit: i64,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Enable, disable or inspect content kinds
    Kind {
        #[command(subcommand)]
        action: KindAction,
    },

    /// Show queue counts, last run and provider cursors
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug)]
enum KindAction {
    /// List known kinds and their effective flag
    List {
        #[arg(long)]
        json: bool,
    },
    /// Enable a kind; the next sync rebuilds it from scratch
    Enable { kind: String },
    /// Disable a kind; the next sync deletes its indexed content
    Disable { kind: String },
    /// Drop the operator override so the configured default applies
    Clear { kind: String },
}

fn parse_state(raw: &str) -> std::result::Result<JobState, String> {
    JobState::parse(&raw.trim().to_ascii_lowercase()).ok_or_else(|| {
        let states: Vec<&str> = JobState::ALL.iter().map(|s| s.as_str()).collect();
        format!("unknown state '{}', expected one of: {}", raw, states.join(", "))
    })
}

async fn run_command(cli: Cli) -> Result<()> {
    let args = cli::context::ContextArgs {
        config: cli.config,
        database: cli.database,
        manifest: cli.manifest,
    };
    let ctx = cli::context::Context::open(&args).await?;

    match cli.command {
        Commands::Sync { force, json } => cli::sync::run(&ctx, force, json).await,
        Commands::Claim { limit } => cli::claim::run_claim(&ctx, limit).await,
        Commands::Drain { limit, out } => cli::claim::run_drain(&ctx, limit, out).await,
        Commands::Ack { job_id } => cli::claim::run_ack(&ctx, job_id).await,
        Commands::Fail {
            job_id,
            message,
            no_retry,
        } => cli::claim::run_fail(&ctx, job_id, &message, !no_retry).await,
        Commands::Jobs {
            state,
            kind,
            limit,
            json,
        } => {
            let args = cli::jobs::JobsArgs {
                state,
                kind,
                limit,
                json,
            };
            cli::jobs::run(&ctx, args).await
        }
        Commands::Kind { action } => match action {
            KindAction::List { json } => cli::kind::run_list(&ctx, json).await,
            KindAction::Enable { kind } => cli::kind::run_set(&ctx, &kind, true).await,
            KindAction::Disable { kind } => cli::kind::run_set(&ctx, &kind, false).await,
            KindAction::Clear { kind } => cli::kind::run_clear(&ctx, &kind).await,
        },
        Commands::Status { json } => cli::status::run(&ctx, json).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let _log_guard = match siphon_logging::init_logging(siphon_logging::LogConfig {
        app_name: "siphon",
        verbose: cli.verbose,
        log_dir: None,
    }) {
        Ok(guard) => Some(guard),
        Err(err) => {
            eprintln!("Warning: failed to initialize logging: {:#}", err);
            None
        }
    };

    match run_command(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{:?}", err);
            ExitCode::from(1)
        }
    }
}
