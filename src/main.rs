//! # Knowledge Builder CLI (`kb`)
//!
//! The `kb` binary mines source-grounded knowledge statements from a SQLite
//! chat-message table, batch by batch, and can be stopped and resumed at any
//! batch boundary.
//!
//! ## Usage
//!
//! ```bash
//! kb --config ./config/kb.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kb run` | Extract facts from all messages after the checkpoint |
//! | `kb run --dry-run` | Count pending messages and planned batches only |
//! | `kb status` | Show checkpoint, output, and pending-message counts |
//!
//! ## Examples
//!
//! ```bash
//! # Offline smoke run against the first 200 rows
//! kb run --backend mock --limit-rows 200
//!
//! # Live run, restarting from scratch
//! KB_API_KEY=... kb run --backend live --no-resume
//!
//! # Only one topic, JSON progress lines on stderr
//! kb run --filter-topic-id 42 --progress json
//! ```
//!
//! `kb run` prints exactly one JSON object on stdout: the run report.
//! Logs and progress go to stderr.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use knowledge_builder::config::{self, Backend, RunOverrides};
use knowledge_builder::coordinator::KnowledgeBuilder;
use knowledge_builder::progress::ProgressMode;
use knowledge_builder::status;

/// Knowledge Builder CLI: incremental, resumable fact extraction from chat
/// message tables.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/kb.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "kb",
    about = "Knowledge Builder: incremental, resumable fact extraction from chat message tables",
    version,
    long_about = "Knowledge Builder reads chat messages from a SQLite table in id order, \
    groups them into token-budgeted batches, asks a language model for short source-grounded \
    statements, validates and deduplicates the answers, and appends them to knowledge.jsonl. \
    Progress is checkpointed after every batch."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/kb.toml")]
    config: PathBuf,

    /// Debug-level logs (overridden by RUST_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Extract facts from every message after the checkpoint.
    ///
    /// Batches are processed one at a time; the checkpoint is saved after
    /// each. Interrupting and re-running continues where it stopped.
    Run {
        #[command(flatten)]
        overrides: RunArgs,

        /// Plan batches and count messages without calling a model or writing state.
        #[arg(long)]
        dry_run: bool,

        /// Progress output on stderr: human, json, or off.
        ///
        /// Defaults to human when stderr is a terminal, otherwise off.
        #[arg(long)]
        progress: Option<ProgressMode>,
    },

    /// Show checkpoint watermark, known facts, and pending messages.
    Status {
        /// Print the status as JSON.
        #[arg(long)]
        json: bool,
    },
}

/// Per-run overrides of the configuration file.
#[derive(Args)]
struct RunArgs {
    /// Source table name.
    #[arg(long)]
    table: Option<String>,
    /// Read at most this many rows after the checkpoint.
    #[arg(long)]
    limit_rows: Option<usize>,
    /// Skip messages shorter than this many characters.
    #[arg(long)]
    min_text_len: Option<usize>,
    /// Only messages with this topic id.
    #[arg(long)]
    filter_topic_id: Option<i64>,
    /// Only messages whose topic title contains this text.
    #[arg(long)]
    filter_topic_title_contains: Option<String>,
    #[arg(long)]
    output_dir: Option<PathBuf>,
    #[arg(long)]
    state_dir: Option<PathBuf>,
    /// Require resuming from the checkpoint; a corrupt checkpoint is an error.
    #[arg(long, conflicts_with = "no_resume")]
    resume: bool,
    /// Ignore the checkpoint and start from the first message.
    #[arg(long)]
    no_resume: bool,
    /// Model backend: mock or live.
    #[arg(long)]
    backend: Option<Backend>,
    #[arg(long)]
    primary_model: Option<String>,
    #[arg(long, conflicts_with = "no_fallback")]
    fallback_model: Option<String>,
    /// Disable fallback escalation.
    #[arg(long)]
    no_fallback: bool,
    #[arg(long)]
    temperature: Option<f32>,
    /// Repair attempts per model after an invalid answer.
    #[arg(long)]
    max_repairs: Option<u32>,
    /// Extra guidance appended to every prompt.
    #[arg(long)]
    hints: Option<String>,
}

impl From<RunArgs> for RunOverrides {
    fn from(a: RunArgs) -> Self {
        let resume = if a.resume {
            Some(true)
        } else if a.no_resume {
            Some(false)
        } else {
            None
        };
        RunOverrides {
            table: a.table,
            limit_rows: a.limit_rows,
            min_text_len: a.min_text_len,
            filter_topic_id: a.filter_topic_id,
            filter_topic_title_contains: a.filter_topic_title_contains,
            output_dir: a.output_dir,
            state_dir: a.state_dir,
            resume,
            backend: a.backend,
            primary_model: a.primary_model,
            fallback_model: a.fallback_model,
            no_fallback: a.no_fallback,
            temperature: a.temperature,
            max_repairs: a.max_repairs,
            hints: a.hints,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "knowledge_builder=debug"
    } else {
        "knowledge_builder=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut cfg = config::load_config(&cli.config)?;
    if let Some(ref path) = cfg.model.dotenv_path {
        if let Err(e) = dotenvy::from_path(path) {
            tracing::warn!(path = %path.display(), error = %e, "could not load dotenv file");
        }
    }
    let _ = dotenvy::dotenv();

    match cli.command {
        Commands::Run {
            overrides,
            dry_run,
            progress,
        } => {
            cfg.apply_overrides(&overrides.into());
            cfg.validate()?;

            let builder = KnowledgeBuilder::from_config(&cfg).await?;

            if dry_run {
                let report = builder.plan_only(cfg.resume_mode()).await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
                return Ok(());
            }

            let mode = progress.unwrap_or_else(ProgressMode::default_for_tty);
            let report = builder
                .with_progress(mode.reporter())
                .run(cfg.resume_mode())
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Status { json } => {
            status::run_status(&cfg, json).await?;
        }
    }

    Ok(())
}
