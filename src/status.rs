//! Checkpoint and output overview.
//!
//! `kb status` answers "where did the last run stop and how much is left":
//! the checkpoint watermark, how many fact hashes are known, how many facts
//! `knowledge.jsonl` holds, and how many source messages are still pending.
//! Nothing is written.

use anyhow::Result;
use serde::Serialize;
use std::path::PathBuf;

use crate::checkpoint::CheckpointStore;
use crate::config::Config;
use crate::knowledge_log::KnowledgeLog;
use crate::source::{MessageSource, SqliteSource};

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub checkpoint_path: PathBuf,
    pub checkpoint_present: bool,
    pub last_id: i64,
    pub seen_hashes: u64,
    pub knowledge_path: PathBuf,
    pub knowledge_facts: u64,
    pub knowledge_bytes: u64,
    pub malformed_lines: u64,
    /// `None` when the source could not be opened.
    pub pending_messages: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_error: Option<String>,
}

/// Collect the status report. A corrupt checkpoint is an error here.
pub async fn collect_status(config: &Config) -> Result<StatusReport> {
    let store = CheckpointStore::new(&config.state.state_dir, &config.state.state_file);
    let checkpoint = store.read()?;
    let checkpoint_present = checkpoint.is_some();
    let state = checkpoint.unwrap_or_default();

    let log = KnowledgeLog::new(config.knowledge_path());
    let scan = log.scan()?;
    let knowledge_bytes = std::fs::metadata(log.path()).map(|m| m.len()).unwrap_or(0);

    let (pending_messages, source_error) =
        match SqliteSource::open(&config.source.db_path, &config.source.table).await {
            Ok(source) => match source
                .count_messages(state.last_id, &config.message_filters())
                .await
            {
                Ok(n) => (Some(n), None),
                Err(e) => (None, Some(e.to_string())),
            },
            Err(e) => (None, Some(e.to_string())),
        };

    Ok(StatusReport {
        checkpoint_path: store.path().to_path_buf(),
        checkpoint_present,
        last_id: state.last_id,
        seen_hashes: state.seen_hashes.len() as u64,
        knowledge_path: log.path().to_path_buf(),
        knowledge_facts: scan.facts,
        knowledge_bytes,
        malformed_lines: scan.malformed_lines,
        pending_messages,
        source_error,
    })
}

/// Run the status command and print a summary.
pub async fn run_status(config: &Config, json: bool) -> Result<()> {
    let report = collect_status(config).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Knowledge Builder Status");
    println!("=========================");
    println!();
    println!("  Checkpoint:  {}", report.checkpoint_path.display());
    if report.checkpoint_present {
        println!("  Last id:     {}", report.last_id);
        println!("  Seen hashes: {}", report.seen_hashes);
    } else {
        println!("  Last id:     (no checkpoint; next run starts from the beginning)");
    }
    println!();
    println!("  Knowledge:   {}", report.knowledge_path.display());
    println!(
        "  Facts:       {} ({})",
        report.knowledge_facts,
        format_bytes(report.knowledge_bytes)
    );
    if report.malformed_lines > 0 {
        println!("  Malformed:   {} line(s) skipped", report.malformed_lines);
    }
    if report.knowledge_facts > report.seen_hashes {
        println!("  Note:        log holds facts the checkpoint does not; the next run reconciles them");
    }
    println!();
    match (report.pending_messages, &report.source_error) {
        (Some(n), _) => println!("  Pending:     {} message(s)", n),
        (None, Some(e)) => println!("  Pending:     unavailable ({})", e),
        (None, None) => println!("  Pending:     unavailable"),
    }
    println!();

    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
