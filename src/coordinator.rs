//! Run coordinator.
//!
//! Wires the pieces into the top-level loop:
//!
//! ```text
//! load checkpoint ─► reconcile with knowledge.jsonl ─► fetch id > last_id
//!       ─► plan batches ─► for each batch:
//!              driver ─► dedup by hash ─► append facts ─► save checkpoint
//!       ─► RunReport (stdout + summary_<ts>.json)
//! ```
//!
//! Batches run strictly one at a time, in id order. The checkpoint state is
//! an explicit value threaded through [`KnowledgeBuilder::process_batch`]
//! and persisted after every batch, so a crash loses at most the batch in
//! flight. Facts are appended before the checkpoint is saved; the hashes of
//! a batch that was appended but not checkpointed are recovered from the
//! log on the next start.
//!
//! After a transport failure the watermark is frozen for the rest of the
//! run (or the run stops, depending on [`TransportErrorPolicy`]), so
//! `last_id` never moves past a batch that has not fully completed.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audit::AuditLog;
use crate::checkpoint::{write_json_atomic, CheckpointState, CheckpointStore, ResumeMode};
use crate::config::{Config, TransportErrorPolicy};
use crate::driver::{BatchFailure, DriverSettings, ExtractionDriver};
use crate::knowledge_log::KnowledgeLog;
use crate::llm::{create_client, ModelClient};
use crate::models::{parse_source_id, CandidateFact, Fact, FactMeta, Message, RunSummary};
use crate::planner::{plan, retain_eligible, Batch, BatchLimits};
use crate::progress::{BatchStatus, NoProgress, RunProgressEvent, RunProgressReporter};
use crate::source::{MessageFilters, MessageSource, SqliteSource};

/// What `kb run` prints on stdout and writes to `summary_<ts>.json`.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    #[serde(flatten)]
    pub summary: RunSummary,
    pub run_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub resumed_from: i64,
    /// Set when the run ended early on a transport error under the `stop` policy.
    pub stopped_early: bool,
    pub backend: String,
    pub primary_model: String,
    pub fallback_model: Option<String>,
    pub source: String,
    pub knowledge_path: PathBuf,
    pub checkpoint_path: PathBuf,
    pub raw_dir: PathBuf,
    pub summary_path: Option<PathBuf>,
}

/// What `kb run --dry-run` prints.
#[derive(Debug, Clone, Serialize)]
pub struct DryRunReport {
    pub resumed_from: i64,
    pub pending_messages: u64,
    pub eligible_messages: u64,
    pub batches: u64,
    pub estimated_tokens: u64,
    pub largest_batch: u64,
}

/// How one batch ended.
#[derive(Debug)]
pub enum BatchResult {
    Completed { new_facts: u64, duplicates: u64 },
    Failed(BatchFailure),
}

pub struct KnowledgeBuilder {
    source: Arc<dyn MessageSource>,
    driver: ExtractionDriver,
    store: CheckpointStore,
    log: KnowledgeLog,
    audit: AuditLog,
    filters: MessageFilters,
    limits: BatchLimits,
    policy: TransportErrorPolicy,
    progress: Box<dyn RunProgressReporter>,
    output_dir: PathBuf,
    run_id: String,
    run_ts: String,
}

impl KnowledgeBuilder {
    pub fn new(
        config: &Config,
        source: Arc<dyn MessageSource>,
        client: Arc<dyn ModelClient>,
    ) -> Self {
        let run_ts = Utc::now().format("%Y%m%dT%H%M%S%3fZ").to_string();
        let audit = AuditLog::new(config.raw_dir(), run_ts.clone());
        Self {
            source,
            driver: ExtractionDriver::new(client, DriverSettings::from_config(config))
                .with_audit(audit.clone()),
            store: CheckpointStore::new(&config.state.state_dir, &config.state.state_file),
            log: KnowledgeLog::new(config.knowledge_path()),
            audit,
            filters: config.message_filters(),
            limits: config.batch_limits(),
            policy: config.run.on_transport_error,
            progress: Box::new(NoProgress),
            output_dir: config.output.output_dir.clone(),
            run_id: Uuid::new_v4().to_string(),
            run_ts,
        }
    }

    /// Open the configured SQLite source and model backend.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let source = SqliteSource::open(&config.source.db_path, &config.source.table)
            .await
            .context("Failed to open message source")?;
        let client = create_client(&config.model)?;
        Ok(Self::new(config, Arc::new(source), client))
    }

    pub fn with_progress(mut self, progress: Box<dyn RunProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Process every pending batch and report.
    pub async fn run(&self, resume: ResumeMode) -> Result<RunReport> {
        let started_at = Utc::now().to_rfc3339();
        let clock = Instant::now();

        let mut state = self.store.load(resume)?;
        self.reconcile(&mut state)?;
        self.store.save(&state)?;
        let resumed_from = state.last_id;

        let messages = self
            .source
            .fetch_messages(state.last_id, &self.filters)
            .await
            .context("Failed to read messages")?;
        let messages = retain_eligible(messages, self.filters.min_text_len);
        let batches: Vec<Batch<'_>> = plan(&messages, self.limits).collect();

        info!(
            run_id = %self.run_id,
            source = %self.source.describe(),
            resumed_from,
            messages = messages.len(),
            batches = batches.len(),
            "starting run"
        );
        // Total is what the batches will cover, not the raw pending count.
        self.progress.report(RunProgressEvent::Planned {
            messages: messages.len() as u64,
            batches: batches.len() as u64,
            resumed_from,
        });

        let mut summary = RunSummary {
            last_id: state.last_id,
            ..Default::default()
        };
        let mut watermark_open = true;
        let mut stopped_early = false;
        let mut messages_done = 0u64;

        for batch in &batches {
            let (next, result) = self.process_batch(state, batch, watermark_open).await?;
            state = next;
            messages_done += batch.len() as u64;

            let (status, new_facts) = match result {
                BatchResult::Completed {
                    new_facts,
                    duplicates,
                } => {
                    summary.batches += 1;
                    summary.accepted_facts += new_facts;
                    summary.duplicates_skipped += duplicates;
                    if new_facts == 0 {
                        summary.empty_batches += 1;
                        (BatchStatus::Empty, 0)
                    } else {
                        (BatchStatus::Accepted, new_facts)
                    }
                }
                BatchResult::Failed(_) => {
                    summary.errors += 1;
                    watermark_open = false;
                    (BatchStatus::Failed, 0)
                }
            };

            self.progress.report(RunProgressEvent::BatchDone {
                batch: batch.index as u64 + 1,
                batches: batches.len() as u64,
                first_id: batch.first_id(),
                last_id: batch.last_id(),
                messages_done,
                messages: messages.len() as u64,
                new_facts,
                status,
                elapsed: clock.elapsed(),
            });

            if status == BatchStatus::Failed && self.policy == TransportErrorPolicy::Stop {
                warn!(batch = batch.index, "stopping after transport error");
                stopped_early = true;
                break;
            }
        }

        summary.last_id = state.last_id;

        let mut report = RunReport {
            summary,
            run_id: self.run_id.clone(),
            started_at,
            finished_at: Utc::now().to_rfc3339(),
            resumed_from,
            stopped_early,
            backend: self.driver.backend_name().to_string(),
            primary_model: self.driver.settings().primary_model.clone(),
            fallback_model: self.driver.settings().fallback_model.clone(),
            source: self.source.describe(),
            knowledge_path: self.log.path().to_path_buf(),
            checkpoint_path: self.store.path().to_path_buf(),
            raw_dir: self.audit.raw_dir().to_path_buf(),
            summary_path: None,
        };

        let summary_path = self.output_dir.join(format!("summary_{}.json", self.run_ts));
        match write_json_atomic(&summary_path, &report) {
            Ok(()) => report.summary_path = Some(summary_path),
            Err(e) => warn!(path = %summary_path.display(), error = %e, "failed to write run summary"),
        }

        info!(
            batches = report.summary.batches,
            accepted = report.summary.accepted_facts,
            empty = report.summary.empty_batches,
            errors = report.summary.errors,
            last_id = report.summary.last_id,
            "run finished"
        );
        Ok(report)
    }

    /// Run one batch against `state` and return the updated state.
    ///
    /// On completion the new facts are appended to the log, their hashes
    /// recorded, the watermark moved to the batch's last id when
    /// `advance_watermark` is set, and the checkpoint saved. On transport
    /// failure `state` comes back unchanged.
    pub async fn process_batch(
        &self,
        mut state: CheckpointState,
        batch: &Batch<'_>,
        advance_watermark: bool,
    ) -> Result<(CheckpointState, BatchResult)> {
        let outcome = match self.driver.run(batch).await {
            Ok(outcome) => outcome,
            Err(failure) => {
                error!(
                    batch = batch.index,
                    first_id = batch.first_id(),
                    last_id = batch.last_id(),
                    error = %failure,
                    "batch failed; checkpoint not advanced"
                );
                return Ok((state, BatchResult::Failed(failure)));
            }
        };

        let ts = Utc::now().to_rfc3339();
        let (facts, duplicates) = accept_facts(&state, &outcome.facts, batch, &ts);

        self.log
            .append(&facts)
            .with_context(|| format!("Failed to append to {}", self.log.path().display()))?;
        for fact in &facts {
            state.remember(fact.hash.clone());
        }
        if advance_watermark {
            state.advance_to(batch.last_id());
        }
        self.store
            .save(&state)
            .context("Failed to save checkpoint")?;

        info!(
            batch = batch.index,
            first_id = batch.first_id(),
            last_id = batch.last_id(),
            candidates = outcome.facts.len(),
            accepted = facts.len(),
            duplicates,
            from = ?outcome.accepted_from,
            "batch done"
        );

        Ok((
            state,
            BatchResult::Completed {
                new_facts: facts.len() as u64,
                duplicates,
            },
        ))
    }

    /// Count what a run would do, without calling any model or writing state.
    pub async fn plan_only(&self, resume: ResumeMode) -> Result<DryRunReport> {
        let state = self.store.load(resume)?;
        let pending = self
            .source
            .count_messages(state.last_id, &self.filters)
            .await?;
        let messages = self
            .source
            .fetch_messages(state.last_id, &self.filters)
            .await?;
        let messages = retain_eligible(messages, self.filters.min_text_len);

        let mut report = DryRunReport {
            resumed_from: state.last_id,
            pending_messages: pending,
            eligible_messages: messages.len() as u64,
            batches: 0,
            estimated_tokens: 0,
            largest_batch: 0,
        };
        for batch in plan(&messages, self.limits) {
            report.batches += 1;
            report.estimated_tokens += batch.estimated_tokens as u64;
            report.largest_batch = report.largest_batch.max(batch.len() as u64);
        }
        Ok(report)
    }

    /// Fold hashes already in the output log into `state`.
    fn reconcile(&self, state: &mut CheckpointState) -> Result<()> {
        let scan = self
            .log
            .scan()
            .with_context(|| format!("Failed to read {}", self.log.path().display()))?;
        let recovered = state.merge_hashes(scan.hashes);
        if recovered > 0 {
            warn!(
                recovered,
                "knowledge log had facts missing from the checkpoint; merged their hashes"
            );
        }
        Ok(())
    }
}

/// Turn validated candidates into new facts, skipping any hash already
/// seen in `state` or earlier in the same batch.
pub fn accept_facts(
    state: &CheckpointState,
    candidates: &[CandidateFact],
    batch: &Batch<'_>,
    ts: &str,
) -> (Vec<Fact>, u64) {
    let by_id = batch.by_id();
    let mut batch_hashes = HashSet::new();
    let mut facts = Vec::new();
    let mut duplicates = 0u64;

    for candidate in candidates {
        let hash = candidate.stable_hash();
        if state.has_seen(&hash) || !batch_hashes.insert(hash.clone()) {
            duplicates += 1;
            continue;
        }
        facts.push(Fact {
            statement: candidate.statement.clone(),
            sources: candidate.sources.clone(),
            category: candidate.category.clone(),
            meta: derive_meta(candidate, &by_id, ts),
            hash,
        });
    }

    (facts, duplicates)
}

/// Aggregate source metadata. Lists are unique and sorted; single-valued
/// topic fields are used only when every source agrees.
fn derive_meta(fact: &CandidateFact, by_id: &HashMap<i64, &Message>, ts: &str) -> FactMeta {
    let ids: BTreeSet<i64> = fact
        .sources
        .iter()
        .filter_map(|s| parse_source_id(&s.source_id))
        .collect();

    let mut dates = BTreeSet::new();
    let mut topic_ids = BTreeSet::new();
    let mut topic_titles = BTreeSet::new();
    for message in ids.iter().filter_map(|id| by_id.get(id)) {
        if let Some(date) = message.date.as_deref().filter(|d| !d.is_empty()) {
            dates.insert(date.to_string());
        }
        if let Some(topic_id) = message.topic_id {
            topic_ids.insert(topic_id);
        }
        if let Some(title) = message.topic_title.as_deref().filter(|t| !t.is_empty()) {
            topic_titles.insert(title.to_string());
        }
    }

    let dates: Vec<String> = dates.into_iter().collect();
    let topic_ids: Vec<i64> = topic_ids.into_iter().collect();
    let topic_titles: Vec<String> = topic_titles.into_iter().collect();

    FactMeta {
        ts: ts.to_string(),
        source_ids_csv: ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(","),
        date_min: dates.first().cloned(),
        date_max: dates.last().cloned(),
        dates,
        topic_id: (topic_ids.len() == 1).then(|| topic_ids[0]),
        topic_ids: if topic_ids.len() > 1 { topic_ids } else { Vec::new() },
        topic_title: (topic_titles.len() == 1).then(|| topic_titles[0].clone()),
        topic_titles: if topic_titles.len() > 1 {
            topic_titles
        } else {
            Vec::new()
        },
    }
}
