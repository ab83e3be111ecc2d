//! Extraction attempt driver.
//!
//! Runs one batch through the repair/fallback state machine:
//!
//! ```text
//! primary: attempt ──valid──────────────► done (non-empty) / escalate (empty)
//!             │
//!             └─invalid─► repair ... (up to max_repairs) ─► escalate
//! fallback: same budget; its result is final
//! ```
//!
//! Each model gets up to `max_repairs + 1` attempts. The first response
//! that passes validation ends that model's turn, even when it is an empty
//! list. An empty or never-valid primary result escalates to the fallback
//! model when one is configured. Transport errors and timeouts are not
//! repaired: they end the batch immediately as a [`BatchFailure`].
//!
//! Every attempt, accepted or not, is returned as an [`ExtractionAttempt`].
//! With an [`AuditLog`] attached, each attempt is also written as soon as
//! the model call finishes, so a crash mid-batch keeps the earlier ones.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::audit::AuditLog;
use crate::config::Config;
use crate::llm::{CompletionRequest, ModelClient, ModelError};
use crate::models::{CandidateFact, ModelRole};
use crate::planner::Batch;
use crate::prompt::{build_prompt, RepairContext};
use crate::schema::accept_response;

/// Repair attempts run slightly cooler than the first attempt.
const REPAIR_TEMPERATURE_DROP: f32 = 0.1;

#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub primary_model: String,
    pub fallback_model: Option<String>,
    pub max_repairs: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
    pub hints: String,
}

impl DriverSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            primary_model: config.model.primary_model.clone(),
            fallback_model: config.model.fallback().map(str::to_string),
            max_repairs: config.model.max_repairs,
            temperature: config.model.temperature,
            top_p: config.model.top_p,
            max_tokens: config.model.max_tokens,
            timeout: Duration::from_secs(config.model.timeout_secs),
            hints: config.prompt.hints.clone(),
        }
    }

    fn temperature_for(&self, attempt_index: u32) -> f32 {
        if attempt_index == 0 {
            self.temperature
        } else {
            (self.temperature - REPAIR_TEMPERATURE_DROP).max(0.0)
        }
    }
}

/// Audit record of one model call.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionAttempt {
    pub batch_index: usize,
    pub first_id: i64,
    pub last_id: i64,
    pub role: ModelRole,
    pub model: String,
    /// 0 for the first attempt of a model, 1.. for repairs.
    pub attempt_index: u32,
    pub request: CompletionRequest,
    pub raw_response: Option<String>,
    pub parsed_facts: Option<Vec<CandidateFact>>,
    pub validation_errors: Vec<String>,
    pub transport_error: Option<String>,
    pub started_at: String,
    pub elapsed_ms: u64,
}

impl ExtractionAttempt {
    pub fn accepted(&self) -> bool {
        self.parsed_facts.is_some()
    }
}

/// Result of a batch whose model calls all completed.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    /// Validated candidate facts; empty when no model produced any.
    pub facts: Vec<CandidateFact>,
    /// The model whose answer was used, if any answer validated.
    pub accepted_from: Option<ModelRole>,
    pub attempts: Vec<ExtractionAttempt>,
}

/// A batch that ended on a transport-level error.
#[derive(Debug, thiserror::Error)]
#[error("batch {batch_index} failed on {role} model {model}: {source}")]
pub struct BatchFailure {
    pub batch_index: usize,
    pub role: ModelRole,
    pub model: String,
    #[source]
    pub source: ModelError,
    pub attempts: Vec<ExtractionAttempt>,
}

/// What one model's turn produced.
enum Turn {
    Valid(Vec<CandidateFact>),
    Exhausted,
}

pub struct ExtractionDriver {
    client: Arc<dyn ModelClient>,
    settings: DriverSettings,
    audit: Option<AuditLog>,
}

impl ExtractionDriver {
    pub fn new(client: Arc<dyn ModelClient>, settings: DriverSettings) -> Self {
        Self {
            client,
            settings,
            audit: None,
        }
    }

    /// Write every attempt to `audit` as it completes.
    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    pub fn backend_name(&self) -> &str {
        self.client.backend_name()
    }

    /// Extract facts from one batch.
    pub async fn run(&self, batch: &Batch<'_>) -> Result<BatchOutcome, BatchFailure> {
        let mut attempts = Vec::new();

        let primary = self.settings.primary_model.clone();
        match self
            .model_turn(batch, ModelRole::Primary, &primary, &mut attempts)
            .await
        {
            Ok(Turn::Valid(facts)) if !facts.is_empty() => {
                return Ok(BatchOutcome {
                    facts,
                    accepted_from: Some(ModelRole::Primary),
                    attempts,
                });
            }
            Ok(turn) => {
                let primary_valid = matches!(turn, Turn::Valid(_));
                let Some(fallback) = self.settings.fallback_model.clone() else {
                    return Ok(BatchOutcome {
                        facts: Vec::new(),
                        accepted_from: primary_valid.then_some(ModelRole::Primary),
                        attempts,
                    });
                };

                info!(
                    batch = batch.index,
                    fallback = %fallback,
                    "primary produced no facts, escalating"
                );

                match self
                    .model_turn(batch, ModelRole::Fallback, &fallback, &mut attempts)
                    .await
                {
                    Ok(Turn::Valid(facts)) => Ok(BatchOutcome {
                        facts,
                        accepted_from: Some(ModelRole::Fallback),
                        attempts,
                    }),
                    Ok(Turn::Exhausted) => Ok(BatchOutcome {
                        facts: Vec::new(),
                        accepted_from: primary_valid.then_some(ModelRole::Primary),
                        attempts,
                    }),
                    Err(source) => Err(BatchFailure {
                        batch_index: batch.index,
                        role: ModelRole::Fallback,
                        model: fallback,
                        source,
                        attempts,
                    }),
                }
            }
            Err(source) => Err(BatchFailure {
                batch_index: batch.index,
                role: ModelRole::Primary,
                model: primary,
                source,
                attempts,
            }),
        }
    }

    /// Up to `max_repairs + 1` attempts against one model.
    async fn model_turn(
        &self,
        batch: &Batch<'_>,
        role: ModelRole,
        model: &str,
        attempts: &mut Vec<ExtractionAttempt>,
    ) -> Result<Turn, ModelError> {
        let texts = batch.source_texts();
        let mut last_rejection: Option<(Vec<String>, String)> = None;

        for attempt_index in 0..=self.settings.max_repairs {
            let prompt = match last_rejection {
                None => build_prompt(batch, &self.settings.hints, None),
                Some((ref issues, ref output)) => build_prompt(
                    batch,
                    &self.settings.hints,
                    Some(&RepairContext {
                        issues,
                        invalid_output: output,
                    }),
                ),
            };
            let request = CompletionRequest {
                model: model.to_string(),
                temperature: self.settings.temperature_for(attempt_index),
                top_p: self.settings.top_p,
                max_tokens: self.settings.max_tokens,
                prompt,
            };

            let started_at = Utc::now().to_rfc3339();
            let start = Instant::now();
            let result =
                match tokio::time::timeout(self.settings.timeout, self.client.complete(&request))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ModelError::Timeout(self.settings.timeout.as_secs())),
                };
            let elapsed_ms = start.elapsed().as_millis() as u64;

            let mut record = ExtractionAttempt {
                batch_index: batch.index,
                first_id: batch.first_id(),
                last_id: batch.last_id(),
                role,
                model: model.to_string(),
                attempt_index,
                request,
                raw_response: None,
                parsed_facts: None,
                validation_errors: Vec::new(),
                transport_error: None,
                started_at,
                elapsed_ms,
            };

            let raw = match result {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(batch = batch.index, %role, model, error = %e, "model call failed");
                    record.transport_error = Some(e.to_string());
                    self.keep(attempts, record);
                    return Err(e);
                }
            };
            record.raw_response = Some(raw.clone());

            match accept_response(&raw, &texts) {
                Ok(facts) => {
                    debug!(
                        batch = batch.index,
                        %role,
                        attempt = attempt_index,
                        facts = facts.len(),
                        "response accepted"
                    );
                    record.parsed_facts = Some(facts.clone());
                    self.keep(attempts, record);
                    return Ok(Turn::Valid(facts));
                }
                Err(e) => {
                    let issues = e.messages();
                    warn!(
                        batch = batch.index,
                        %role,
                        attempt = attempt_index,
                        issues = issues.len(),
                        "response rejected: {}",
                        e
                    );
                    record.validation_errors = issues.clone();
                    self.keep(attempts, record);
                    last_rejection = Some((issues, raw));
                }
            }
        }

        Ok(Turn::Exhausted)
    }

    fn keep(&self, attempts: &mut Vec<ExtractionAttempt>, record: ExtractionAttempt) {
        if let Some(ref audit) = self.audit {
            audit.record(&record);
        }
        attempts.push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use crate::models::Message;
    use crate::planner::{plan, BatchLimits};

    /// Replays canned answers in order and records every request.
    struct ScriptedClient {
        script: Mutex<VecDeque<Result<String, ModelError>>>,
        seen: Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedClient {
        fn new(script: Vec<Result<&str, ModelError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(
                    script
                        .into_iter()
                        .map(|r| r.map(str::to_string))
                        .collect(),
                ),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<CompletionRequest> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedClient {
        fn backend_name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, request: &CompletionRequest) -> Result<String, ModelError> {
            self.seen.lock().unwrap().push(request.clone());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok("[]".to_string()))
        }
    }

    fn settings(fallback: Option<&str>, max_repairs: u32) -> DriverSettings {
        DriverSettings {
            primary_model: "primary-m".to_string(),
            fallback_model: fallback.map(str::to_string),
            max_repairs,
            temperature: 0.2,
            top_p: 0.95,
            max_tokens: 256,
            timeout: Duration::from_secs(5),
            hints: String::new(),
        }
    }

    fn messages() -> Vec<Message> {
        vec![
            Message::new(1, "The service times out after 30s"),
            Message::new(2, "Backups run nightly"),
        ]
    }

    fn batch(messages: &[Message]) -> Batch<'_> {
        let limits = BatchLimits {
            token_budget: 10_000,
            per_message_overhead: 0,
            max_messages: 10,
        };
        plan(messages, limits).next().unwrap()
    }

    const GOOD: &str = r#"{"facts": [{"statement": "The service times out after 30 seconds", "sources": [{"source_id": "msg:1", "quote": "times out after 30s"}]}]}"#;

    #[tokio::test]
    async fn first_valid_answer_is_used() {
        let client = ScriptedClient::new(vec![Ok(GOOD)]);
        let driver = ExtractionDriver::new(client.clone(), settings(Some("fallback-m"), 1));
        let msgs = messages();
        let outcome = driver.run(&batch(&msgs)).await.unwrap();
        assert_eq!(outcome.facts.len(), 1);
        assert_eq!(outcome.accepted_from, Some(ModelRole::Primary));
        assert_eq!(outcome.attempts.len(), 1);
        assert_eq!(client.requests().len(), 1);
    }

    #[tokio::test]
    async fn invalid_answer_is_repaired_with_feedback() {
        let client = ScriptedClient::new(vec![Ok("not json at all"), Ok(GOOD)]);
        let driver = ExtractionDriver::new(client.clone(), settings(None, 1));
        let msgs = messages();
        let outcome = driver.run(&batch(&msgs)).await.unwrap();
        assert_eq!(outcome.facts.len(), 1);
        assert_eq!(outcome.attempts.len(), 2);
        assert!(!outcome.attempts[0].accepted());
        assert!(!outcome.attempts[0].validation_errors.is_empty());

        let requests = client.requests();
        assert!(requests[1].prompt.user.contains("not json at all"));
        assert!(requests[1].temperature < requests[0].temperature);
        assert_eq!(requests[1].model, "primary-m");
    }

    #[tokio::test]
    async fn exhausted_primary_escalates_to_fallback() {
        let client = ScriptedClient::new(vec![Ok("{oops"), Ok("[{\"statement\": \"\"}]"), Ok("[]")]);
        let driver = ExtractionDriver::new(client.clone(), settings(Some("fallback-m"), 1));
        let msgs = messages();
        let outcome = driver.run(&batch(&msgs)).await.unwrap();
        assert!(outcome.facts.is_empty());
        assert_eq!(outcome.accepted_from, Some(ModelRole::Fallback));
        let roles: Vec<(ModelRole, u32)> = outcome
            .attempts
            .iter()
            .map(|a| (a.role, a.attempt_index))
            .collect();
        assert_eq!(
            roles,
            vec![
                (ModelRole::Primary, 0),
                (ModelRole::Primary, 1),
                (ModelRole::Fallback, 0)
            ]
        );
        assert_eq!(client.requests()[2].model, "fallback-m");
    }

    #[tokio::test]
    async fn empty_primary_answer_escalates() {
        let client = ScriptedClient::new(vec![Ok("{\"facts\": []}"), Ok(GOOD)]);
        let driver = ExtractionDriver::new(client, settings(Some("fallback-m"), 1));
        let msgs = messages();
        let outcome = driver.run(&batch(&msgs)).await.unwrap();
        assert_eq!(outcome.facts.len(), 1);
        assert_eq!(outcome.accepted_from, Some(ModelRole::Fallback));
        // A valid empty answer is not repaired.
        assert_eq!(outcome.attempts.len(), 2);
    }

    #[tokio::test]
    async fn no_fallback_means_empty_outcome() {
        let client = ScriptedClient::new(vec![Ok("garbage"), Ok("more garbage")]);
        let driver = ExtractionDriver::new(client.clone(), settings(None, 1));
        let msgs = messages();
        let outcome = driver.run(&batch(&msgs)).await.unwrap();
        assert!(outcome.facts.is_empty());
        assert_eq!(outcome.accepted_from, None);
        assert_eq!(client.requests().len(), 2);
    }

    #[tokio::test]
    async fn ungrounded_source_triggers_repair() {
        let foreign = r#"[{"statement": "x", "sources": [{"source_id": "msg:99", "quote": "x"}]}]"#;
        let client = ScriptedClient::new(vec![Ok(foreign), Ok(GOOD)]);
        let driver = ExtractionDriver::new(client, settings(None, 1));
        let msgs = messages();
        let outcome = driver.run(&batch(&msgs)).await.unwrap();
        assert_eq!(outcome.facts[0].sources[0].source_id, "msg:1");
        assert!(outcome.attempts[0].validation_errors[0].contains("msg:99"));
    }

    #[tokio::test]
    async fn transport_error_fails_batch_without_repair() {
        let client = ScriptedClient::new(vec![Err(ModelError::Transport("reset".to_string()))]);
        let driver = ExtractionDriver::new(client.clone(), settings(Some("fallback-m"), 2));
        let msgs = messages();
        let failure = driver.run(&batch(&msgs)).await.unwrap_err();
        assert_eq!(failure.role, ModelRole::Primary);
        assert!(matches!(failure.source, ModelError::Transport(_)));
        assert_eq!(failure.attempts.len(), 1);
        assert!(failure.attempts[0].transport_error.is_some());
        assert_eq!(client.requests().len(), 1);
    }

    #[tokio::test]
    async fn fallback_transport_error_is_attributed_to_fallback() {
        let client = ScriptedClient::new(vec![
            Ok("[]"),
            Err(ModelError::Api {
                status: 500,
                body: "boom".to_string(),
            }),
        ]);
        let driver = ExtractionDriver::new(client, settings(Some("fallback-m"), 0));
        let msgs = messages();
        let failure = driver.run(&batch(&msgs)).await.unwrap_err();
        assert_eq!(failure.role, ModelRole::Fallback);
        assert_eq!(failure.model, "fallback-m");
        assert_eq!(failure.attempts.len(), 2);
    }

    /// Answers garbage first; on the repair call, reports how many attempt
    /// files already exist under `raw_dir`.
    struct RawDirWatcher {
        raw_dir: std::path::PathBuf,
        files_seen_on_repair: Mutex<Option<usize>>,
    }

    #[async_trait]
    impl ModelClient for RawDirWatcher {
        fn backend_name(&self) -> &str {
            "watcher"
        }

        async fn complete(&self, request: &CompletionRequest) -> Result<String, ModelError> {
            if !request.prompt.user.contains("rejected") {
                return Ok("not json".to_string());
            }
            let count = std::fs::read_dir(&self.raw_dir).map(|d| d.count()).unwrap_or(0);
            *self.files_seen_on_repair.lock().unwrap() = Some(count);
            Ok(GOOD.to_string())
        }
    }

    #[tokio::test]
    async fn attempts_reach_disk_before_the_next_call() {
        let tmp = tempfile::TempDir::new().unwrap();
        let raw_dir = tmp.path().join("raw");
        let client = Arc::new(RawDirWatcher {
            raw_dir: raw_dir.clone(),
            files_seen_on_repair: Mutex::new(None),
        });
        let driver = ExtractionDriver::new(client.clone(), settings(None, 1))
            .with_audit(AuditLog::new(&raw_dir, "run"));
        let msgs = messages();
        let outcome = driver.run(&batch(&msgs)).await.unwrap();

        assert_eq!(outcome.facts.len(), 1);
        assert_eq!(*client.files_seen_on_repair.lock().unwrap(), Some(1));
        assert_eq!(std::fs::read_dir(&raw_dir).unwrap().count(), 2);
    }

    struct SlowClient;

    #[async_trait]
    impl ModelClient for SlowClient {
        fn backend_name(&self) -> &str {
            "slow"
        }

        async fn complete(&self, _request: &CompletionRequest) -> Result<String, ModelError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok("[]".to_string())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_model_times_out() {
        let driver = ExtractionDriver::new(Arc::new(SlowClient), settings(None, 1));
        let msgs = messages();
        let failure = driver.run(&batch(&msgs)).await.unwrap_err();
        assert!(matches!(failure.source, ModelError::Timeout(5)));
    }
}
