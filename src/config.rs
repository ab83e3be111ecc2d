//! TOML configuration.
//!
//! Every section except `[source]` is optional and every key has a default,
//! so the smallest useful file is:
//!
//! ```toml
//! [source]
//! db_path = "./data/chat.sqlite"
//! ```
//!
//! Command-line flags of `kb run` are applied on top through
//! [`RunOverrides`], after which the merged config is validated again.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::checkpoint::ResumeMode;
use crate::planner::BatchLimits;
use crate::source::MessageFilters;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub source: SourceConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub batching: BatchingConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub prompt: PromptConfig,
    #[serde(default)]
    pub run: RunConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub db_path: PathBuf,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default)]
    pub limit_rows: Option<usize>,
    #[serde(default)]
    pub min_text_len: Option<usize>,
    #[serde(default)]
    pub filter_topic_id: Option<i64>,
    #[serde(default)]
    pub filter_topic_title_contains: Option<String>,
}

fn default_table() -> String {
    "messages".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("out")
}

#[derive(Debug, Deserialize, Clone)]
pub struct StateConfig {
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_state_file")]
    pub state_file: String,
    /// Unset: resume when possible. `true`: resume is required. `false`: start over.
    #[serde(default)]
    pub resume: Option<bool>,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            state_file: default_state_file(),
            resume: None,
        }
    }
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".state")
}
fn default_state_file() -> String {
    "checkpoint.json".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct BatchingConfig {
    #[serde(default = "default_context_budget")]
    pub context_budget: usize,
    #[serde(default = "default_per_message_overhead")]
    pub per_message_overhead: usize,
    #[serde(default = "default_max_messages_per_batch")]
    pub max_messages_per_batch: usize,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            context_budget: default_context_budget(),
            per_message_overhead: default_per_message_overhead(),
            max_messages_per_batch: default_max_messages_per_batch(),
        }
    }
}

fn default_context_budget() -> usize {
    180_000
}
fn default_per_message_overhead() -> usize {
    400
}
fn default_max_messages_per_batch() -> usize {
    200
}

/// Which model collaborator to use.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Deterministic offline extractor.
    Mock,
    /// OpenAI-compatible chat completions endpoint.
    Live,
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mock" => Ok(Backend::Mock),
            "live" => Ok(Backend::Live),
            other => Err(format!("unknown backend '{}': expected mock or live", other)),
        }
    }
}

/// How structured output is requested from the live endpoint.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    JsonObject,
    JsonSchema,
    None,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    #[serde(default = "default_backend")]
    pub backend: Backend,
    #[serde(default = "default_primary_model")]
    pub primary_model: String,
    /// An empty string disables fallback escalation.
    #[serde(default = "default_fallback_model")]
    pub fallback_model: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_max_repairs")]
    pub max_repairs: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_response_format")]
    pub response_format: ResponseFormat,
    #[serde(default)]
    pub dotenv_path: Option<PathBuf>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            primary_model: default_primary_model(),
            fallback_model: default_fallback_model(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            max_tokens: default_max_tokens(),
            max_repairs: default_max_repairs(),
            timeout_secs: default_timeout_secs(),
            api_base: default_api_base(),
            api_key_env: default_api_key_env(),
            max_retries: default_max_retries(),
            response_format: default_response_format(),
            dotenv_path: None,
        }
    }
}

impl ModelConfig {
    /// The fallback model, if one is configured.
    pub fn fallback(&self) -> Option<&str> {
        self.fallback_model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
    }
}

fn default_backend() -> Backend {
    Backend::Mock
}
fn default_primary_model() -> String {
    "openai/gpt-oss-120b".to_string()
}
fn default_fallback_model() -> Option<String> {
    Some("Qwen/Qwen3-235B-A22B-Instruct-2507".to_string())
}
fn default_temperature() -> f32 {
    0.2
}
fn default_top_p() -> f32 {
    0.95
}
fn default_max_tokens() -> u32 {
    1024
}
fn default_max_repairs() -> u32 {
    1
}
fn default_timeout_secs() -> u64 {
    120
}
fn default_api_base() -> String {
    "https://api.cloud.ru/v1".to_string()
}
fn default_api_key_env() -> String {
    "KB_API_KEY".to_string()
}
fn default_max_retries() -> u32 {
    2
}
fn default_response_format() -> ResponseFormat {
    ResponseFormat::JsonObject
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PromptConfig {
    /// Free text appended to every extraction prompt.
    #[serde(default)]
    pub hints: String,
}

/// What the coordinator does after a batch fails at the transport layer.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportErrorPolicy {
    /// Keep going; the watermark stays frozen for the rest of the run.
    #[default]
    Continue,
    /// Stop after the failed batch.
    Stop,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RunConfig {
    #[serde(default)]
    pub on_transport_error: TransportErrorPolicy,
}

impl Config {
    /// Config with defaults everywhere, reading from `db_path`.
    pub fn minimal(db_path: impl Into<PathBuf>) -> Self {
        Self {
            source: SourceConfig {
                db_path: db_path.into(),
                table: default_table(),
                limit_rows: None,
                min_text_len: None,
                filter_topic_id: None,
                filter_topic_title_contains: None,
            },
            output: OutputConfig::default(),
            state: StateConfig::default(),
            batching: BatchingConfig::default(),
            model: ModelConfig::default(),
            prompt: PromptConfig::default(),
            run: RunConfig::default(),
        }
    }

    pub fn resume_mode(&self) -> ResumeMode {
        ResumeMode::from_flag(self.state.resume)
    }

    pub fn batch_limits(&self) -> BatchLimits {
        BatchLimits {
            token_budget: self.batching.context_budget,
            per_message_overhead: self.batching.per_message_overhead,
            max_messages: self.batching.max_messages_per_batch,
        }
    }

    pub fn message_filters(&self) -> MessageFilters {
        MessageFilters {
            min_text_len: self.source.min_text_len,
            topic_id: self.source.filter_topic_id,
            topic_title_contains: self
                .source
                .filter_topic_title_contains
                .clone()
                .filter(|s| !s.trim().is_empty()),
            limit_rows: self.source.limit_rows,
        }
    }

    pub fn knowledge_path(&self) -> PathBuf {
        self.output.output_dir.join("knowledge.jsonl")
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.output.output_dir.join("raw")
    }

    pub fn state_path(&self) -> PathBuf {
        self.state.state_dir.join(&self.state.state_file)
    }

    /// Check value ranges and cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if !is_plain_identifier(&self.source.table) {
            bail!(
                "source.table must be a plain SQL identifier (letters, digits, underscores), got '{}'",
                self.source.table
            );
        }
        if self.batching.context_budget == 0 {
            bail!("batching.context_budget must be > 0");
        }
        if self.batching.max_messages_per_batch == 0 {
            bail!("batching.max_messages_per_batch must be >= 1");
        }
        if !(0.0..=2.0).contains(&self.model.temperature) {
            bail!("model.temperature must be in [0.0, 2.0]");
        }
        if !(self.model.top_p > 0.0 && self.model.top_p <= 1.0) {
            bail!("model.top_p must be in (0.0, 1.0]");
        }
        if self.model.primary_model.trim().is_empty() {
            bail!("model.primary_model must not be empty");
        }
        if self.model.timeout_secs == 0 {
            bail!("model.timeout_secs must be > 0");
        }
        if self.state.state_file.trim().is_empty() {
            bail!("state.state_file must not be empty");
        }
        Ok(())
    }

    /// Apply command-line overrides. Call [`Config::validate`] afterwards.
    pub fn apply_overrides(&mut self, o: &RunOverrides) {
        if let Some(ref table) = o.table {
            self.source.table = table.clone();
        }
        if o.limit_rows.is_some() {
            self.source.limit_rows = o.limit_rows;
        }
        if o.min_text_len.is_some() {
            self.source.min_text_len = o.min_text_len;
        }
        if o.filter_topic_id.is_some() {
            self.source.filter_topic_id = o.filter_topic_id;
        }
        if o.filter_topic_title_contains.is_some() {
            self.source.filter_topic_title_contains = o.filter_topic_title_contains.clone();
        }
        if let Some(ref dir) = o.output_dir {
            self.output.output_dir = dir.clone();
        }
        if let Some(ref dir) = o.state_dir {
            self.state.state_dir = dir.clone();
        }
        if o.resume.is_some() {
            self.state.resume = o.resume;
        }
        if let Some(backend) = o.backend {
            self.model.backend = backend;
        }
        if let Some(ref model) = o.primary_model {
            self.model.primary_model = model.clone();
        }
        if let Some(ref model) = o.fallback_model {
            self.model.fallback_model = Some(model.clone());
        }
        if o.no_fallback {
            self.model.fallback_model = None;
        }
        if let Some(t) = o.temperature {
            self.model.temperature = t;
        }
        if let Some(n) = o.max_repairs {
            self.model.max_repairs = n;
        }
        if let Some(ref hints) = o.hints {
            self.prompt.hints = hints.clone();
        }
    }
}

/// Command-line overrides for `kb run`. `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub table: Option<String>,
    pub limit_rows: Option<usize>,
    pub min_text_len: Option<usize>,
    pub filter_topic_id: Option<i64>,
    pub filter_topic_title_contains: Option<String>,
    pub output_dir: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub resume: Option<bool>,
    pub backend: Option<Backend>,
    pub primary_model: Option<String>,
    pub fallback_model: Option<String>,
    pub no_fallback: bool,
    pub temperature: Option<f32>,
    pub max_repairs: Option<u32>,
    pub hints: Option<String>,
}

/// Letters, digits, and underscores, not starting with a digit.
pub fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}
