//! Model collaborator abstraction and implementations.
//!
//! Defines the [`ModelClient`] trait and two backends:
//! - **[`MockClient`]**: deterministic offline extractor; no network calls.
//! - **[`LiveClient`]**: calls an OpenAI-compatible `/chat/completions`
//!   endpoint with retry and backoff.
//!
//! # Backend Selection
//!
//! Use [`create_client`] to instantiate the backend named by
//! `[model] backend` in the configuration:
//!
//! ```rust,no_run
//! # use knowledge_builder::config::Config;
//! # use knowledge_builder::llm::create_client;
//! let config = Config::minimal("chat.sqlite"); // backend = "mock"
//! let client = create_client(&config.model).unwrap();
//! assert_eq!(client.backend_name(), "mock");
//! ```
//!
//! # Error Classes
//!
//! A client returns raw text on success. Whether that text is usable is
//! decided by the caller's validator, not by the client. Errors returned
//! here are transport-level ([`ModelError`]) and end the batch: the driver
//! does not repair or escalate them.

mod live;
mod mock;

pub use live::LiveClient;
pub use mock::MockClient;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::{Backend, ModelConfig};
use crate::prompt::ExtractionPrompt;

/// Transport-level failure talking to a model.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ModelError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("model call timed out after {0}s")]
    Timeout(u64),
    #[error("authentication rejected ({status}): {body}")]
    Auth { status: u16, body: String },
    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("model client misconfigured: {0}")]
    Config(String),
}

/// One model invocation: sampling parameters plus the assembled prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
    #[serde(flatten)]
    pub prompt: ExtractionPrompt,
}

/// A model that turns an extraction prompt into raw response text.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Short backend identifier (`"mock"`, `"live"`, ...).
    fn backend_name(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<String, ModelError>;
}

/// Create the configured model client.
///
/// # Errors
///
/// Returns an error if the live backend cannot be initialized (HTTP client
/// construction failure).
pub fn create_client(config: &ModelConfig) -> Result<Arc<dyn ModelClient>> {
    match config.backend {
        Backend::Mock => Ok(Arc::new(MockClient::new())),
        Backend::Live => Ok(Arc::new(LiveClient::new(config)?)),
    }
}
