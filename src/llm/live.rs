//! OpenAI-compatible chat completions backend.
//!
//! Retry strategy, inside a single [`ModelClient::complete`] call:
//! - HTTP 429 and 5xx: retry with exponential backoff
//! - HTTP 401/403: fail immediately with [`ModelError::Auth`]
//! - other HTTP 4xx: fail immediately with [`ModelError::Api`]
//! - network errors: retry
//! - backoff: 1s, 2s, 4s, ... (capped at 2^5)
//!
//! A missing API key is reported per call, so the mock backend and
//! `kb run --dry-run` work without one.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

use super::{CompletionRequest, ModelClient, ModelError};
use crate::config::{ModelConfig, ResponseFormat};

pub struct LiveClient {
    http: reqwest::Client,
    chat_url: String,
    api_key_env: String,
    max_retries: u32,
    response_format: ResponseFormat,
}

impl LiveClient {
    pub fn new(config: &ModelConfig) -> anyhow::Result<Self> {
        // The driver enforces the per-call deadline; this only bounds a stuck socket.
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.saturating_mul(2)))
            .build()?;

        Ok(Self {
            http,
            chat_url: chat_url(&config.api_base),
            api_key_env: config.api_key_env.clone(),
            max_retries: config.max_retries,
            response_format: config.response_format,
        })
    }

    fn api_key(&self) -> Result<String, ModelError> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ModelError::Config(format!("{} not set", self.api_key_env)))
    }

    fn body(&self, request: &CompletionRequest) -> Value {
        let mut body = json!({
            "model": request.model,
            "temperature": request.temperature,
            "top_p": request.top_p,
            "max_tokens": request.max_tokens,
            "messages": [
                {"role": "system", "content": request.prompt.system},
                {"role": "user", "content": request.prompt.user},
            ],
        });
        match self.response_format {
            ResponseFormat::JsonObject => {
                body["response_format"] = json!({"type": "json_object"});
            }
            ResponseFormat::JsonSchema => {
                body["response_format"] = json!({
                    "type": "json_schema",
                    "json_schema": {
                        "name": "facts",
                        "schema": request.prompt.schema,
                    },
                });
            }
            ResponseFormat::None => {}
        }
        body
    }
}

#[async_trait]
impl ModelClient for LiveClient {
    fn backend_name(&self) -> &str {
        "live"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, ModelError> {
        let api_key = self.api_key()?;
        let body = self.body(request);
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                debug!(attempt, delay_secs = delay.as_secs(), "retrying model call");
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .http
                .post(&self.chat_url)
                .bearer_auth(&api_key)
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: Value = response
                            .json()
                            .await
                            .map_err(|e| ModelError::Transport(e.to_string()))?;
                        return Ok(extract_content(&json).unwrap_or_else(|| {
                            warn!(model = %request.model, "response carried no message content");
                            String::new()
                        }));
                    }

                    let code = status.as_u16();
                    let body_text = response.text().await.unwrap_or_default();

                    if code == 429 || status.is_server_error() {
                        last_err = Some(ModelError::Api {
                            status: code,
                            body: body_text,
                        });
                        continue;
                    }
                    if code == 401 || code == 403 {
                        return Err(ModelError::Auth {
                            status: code,
                            body: body_text,
                        });
                    }
                    return Err(ModelError::Api {
                        status: code,
                        body: body_text,
                    });
                }
                Err(e) => {
                    last_err = Some(ModelError::Transport(e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            ModelError::Transport("model call failed after retries".to_string())
        }))
    }
}

/// `<base>/chat/completions`, inserting `/v1` when the base lacks it.
fn chat_url(api_base: &str) -> String {
    let base = api_base.trim().trim_end_matches('/');
    if base.ends_with("/v1") {
        format!("{}/chat/completions", base)
    } else {
        format!("{}/v1/chat/completions", base)
    }
}

/// Pull the answer text out of a completion response.
///
/// Prefers `choices[0].message.content`; falls back to the top-level
/// `output`, `text`, or `content` fields some gateways return.
fn extract_content(json: &Value) -> Option<String> {
    let from_choices = json
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| {
            c.get("message")
                .and_then(|m| m.get("content"))
                .or_else(|| c.get("text"))
        })
        .and_then(Value::as_str);

    from_choices
        .or_else(|| {
            ["output", "text", "content"]
                .iter()
                .find_map(|key| json.get(*key).and_then(Value::as_str))
        })
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_url_appends_v1_when_missing() {
        assert_eq!(
            chat_url("https://api.cloud.ru/v1"),
            "https://api.cloud.ru/v1/chat/completions"
        );
        assert_eq!(
            chat_url("https://api.cloud.ru/v1/"),
            "https://api.cloud.ru/v1/chat/completions"
        );
        assert_eq!(
            chat_url("http://localhost:8000"),
            "http://localhost:8000/v1/chat/completions"
        );
    }

    #[test]
    fn extract_content_prefers_choices() {
        let json = json!({
            "choices": [{"message": {"role": "assistant", "content": "{\"facts\": []}"}}],
            "output": "ignored"
        });
        assert_eq!(extract_content(&json).as_deref(), Some("{\"facts\": []}"));
    }

    #[test]
    fn extract_content_falls_back_to_top_level_fields() {
        assert_eq!(extract_content(&json!({"output": "a"})).as_deref(), Some("a"));
        assert_eq!(extract_content(&json!({"text": "b"})).as_deref(), Some("b"));
        assert_eq!(
            extract_content(&json!({"choices": [{"text": "c"}]})).as_deref(),
            Some("c")
        );
        assert_eq!(extract_content(&json!({"choices": []})), None);
    }

    #[tokio::test]
    async fn missing_api_key_is_a_config_error() {
        let config = ModelConfig {
            api_key_env: "KB_TEST_KEY_THAT_IS_NEVER_SET".to_string(),
            ..ModelConfig::default()
        };
        let client = LiveClient::new(&config).unwrap();
        let request = CompletionRequest {
            model: "m".to_string(),
            temperature: 0.2,
            top_p: 0.95,
            max_tokens: 16,
            prompt: crate::prompt::ExtractionPrompt {
                system: String::new(),
                user: String::new(),
                schema: Value::Null,
                sources: vec![],
            },
        };
        assert!(matches!(
            client.complete(&request).await,
            Err(ModelError::Config(_))
        ));
    }
}
