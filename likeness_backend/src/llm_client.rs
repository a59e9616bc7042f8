use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::{LlmConfig, RetryConfig};
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompletionOptions {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl CompletionOptions {
    pub fn new(temperature: f32, max_tokens: u32) -> Self {
        Self {
            temperature,
            max_tokens,
        }
    }
}

/// Text-generation capability. Implementations should honour a bounded
/// timeout; retries are layered on top by [`generate_with_retry`].
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn complete(&self, messages: Vec<Message>, options: &CompletionOptions) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

/// Client for OpenAI-compatible `/chat/completions` endpoints.
#[derive(Clone)]
pub struct LlmClient {
    api_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl LlmClient {
    pub fn new(api_url: String, api_key: String, model: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build LLM HTTP client")?;
        Ok(Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            client,
        })
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        Self::new(
            config.api_url.clone(),
            config.api_key.clone().unwrap_or_default(),
            config.model.clone(),
            Duration::from_secs(config.timeout_secs.max(1)),
        )
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl TextGenerator for LlmClient {
    async fn complete(&self, messages: Vec<Message>, options: &CompletionOptions) -> Result<String> {
        let url = format!("{}/chat/completions", self.api_url);

        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages,
            temperature: Some(options.temperature),
            max_tokens: Some(options.max_tokens),
        };

        let mut req = self.client.post(&url).json(&request);

        // Local models don't need a key
        if !self.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = req.send().await.context("Failed to send LLM request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("LLM API returned error {}: {}", status, body);
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to parse LLM response")?;

        completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| anyhow::anyhow!("No response from LLM"))
    }
}

/// Call the generator with up to `max_retries` extra attempts, raising the
/// temperature by the configured jitter on each retry. Empty output counts as
/// a failure.
pub async fn generate_with_retry(
    generator: &dyn TextGenerator,
    messages: Vec<Message>,
    options: CompletionOptions,
    retry: &RetryConfig,
) -> EngineResult<String> {
    let attempts = retry.attempts();
    let mut last_error = String::new();
    for attempt in 0..attempts {
        let temperature =
            (options.temperature + retry.temperature_jitter * attempt as f32).min(2.0);
        let attempt_options = CompletionOptions {
            temperature,
            ..options
        };
        match generator.complete(messages.clone(), &attempt_options).await {
            Ok(text) if !text.trim().is_empty() => return Ok(text),
            Ok(_) => {
                last_error = "empty completion".to_string();
                tracing::warn!("LLM attempt {}/{} returned nothing", attempt + 1, attempts);
            }
            Err(e) => {
                tracing::warn!("LLM attempt {}/{} failed: {:#}", attempt + 1, attempts, e);
                last_error = format!("{:#}", e);
            }
        }
    }
    Err(EngineError::external("llm", last_error))
}

/// Drop a `<think>...</think>` reasoning preamble if the model emitted one.
pub fn strip_reasoning(text: &str) -> &str {
    match text.rfind("</think>") {
        Some(end) => &text[end + "</think>".len()..],
        None => text,
    }
}

/// Locate the first balanced `{...}` object, skipping braces inside strings.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Decode a model response that should contain one JSON object.
pub fn parse_json<T: DeserializeOwned>(response: &str, what: &'static str) -> EngineResult<T> {
    let cleaned = strip_reasoning(response);
    let candidate = extract_json_object(cleaned).ok_or_else(|| {
        EngineError::parse(
            what,
            format!(
                "no JSON object in response: {}",
                response.chars().take(200).collect::<String>()
            ),
        )
    })?;
    serde_json::from_str(candidate).map_err(|e| EngineError::parse(what, e))
}
