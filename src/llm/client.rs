//! Chat-completion client with a bounded per-credential pool and retrying
//! HTTP calls.

use crate::config::LlmSettings;
use crate::error::{LlmError, Result};
use crate::llm::broker::LlmPreset;
use async_trait::async_trait;
use rand::Rng as _;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Message role in a chat completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message of a completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
}

/// A successful completion.
#[derive(Debug, Clone)]
pub struct CompletionOutput {
    pub content: String,
    pub usage: Option<TokenUsage>,
    pub model_name: String,
}

/// The seam the engine calls completions through. The HTTP client below is
/// the production implementation; tests substitute scripted fakes.
#[async_trait]
pub trait ChatCompletion: Send + Sync {
    async fn get_completion(
        &self,
        messages: &[ChatMessage],
        preset: &LlmPreset,
    ) -> Result<CompletionOutput>;
}

struct PooledClient {
    client: reqwest::Client,
    last_used: Instant,
}

/// HTTP chat-completion client.
///
/// Holds one `reqwest::Client` per `(api_key, base_url)` pair in a bounded
/// LRU pool; the pool lock is held only to promote or evict, never across a
/// request.
pub struct LlmClient {
    settings: LlmSettings,
    pool: Mutex<HashMap<(String, String), PooledClient>>,
}

impl LlmClient {
    pub fn new(settings: LlmSettings) -> Self {
        Self {
            settings,
            pool: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch (promoting) or build the client for a preset's credentials.
    fn client_for(&self, preset: &LlmPreset) -> Result<reqwest::Client> {
        let key = (preset.api_key.clone(), preset.base_url.clone());
        let mut pool = self.pool.lock().expect("client pool lock poisoned");
        let now = Instant::now();

        // Dropping an evicted entry closes its connections.
        pool.retain(|_, entry| {
            now.duration_since(entry.last_used) < self.settings.pool_idle_timeout
        });

        if let Some(entry) = pool.get_mut(&key) {
            entry.last_used = now;
            return Ok(entry.client.clone());
        }

        if pool.len() >= self.settings.pool_capacity
            && let Some(oldest) = pool
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone())
        {
            pool.remove(&oldest);
            tracing::debug!("evicted least recently used completion client");
        }

        let client = reqwest::Client::builder()
            .timeout(self.settings.request_timeout)
            .build()
            .map_err(|e| LlmError::Connection(e.to_string()))?;
        pool.insert(
            key,
            PooledClient {
                client: client.clone(),
                last_used: now,
            },
        );
        Ok(client)
    }

    /// Number of currently pooled clients (for diagnostics).
    pub fn pooled_clients(&self) -> usize {
        self.pool.lock().expect("client pool lock poisoned").len()
    }

    async fn attempt_completion(
        &self,
        messages: &[ChatMessage],
        preset: &LlmPreset,
    ) -> std::result::Result<CompletionOutput, LlmError> {
        let client = match self.client_for(preset) {
            Ok(client) => client,
            Err(crate::error::Error::Llm(error)) => return Err(error),
            Err(error) => return Err(LlmError::Other(anyhow::anyhow!(error))),
        };

        let url = format!(
            "{}/chat/completions",
            preset.base_url.trim_end_matches('/')
        );
        let body = serde_json::json!({
            "model": preset.model,
            "messages": messages,
        });

        let response = client
            .post(&url)
            .header("authorization", format!("Bearer {}", preset.api_key))
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(classify_request_error)?;

        let status = response.status();
        let response_text = response
            .text()
            .await
            .map_err(|e| LlmError::Decode(format!("failed to read response body: {e}")))?;

        if status.as_u16() == 429 {
            return Err(LlmError::RateLimited);
        }
        if !status.is_success() {
            let message = serde_json::from_str::<serde_json::Value>(&response_text)
                .ok()
                .and_then(|body| {
                    body["error"]["message"].as_str().map(str::to_string)
                })
                .unwrap_or_else(|| "unknown error".to_string());
            return Err(LlmError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let response_body: serde_json::Value = serde_json::from_str(&response_text)
            .map_err(|e| LlmError::Decode(format!("response is not valid JSON: {e}")))?;

        let content = response_body["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .filter(|content| !content.is_empty())
            .ok_or(LlmError::EmptyCompletion)?;

        let usage = serde_json::from_value::<TokenUsage>(response_body["usage"].clone()).ok();
        let model_name = response_body["model"]
            .as_str()
            .unwrap_or(&preset.model)
            .to_string();

        Ok(CompletionOutput {
            content,
            usage,
            model_name,
        })
    }
}

#[async_trait]
impl ChatCompletion for LlmClient {
    /// Run a completion with retries and exponential backoff on transient
    /// errors. Cancelling the future during a backoff sleep aborts the
    /// chain.
    async fn get_completion(
        &self,
        messages: &[ChatMessage],
        preset: &LlmPreset,
    ) -> Result<CompletionOutput> {
        let max_retries = self.settings.max_retries.max(1);

        for attempt in 0..max_retries {
            if attempt > 0 {
                let delay = backoff_delay(&self.settings, attempt - 1);
                tracing::debug!(attempt = attempt + 1, ?delay, "retrying after backoff");
                tokio::time::sleep(delay).await;
            }

            match self.attempt_completion(messages, preset).await {
                Ok(output) => return Ok(output),
                Err(error) => {
                    if !error.is_retriable() || attempt + 1 == max_retries {
                        tracing::error!(%error, attempt = attempt + 1, "completion failed");
                        return Err(error.into());
                    }
                    tracing::warn!(%error, attempt = attempt + 1, "retriable completion error");
                }
            }
        }

        unreachable!("retry loop always returns")
    }
}

fn classify_request_error(error: reqwest::Error) -> LlmError {
    if error.is_timeout() {
        LlmError::Timeout
    } else if error.is_connect() {
        LlmError::Connection(error.to_string())
    } else {
        LlmError::Connection(error.to_string())
    }
}

/// `base · 2^attempt` plus uniform jitter in `[0, 0.2·base]`, clipped at the
/// configured ceiling.
fn backoff_delay(settings: &LlmSettings, attempt: u32) -> Duration {
    let base = settings.base_delay.as_secs_f64();
    let jitter = rand::rng().random_range(0.0..=0.2 * base);
    let delay = base * 2f64.powi(attempt as i32) + jitter;
    Duration::from_secs_f64(delay.min(settings.max_delay.as_secs_f64()))
}
