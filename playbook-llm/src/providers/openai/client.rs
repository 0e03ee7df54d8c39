//! HTTP client for OpenAI-compatible endpoints with rate limiting.

use super::types::ApiError;
use playbook_core::{LlmError, PlaybookError, PlaybookResult};
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

const PROVIDER: &str = "openai-compatible";

/// Chat API client with rate limiting.
pub struct OpenAiClient {
    client: Client,
    api_key: String,
    base_url: String,
    rate_limiter: Arc<Semaphore>,
    last_request: Arc<AtomicU64>,
    min_request_interval_ms: u64,
    started: Instant,
}

impl OpenAiClient {
    /// Create a new client.
    ///
    /// # Arguments
    /// * `api_key` - endpoint API key
    /// * `base_url` - endpoint base, e.g. `https://api.openai.com/v1`
    /// * `requests_per_minute` - maximum requests per minute
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        requests_per_minute: u32,
    ) -> Self {
        let permits = (requests_per_minute as usize).max(1);
        let min_interval_ms = (60_000 / requests_per_minute.max(1) as u64).max(10);

        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: base_url.into(),
            rate_limiter: Arc::new(Semaphore::new(permits)),
            last_request: Arc::new(AtomicU64::new(0)),
            min_request_interval_ms: min_interval_ms,
            started: Instant::now(),
        }
    }

    /// Make an API request with automatic rate limiting. `timeout` is
    /// the remaining deadline budget for this attempt.
    pub async fn request<Req: Serialize, Res: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &Req,
        timeout: Duration,
    ) -> PlaybookResult<Res> {
        // Rate limiting: acquire permit
        let _permit = self.rate_limiter.acquire().await.map_err(|e| {
            PlaybookError::Llm(LlmError::Transport {
                provider: PROVIDER.to_string(),
                attempts: 1,
                message: format!("rate limiter closed: {}", e),
            })
        })?;

        // Enforce minimum interval between requests
        let now_ms = self.started.elapsed().as_millis() as u64;
        let last_ms = self.last_request.load(Ordering::Relaxed);
        let elapsed = now_ms.saturating_sub(last_ms);

        if elapsed < self.min_request_interval_ms {
            let wait_ms = self.min_request_interval_ms - elapsed;
            tokio::time::sleep(Duration::from_millis(wait_ms)).await;
        }

        self.last_request
            .store(self.started.elapsed().as_millis() as u64, Ordering::Relaxed);

        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), endpoint);
        let send = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .timeout(timeout)
            .json(body)
            .send();

        let response = match tokio::time::timeout(timeout, send).await {
            Err(_) => {
                return Err(PlaybookError::Llm(LlmError::Timeout {
                    operation: endpoint.to_string(),
                }))
            }
            Ok(Err(e)) if e.is_timeout() => {
                return Err(PlaybookError::Llm(LlmError::Timeout {
                    operation: endpoint.to_string(),
                }))
            }
            Ok(Err(e)) => {
                return Err(PlaybookError::Llm(LlmError::Transport {
                    provider: PROVIDER.to_string(),
                    attempts: 1,
                    message: format!("HTTP request failed: {}", e),
                }))
            }
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        if status.is_success() {
            return response.json().await.map_err(|e| {
                PlaybookError::Llm(LlmError::Transport {
                    provider: PROVIDER.to_string(),
                    attempts: 1,
                    message: format!("failed to read response body: {}", e),
                })
            });
        }

        // Parse error response
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        let error_msg = if let Ok(api_error) = serde_json::from_str::<ApiError>(&error_text) {
            api_error.error.message
        } else {
            error_text
        };

        Err(match status {
            StatusCode::TOO_MANY_REQUESTS => PlaybookError::Llm(LlmError::RateLimited {
                provider: PROVIDER.to_string(),
            }),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                PlaybookError::Llm(LlmError::MissingApiKey {
                    provider: PROVIDER.to_string(),
                })
            }
            _ => PlaybookError::Llm(LlmError::Transport {
                provider: PROVIDER.to_string(),
                attempts: 1,
                message: format!("status {}: {}", status.as_u16(), error_msg),
            }),
        })
    }
}

impl std::fmt::Debug for OpenAiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiClient")
            .field("base_url", &self.base_url)
            .field("api_key", &"[redacted]")
            .field("min_request_interval_ms", &self.min_request_interval_ms)
            .finish()
    }
}
