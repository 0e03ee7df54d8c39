//! Gateway implementation over an OpenAI-compatible chat endpoint.

mod client;
mod types;

pub use client::OpenAiClient;

use crate::templates::{PromptTemplates, TemplateKind};
use crate::LlmGateway;
use async_trait::async_trait;
use playbook_core::{
    Deadline, KeyPoint, LlmError, Playbook, PlaybookConfig, PlaybookError, PlaybookResult,
    ReflectionResult, TagInference, Transcript, WhenDoMigration,
};
use serde::de::DeserializeOwned;
use std::time::Duration;
use types::{ChatMessage, ChatRequest, ChatResponse};

const PROVIDER: &str = "openai-compatible";
const REQUESTS_PER_MINUTE: u32 = 60;
const BACKOFF_BASE: Duration = Duration::from_millis(250);

/// Gateway backed by a chat-completions endpoint.
pub struct OpenAiGateway {
    client: OpenAiClient,
    model: String,
    retries: u32,
    request_timeout: Duration,
    merge_threshold: f64,
    templates: PromptTemplates,
}

impl OpenAiGateway {
    /// Build a gateway from configuration; fails fast without a key.
    pub fn from_config(config: &PlaybookConfig) -> PlaybookResult<Self> {
        let api_key = config.llm.api_key.clone().ok_or_else(|| {
            PlaybookError::Llm(LlmError::MissingApiKey {
                provider: PROVIDER.to_string(),
            })
        })?;
        Ok(Self {
            client: OpenAiClient::new(api_key, config.llm.base_url.clone(), REQUESTS_PER_MINUTE),
            model: config.llm.model.clone(),
            retries: config.llm.retries,
            request_timeout: config.llm.timeout,
            merge_threshold: config.merge_threshold,
            templates: PromptTemplates::load(config.templates_dir.as_deref()),
        })
    }

    /// One completion with bounded retries on transport errors. Each
    /// attempt gets the remaining deadline capped at the configured
    /// request timeout; schema errors surface immediately.
    async fn complete(&self, operation: &str, prompt: String, deadline: Deadline) -> PlaybookResult<String> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let budget = deadline.remaining_capped(self.request_timeout).ok_or_else(|| {
                PlaybookError::Llm(LlmError::Timeout {
                    operation: operation.to_string(),
                })
            })?;

            let request = ChatRequest {
                model: self.model.clone(),
                messages: vec![ChatMessage::user(prompt.clone())],
                temperature: 0.0,
            };

            match self
                .client
                .request::<_, ChatResponse>("chat/completions", &request, budget)
                .await
            {
                Ok(response) => {
                    let content = response
                        .choices
                        .into_iter()
                        .next()
                        .map(|c| c.message.content)
                        .ok_or_else(|| {
                            PlaybookError::Llm(LlmError::Schema {
                                provider: PROVIDER.to_string(),
                                reason: "reply carried no choices".to_string(),
                            })
                        })?;
                    return Ok(content);
                }
                Err(PlaybookError::Llm(e)) if e.is_retryable() && attempt <= self.retries => {
                    let backoff = BACKOFF_BASE * 2u32.saturating_pow(attempt - 1);
                    tracing::debug!(operation, attempt, error = %e, "retrying LLM call");
                    match deadline.remaining_capped(backoff) {
                        Some(wait) => tokio::time::sleep(wait).await,
                        None => {
                            return Err(PlaybookError::Llm(LlmError::Timeout {
                                operation: operation.to_string(),
                            }))
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Parse a strict-JSON reply, tolerating surrounding prose or code
    /// fences by slicing from the first `{` to the last `}`.
    fn parse_reply<T: DeserializeOwned>(&self, operation: &str, content: &str) -> PlaybookResult<T> {
        let start = content.find('{');
        let end = content.rfind('}');
        let json = match (start, end) {
            (Some(start), Some(end)) if start < end => &content[start..=end],
            _ => {
                return Err(PlaybookError::Llm(LlmError::Schema {
                    provider: PROVIDER.to_string(),
                    reason: format!("{operation} reply carried no JSON object"),
                }))
            }
        };
        serde_json::from_str(json).map_err(|e| {
            PlaybookError::Llm(LlmError::Schema {
                provider: PROVIDER.to_string(),
                reason: format!("{operation} reply failed to parse: {e}"),
            })
        })
    }

    /// Compact view of the playbook handed to the reflection prompt.
    fn playbook_digest(playbook: &Playbook) -> String {
        let entries: Vec<serde_json::Value> = playbook
            .key_points
            .iter()
            .map(|k| {
                serde_json::json!({
                    "name": k.name,
                    "text": k.text.render(),
                    "tags": k.tags,
                    "score": k.score,
                    "pending": k.pending,
                })
            })
            .collect();
        serde_json::to_string_pretty(&entries).unwrap_or_else(|_| "[]".to_string())
    }
}

#[async_trait]
impl LlmGateway for OpenAiGateway {
    async fn infer_tags(
        &self,
        prompt: &str,
        history: &Transcript,
        max_tags: usize,
        deadline: Deadline,
    ) -> PlaybookResult<TagInference> {
        let rendered = self.templates.render(
            TemplateKind::Tagger,
            &[
                ("prompt", prompt),
                ("history", &history.rendered()),
                ("max_tags", &max_tags.to_string()),
            ],
        );
        let reply = self.complete("infer_tags", rendered, deadline).await?;
        let mut inference: TagInference = self.parse_reply("infer_tags", &reply)?;
        inference.temperature = inference.temperature.clamp(0.0, 1.0);
        inference.tags.truncate(max_tags);
        Ok(inference)
    }

    async fn reflect(
        &self,
        transcript: &Transcript,
        playbook: &Playbook,
        deadline: Deadline,
    ) -> PlaybookResult<ReflectionResult> {
        let rendered = self.templates.render(
            TemplateKind::Reflection,
            &[
                ("transcript", &transcript.rendered()),
                ("playbook", &Self::playbook_digest(playbook)),
                ("merge_threshold", &format!("{:.2}", self.merge_threshold)),
            ],
        );
        let reply = self.complete("reflect", rendered, deadline).await?;
        self.parse_reply("reflect", &reply)
    }

    async fn migrate_to_when_do(
        &self,
        kpt: &KeyPoint,
        deadline: Deadline,
    ) -> PlaybookResult<WhenDoMigration> {
        let rendered = self
            .templates
            .render(TemplateKind::Migration, &[("text", &kpt.text.render())]);
        let reply = self.complete("migrate_to_when_do", rendered, deadline).await?;
        let mut migration: WhenDoMigration = self.parse_reply("migrate_to_when_do", &reply)?;
        migration.confidence = migration.confidence.clamp(0.0, 1.0);
        Ok(migration)
    }
}

impl std::fmt::Debug for OpenAiGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiGateway")
            .field("client", &self.client)
            .field("model", &self.model)
            .field("retries", &self.retries)
            .finish()
    }
}
