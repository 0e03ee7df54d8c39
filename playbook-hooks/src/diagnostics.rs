//! Structured diagnostic records for swallowed handler errors.
//!
//! Handlers never fail loudly; whatever goes wrong ends up here. With
//! `diagnostic_mode` on, records are appended as JSON lines to a
//! `diagnostics/` directory beside the playbook, secrets redacted.

use chrono::Utc;
use playbook_core::{LlmError, PlaybookConfig, PlaybookError, ReflectError, StorageError};
use playbook_llm::redact::redact;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use uuid::Uuid;

const LOG_FILE: &str = "playbook-diagnostics.jsonl";

/// Sink for structured error records.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    enabled: bool,
    dir: PathBuf,
}

impl Diagnostics {
    pub fn from_config(config: &PlaybookConfig) -> Self {
        let dir = config
            .playbook_path
            .parent()
            .map(|p| p.join("diagnostics"))
            .unwrap_or_else(|| PathBuf::from("diagnostics"));
        Self {
            enabled: config.diagnostic_mode,
            dir,
        }
    }

    /// Record a swallowed error. Always traced; persisted only in
    /// diagnostic mode. Never fails.
    pub fn record(&self, handler: &str, error: &PlaybookError) {
        let kind = error_kind(error);
        let message = redact(&error.to_string());
        tracing::warn!(handler, kind, %message, "handler degraded to no-op");
        if !self.enabled {
            return;
        }

        let record = serde_json::json!({
            "id": Uuid::now_v7().to_string(),
            "timestamp": Utc::now().to_rfc3339(),
            "handler": handler,
            "kind": kind,
            "message": message,
        });
        if let Err(e) = self.append(&record) {
            tracing::warn!(error = %e, "diagnostic record dropped");
        }
    }

    fn append(&self, record: &serde_json::Value) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(LOG_FILE))?;
        writeln!(file, "{record}")
    }
}

/// Stable error-kind labels for the diagnostic stream.
fn error_kind(error: &PlaybookError) -> &'static str {
    match error {
        PlaybookError::Storage(StorageError::CorruptPlaybook { .. }) => "corrupt_playbook",
        PlaybookError::Storage(StorageError::InvariantViolation { .. }) => "invariant_violation",
        PlaybookError::Storage(StorageError::Io { .. }) => "io",
        PlaybookError::Storage(StorageError::LockFailed { .. }) => "lock_failed",
        PlaybookError::Storage(StorageError::ConcurrentUpdate) => "concurrent_update",
        PlaybookError::Llm(LlmError::MissingApiKey { .. }) => "llm_missing_api_key",
        PlaybookError::Llm(LlmError::Transport { .. }) => "llm_transport",
        PlaybookError::Llm(LlmError::RateLimited { .. }) => "llm_rate_limited",
        PlaybookError::Llm(LlmError::Schema { .. }) => "llm_schema",
        PlaybookError::Llm(LlmError::Timeout { .. }) => "llm_timeout",
        PlaybookError::Reflect(ReflectError::Rejected { .. }) => "reflection_rejected",
        PlaybookError::Reflect(ReflectError::ConcurrentUpdate { .. }) => "concurrent_update",
        PlaybookError::Config(_) => "config",
    }
}
