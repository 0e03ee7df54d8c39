//! Error types for playbook operations

use thiserror::Error;

/// Storage layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Corrupt playbook at {path}: {reason}")]
    CorruptPlaybook { path: String, reason: String },

    #[error("Invariant violation: {invariant}")]
    InvariantViolation { invariant: String },

    #[error("I/O failure during {operation}: {reason}")]
    Io { operation: String, reason: String },

    #[error("Lock on {path} not acquired: {reason}")]
    LockFailed { path: String, reason: String },

    #[error("Playbook changed on disk while unlocked")]
    ConcurrentUpdate,
}

/// LLM gateway errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LlmError {
    #[error("No API key configured for {provider}")]
    MissingApiKey { provider: String },

    #[error("Transport failure talking to {provider} after {attempts} attempt(s): {message}")]
    Transport {
        provider: String,
        attempts: u32,
        message: String,
    },

    #[error("Rate limited by {provider}")]
    RateLimited { provider: String },

    #[error("Malformed reply from {provider}: {reason}")]
    Schema { provider: String, reason: String },

    #[error("Deadline exhausted before {operation} completed")]
    Timeout { operation: String },
}

impl LlmError {
    /// Transport and rate-limit failures are retryable; schema and
    /// deadline failures are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::RateLimited { .. })
    }
}

/// Reflection pipeline errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReflectError {
    #[error("Reflection rejected: {invariant}")]
    Rejected { invariant: String },

    #[error("Reflection lost a concurrent update race: {reason}")]
    ConcurrentUpdate { reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Top-level error type for all playbook operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PlaybookError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Reflection error: {0}")]
    Reflect(#[from] ReflectError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result alias used across all playbook crates.
pub type PlaybookResult<T> = Result<T, PlaybookError>;
