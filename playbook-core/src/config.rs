//! Configuration types

use crate::error::ConfigError;
use crate::playbook::ValidationLimits;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// LLM endpoint configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Absent key means the gateway runs in fallback-only mode.
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    /// Per-request timeout; the caller deadline caps it further.
    pub timeout: Duration,
    /// Retries on transport errors only; schema errors never retry.
    pub retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            timeout: Duration::from_millis(30_000),
            retries: 2,
        }
    }
}

/// Master configuration for the playbook engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybookConfig {
    /// Playbook file; the lock, backups and diagnostics live beside it.
    pub playbook_path: PathBuf,
    pub llm: LlmConfig,

    /// Minimum model-reported similarity to merge two key points.
    pub merge_threshold: f64,
    /// Items scored at or below this are pruned by reflection.
    pub prune_threshold: i32,
    /// Maximum playbook size; lowest-scored stable items are evicted.
    pub max_kpts: usize,
    /// Default number of key points injected per prompt.
    pub selection_limit: usize,
    /// Used when the model did not suggest a temperature.
    pub default_temperature: f64,
    /// Timestamped backups retained beside the playbook.
    pub backup_keep: usize,

    /// Reflect on normal session end.
    pub update_on_exit: bool,
    /// Reflect before the host compacts its context window.
    pub update_on_clear: bool,
    /// Write structured records to a sibling diagnostics directory.
    pub diagnostic_mode: bool,
    /// Let prompt keywords override the model-suggested temperature.
    pub adaptive_temperature: bool,
    /// Overrides the built-in prompt templates per file.
    pub templates_dir: Option<PathBuf>,
}

impl Default for PlaybookConfig {
    fn default() -> Self {
        Self {
            playbook_path: PathBuf::from(".claude/playbook.json"),
            llm: LlmConfig::default(),
            merge_threshold: 0.80,
            prune_threshold: -5,
            max_kpts: 250,
            selection_limit: 6,
            default_temperature: 0.5,
            backup_keep: 3,
            update_on_exit: true,
            update_on_clear: true,
            diagnostic_mode: false,
            adaptive_temperature: true,
            templates_dir: None,
        }
    }
}

impl PlaybookConfig {
    /// Read configuration from `PLAYBOOK_*` environment variables,
    /// falling back to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(path) = env_var("PLAYBOOK_PATH") {
            config.playbook_path = PathBuf::from(path);
        }
        config.llm.api_key = env_var("PLAYBOOK_LLM_API_KEY").or_else(|| env_var("OPENAI_API_KEY"));
        if let Some(url) = env_var("PLAYBOOK_LLM_BASE_URL") {
            config.llm.base_url = url;
        }
        if let Some(model) = env_var("PLAYBOOK_LLM_MODEL") {
            config.llm.model = model;
        }
        if let Some(ms) = env_parsed::<u64>("PLAYBOOK_LLM_TIMEOUT_MS") {
            config.llm.timeout = Duration::from_millis(ms);
        }
        if let Some(n) = env_parsed::<u32>("PLAYBOOK_LLM_RETRIES") {
            config.llm.retries = n;
        }
        if let Some(v) = env_parsed::<f64>("PLAYBOOK_MERGE_THRESHOLD") {
            config.merge_threshold = v;
        }
        if let Some(v) = env_parsed::<i32>("PLAYBOOK_PRUNE_THRESHOLD") {
            config.prune_threshold = v;
        }
        if let Some(v) = env_parsed::<usize>("PLAYBOOK_MAX_KPTS") {
            config.max_kpts = v;
        }
        if let Some(v) = env_parsed::<usize>("PLAYBOOK_SELECTION_LIMIT") {
            config.selection_limit = v;
        }
        if let Some(v) = env_parsed::<f64>("PLAYBOOK_DEFAULT_TEMPERATURE") {
            config.default_temperature = v;
        }
        if let Some(v) = env_parsed::<usize>("PLAYBOOK_BACKUP_KEEP") {
            config.backup_keep = v;
        }
        if let Some(v) = env_bool("PLAYBOOK_UPDATE_ON_EXIT") {
            config.update_on_exit = v;
        }
        if let Some(v) = env_bool("PLAYBOOK_UPDATE_ON_CLEAR") {
            config.update_on_clear = v;
        }
        if let Some(v) = env_bool("PLAYBOOK_DIAGNOSTIC_MODE") {
            config.diagnostic_mode = v;
        }
        if let Some(v) = env_bool("PLAYBOOK_ADAPTIVE_TEMPERATURE") {
            config.adaptive_temperature = v;
        }
        if let Some(dir) = env_var("PLAYBOOK_TEMPLATES_DIR") {
            config.templates_dir = Some(PathBuf::from(dir));
        }

        config
    }

    /// Reject values outside their documented ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.merge_threshold) {
            return Err(ConfigError::InvalidValue {
                field: "merge_threshold".to_string(),
                value: self.merge_threshold.to_string(),
                reason: "must be in [0, 1]".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.default_temperature) {
            return Err(ConfigError::InvalidValue {
                field: "default_temperature".to_string(),
                value: self.default_temperature.to_string(),
                reason: "must be in [0, 1]".to_string(),
            });
        }
        if self.max_kpts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_kpts".to_string(),
                value: "0".to_string(),
                reason: "playbook must be allowed at least one key point".to_string(),
            });
        }
        Ok(())
    }

    /// The invariant bounds enforced on every store.
    pub fn limits(&self) -> ValidationLimits {
        ValidationLimits {
            prune_threshold: self.prune_threshold,
            max_kpts: self.max_kpts,
        }
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_var(key).and_then(|v| v.trim().parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    env_var(key).map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}
