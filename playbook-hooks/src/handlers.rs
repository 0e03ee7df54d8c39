//! The three lifecycle entry points the host assistant invokes.
//!
//! Each handler swallows every error at its boundary: a failed prompt
//! hook degrades to "no context added", a failed reflection leaves the
//! file untouched. Reflections hold the exclusive lock only around
//! load and store; the LLM call runs unlocked and its result is rebased
//! if the playbook moved underneath it.

use crate::diagnostics::Diagnostics;
use crate::inject::render_injection;
use playbook_core::tags::normalize_tags;
use playbook_core::{
    Deadline, KeyPointText, PlaybookConfig, PlaybookResult, StorageError, Transcript,
    MIGRATION_CONFIDENCE_FLOOR,
};
use playbook_engine::{select, Reflector, SelectionRequest};
use playbook_llm::heuristics::{adaptive_temperature, fallback_inference};
use playbook_llm::templates::PromptTemplates;
use playbook_llm::{LlmGateway, DEFAULT_MAX_TAGS};
use playbook_storage::{LockMode, PlaybookLock, PlaybookStore};
use std::sync::Arc;

/// Orchestrates selector and reflector around storage for the host's
/// three lifecycle triggers.
pub struct TriggerHandlers {
    config: PlaybookConfig,
    store: PlaybookStore,
    reflector: Reflector,
    gateway: Arc<dyn LlmGateway>,
    templates: PromptTemplates,
    diagnostics: Diagnostics,
}

impl TriggerHandlers {
    pub fn new(config: PlaybookConfig, gateway: Arc<dyn LlmGateway>) -> Self {
        Self {
            store: PlaybookStore::from_config(&config),
            reflector: Reflector::from_config(&config),
            templates: PromptTemplates::load(config.templates_dir.as_deref()),
            diagnostics: Diagnostics::from_config(&config),
            config,
            gateway,
        }
    }

    /// Prompt-time trigger: pick relevant key points and hand back the
    /// injection payload. Read-only; never writes the playbook.
    pub async fn on_prompt_submit(
        &self,
        prompt: &str,
        history: &Transcript,
        deadline: Deadline,
    ) -> Option<String> {
        match self.prompt_submit_inner(prompt, history, deadline).await {
            Ok(payload) => payload,
            Err(error) => {
                self.diagnostics.record("on_prompt_submit", &error);
                None
            }
        }
    }

    /// Session-end trigger: reflect the transcript into the playbook.
    pub async fn on_session_end(&self, transcript: &Transcript, deadline: Deadline) {
        if !self.config.update_on_exit {
            return;
        }
        if let Err(error) = self.reflect_and_store(transcript, deadline).await {
            self.diagnostics.record("on_session_end", &error);
        }
    }

    /// Pre-compaction trigger: same pipeline as session end, run before
    /// the host compacts its context window. Idempotent over a given
    /// transcript because merges and promotions converge.
    pub async fn on_pre_compact(&self, transcript: &Transcript, deadline: Deadline) {
        if !self.config.update_on_clear {
            return;
        }
        if let Err(error) = self.reflect_and_store(transcript, deadline).await {
            self.diagnostics.record("on_pre_compact", &error);
        }
    }

    async fn prompt_submit_inner(
        &self,
        prompt: &str,
        history: &Transcript,
        deadline: Deadline,
    ) -> PlaybookResult<Option<String>> {
        let playbook = {
            let _lock = PlaybookLock::acquire(&self.config.playbook_path, LockMode::Shared, deadline)?;
            self.store.load()?
        };
        // Nothing injectable yet; skip the tagger round-trip entirely.
        if playbook.stable().next().is_none() {
            return Ok(None);
        }

        let inference = match self
            .gateway
            .infer_tags(prompt, history, DEFAULT_MAX_TAGS, deadline)
            .await
        {
            Ok(inference) => inference,
            Err(error) => {
                tracing::debug!(error = %error, "tagger unavailable, using local fallback");
                fallback_inference(prompt, DEFAULT_MAX_TAGS, self.config.default_temperature)
            }
        };

        let mut temperature = inference.temperature;
        if self.config.adaptive_temperature {
            temperature = adaptive_temperature(prompt, temperature);
        }

        let prompt_tags = normalize_tags(&inference.tags);
        let picks = select(
            &playbook,
            &SelectionRequest {
                prompt,
                prompt_tags: &prompt_tags,
                temperature,
                limit: self.config.selection_limit,
            },
        );
        if picks.is_empty() {
            return Ok(None);
        }
        Ok(Some(render_injection(&self.templates, &picks)))
    }

    /// One reflection cycle. The exclusive lock brackets only the two
    /// disk phases; the playbook observed before the LLM call is
    /// re-verified by fingerprint before anything is written.
    async fn reflect_and_store(
        &self,
        transcript: &Transcript,
        deadline: Deadline,
    ) -> PlaybookResult<()> {
        if transcript.is_empty() {
            return Ok(());
        }

        let (playbook, fingerprint) = {
            let _lock =
                PlaybookLock::acquire(&self.config.playbook_path, LockMode::Exclusive, deadline)?;
            (self.store.load()?, self.store.fingerprint()?)
        };

        let outcome = self.gateway.reflect(transcript, &playbook, deadline).await?;

        let _lock =
            PlaybookLock::acquire(&self.config.playbook_path, LockMode::Exclusive, deadline)?;
        let (base, outcome) = if self.store.fingerprint()? == fingerprint {
            (playbook, outcome)
        } else {
            tracing::debug!("playbook moved during reflection, rebasing");
            let latest = self.store.load()?;
            let rebased = self.reflector.rebase(&outcome, &latest)?;
            (latest, rebased)
        };

        let snapshot = self.store.snapshot()?;
        let mut next = self.reflector.apply(&base, &outcome)?;
        if let Err(error) = self.store.store(&mut next) {
            // The atomic store left the live file alone, but the
            // rollback bracket restores defensively anyway.
            let _ = self.store.restore(&snapshot);
            return Err(error);
        }
        Ok(())
    }

    /// Up-convert legacy single-text key points to the `when`/`do`
    /// shape. Conversions below the confidence floor keep their legacy
    /// shape. Returns how many key points were migrated.
    pub async fn migrate_legacy(&self, deadline: Deadline) -> PlaybookResult<usize> {
        let (playbook, fingerprint) = {
            let _lock =
                PlaybookLock::acquire(&self.config.playbook_path, LockMode::Exclusive, deadline)?;
            (self.store.load()?, self.store.fingerprint()?)
        };

        let legacy: Vec<String> = playbook
            .key_points
            .iter()
            .filter(|k| matches!(k.text, KeyPointText::Plain(_)))
            .map(|k| k.name.clone())
            .collect();
        if legacy.is_empty() {
            return Ok(0);
        }

        let mut migrations = Vec::new();
        for name in &legacy {
            let Some(kpt) = playbook.get(name) else {
                continue;
            };
            match self.gateway.migrate_to_when_do(kpt, deadline).await {
                Ok(migration) if migration.confidence >= MIGRATION_CONFIDENCE_FLOOR => {
                    migrations.push((name.clone(), migration));
                }
                Ok(migration) => {
                    tracing::debug!(
                        name = %name,
                        confidence = migration.confidence,
                        "migration below confidence floor, keeping legacy shape"
                    );
                }
                Err(error) => {
                    tracing::debug!(name = %name, error = %error, "migration call failed, keeping legacy shape");
                }
            }
        }
        if migrations.is_empty() {
            return Ok(0);
        }

        let _lock =
            PlaybookLock::acquire(&self.config.playbook_path, LockMode::Exclusive, deadline)?;
        if self.store.fingerprint()? != fingerprint {
            return Err(StorageError::ConcurrentUpdate.into());
        }

        let snapshot = self.store.snapshot()?;
        let mut next = playbook;
        let migrated = migrations.len();
        for (name, migration) in migrations {
            if let Some(kpt) = next.get_mut(&name) {
                kpt.text = KeyPointText::WhenDo {
                    when: migration.when,
                    then: migration.then,
                };
            }
        }
        next.touch();
        if let Err(error) = self.store.store(&mut next) {
            let _ = self.store.restore(&snapshot);
            return Err(error);
        }
        Ok(migrated)
    }

    /// The store this handler set operates on; exposed for tests and
    /// host-side maintenance tooling.
    pub fn store(&self) -> &PlaybookStore {
        &self.store
    }
}
