//! Playbook Test Utilities
//!
//! Centralized test infrastructure for the playbook workspace:
//! - A scripted, deterministic gateway standing in for the LLM
//! - Builders for key points and playbooks

// Re-export core types for convenience
pub use playbook_core::{
    Assessment, CandidateKeyPoint, Deadline, KeyPoint, KeyPointText, KptDelta, LlmError,
    MergeGroup, Playbook, PlaybookConfig, PlaybookError, PlaybookResult, ReflectionResult,
    TagInference, Transcript, Turn, WhenDoMigration,
};
pub use playbook_llm::LlmGateway;

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::sync::Mutex;

// ============================================================================
// SCRIPTED GATEWAY
// ============================================================================

/// A deterministic stand-in for the LLM gateway.
///
/// Replies are queued per method and popped in order; an empty queue
/// yields a transport error, which exercises the fallback paths.
#[derive(Debug, Default)]
pub struct ScriptedGateway {
    tag_replies: Mutex<VecDeque<TagInference>>,
    reflections: Mutex<VecDeque<ReflectionResult>>,
    migrations: Mutex<VecDeque<WhenDoMigration>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_tags(&self, inference: TagInference) {
        self.tag_replies.lock().unwrap().push_back(inference);
    }

    pub fn push_reflection(&self, result: ReflectionResult) {
        self.reflections.lock().unwrap().push_back(result);
    }

    pub fn push_migration(&self, migration: WhenDoMigration) {
        self.migrations.lock().unwrap().push_back(migration);
    }

    fn exhausted(method: &str) -> PlaybookError {
        PlaybookError::Llm(LlmError::Transport {
            provider: "scripted".to_string(),
            attempts: 1,
            message: format!("no scripted reply left for {method}"),
        })
    }
}

#[async_trait]
impl LlmGateway for ScriptedGateway {
    async fn infer_tags(
        &self,
        _prompt: &str,
        _history: &Transcript,
        _max_tags: usize,
        _deadline: Deadline,
    ) -> PlaybookResult<TagInference> {
        self.tag_replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Self::exhausted("infer_tags"))
    }

    async fn reflect(
        &self,
        _transcript: &Transcript,
        _playbook: &Playbook,
        _deadline: Deadline,
    ) -> PlaybookResult<ReflectionResult> {
        self.reflections
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Self::exhausted("reflect"))
    }

    async fn migrate_to_when_do(
        &self,
        _kpt: &KeyPoint,
        _deadline: Deadline,
    ) -> PlaybookResult<WhenDoMigration> {
        self.migrations
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Self::exhausted("migrate_to_when_do"))
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

/// A stable key point with the given text, tags and score.
pub fn stable_kpt(name: &str, text: &str, tags: &[&str], score: i32) -> KeyPoint {
    let mut kpt = KeyPoint::new_pending(
        name,
        KeyPointText::Plain(text.to_string()),
        tags.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
    );
    kpt.score = score;
    kpt.pending = false;
    kpt
}

/// A pending key point with the given text and tags.
pub fn pending_kpt(name: &str, text: &str, tags: &[&str]) -> KeyPoint {
    KeyPoint::new_pending(
        name,
        KeyPointText::Plain(text.to_string()),
        tags.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
    )
}

/// A playbook holding the given key points as-is.
pub fn playbook_with(key_points: Vec<KeyPoint>) -> Playbook {
    let mut playbook = Playbook::empty();
    playbook.key_points = key_points;
    playbook
}

/// A tag inference reply with normalized-looking tags.
pub fn tags_reply(tags: &[&str], temperature: f64) -> TagInference {
    TagInference {
        tags: tags.iter().map(|s| s.to_string()).collect(),
        temperature,
        complexity: None,
    }
}
