//! Playbook LLM - Gateway Layer
//!
//! Single typed entry point to the external model: tag inference,
//! reflection and legacy-shape migration. The gateway shapes requests
//! from templates and parses strict-JSON replies; it carries no scoring
//! or merge rules. Transport failures are retried with backoff inside
//! the caller's deadline; schema failures are terminal.

use async_trait::async_trait;
use playbook_core::{
    Deadline, KeyPoint, Playbook, PlaybookResult, ReflectionResult, TagInference, Transcript,
    WhenDoMigration,
};

pub mod heuristics;
pub mod redact;
pub mod templates;

pub mod providers;

pub use providers::openai::OpenAiGateway;
pub use templates::PromptTemplates;

/// Upper bound on tags requested per prompt.
pub const DEFAULT_MAX_TAGS: usize = 8;

/// The single interface the engine uses to talk to a model.
///
/// Implementations must be thread-safe; trigger handlers share one
/// gateway across invocations.
#[async_trait]
pub trait LlmGateway: Send + Sync {
    /// Infer retrieval tags and a selection temperature for a prompt.
    async fn infer_tags(
        &self,
        prompt: &str,
        history: &Transcript,
        max_tags: usize,
        deadline: Deadline,
    ) -> PlaybookResult<TagInference>;

    /// Reflect a finished transcript against the current playbook.
    async fn reflect(
        &self,
        transcript: &Transcript,
        playbook: &Playbook,
        deadline: Deadline,
    ) -> PlaybookResult<ReflectionResult>;

    /// Propose a `when`/`do` shape for a legacy key point.
    async fn migrate_to_when_do(
        &self,
        kpt: &KeyPoint,
        deadline: Deadline,
    ) -> PlaybookResult<WhenDoMigration>;
}
