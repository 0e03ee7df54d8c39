//! Playbook Engine - Selection and Reflection
//!
//! The decision layer: the prompt-time selector (hot path) and the
//! reflection pipeline that folds transcripts back into the playbook.
//! Both are pure over in-memory data; persistence and locking live in
//! `playbook-storage`, orchestration in `playbook-hooks`.

mod reflector;
mod selector;

pub use reflector::Reflector;
pub use selector::{
    select, Layer, Selected, SelectionRequest, HIGH_CONFIDENCE_THRESHOLD, WEIGHT_FLOOR,
};
