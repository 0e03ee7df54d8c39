//! Playbook Core - Entity Types
//!
//! Data types shared by every playbook crate: the playbook document and
//! its key points, tag primitives, LLM exchange shapes, configuration
//! and errors. No I/O and no business logic beyond validation.

// Core modules
mod config;
mod deadline;
mod error;
mod kpt;
mod llm;
mod playbook;
mod transcript;

pub mod tags;

// Re-export config types
pub use config::*;

// Re-export deadline
pub use deadline::*;

// Re-export error types
pub use error::*;

// Re-export key point types
pub use kpt::*;

// Re-export LLM exchange shapes
pub use llm::*;

// Re-export the playbook document
pub use playbook::*;

// Re-export transcript types
pub use transcript::*;
