//! Provider implementations of the gateway trait.
//!
//! One provider ships: any OpenAI-compatible chat-completions endpoint
//! (the configured base URL decides which). Tests use the scripted
//! gateway from `playbook-test-utils` instead.

pub mod openai;
