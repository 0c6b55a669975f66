//! Coordination library for the TDD role swarm
//!
//! Deterministic building blocks used by the orchestration runtime. Nothing in
//! here talks to an inference host:
//!
//! - [`router`]: routing decision types, classifier output sanitization, the
//!   security gate and the classifier instruction template
//! - [`escalation`]: per-task failure counters with threshold advice
//! - [`artifacts`]: file-unit extraction from model output and sandboxed writes
//! - [`verifier`]: tree-sitter based static pre-check of generated source
//! - [`shell_safety`]: command allow-list and argument validation
//! - [`git_manager`]: commits of the project root
//! - [`task`]: task identity and fingerprinting

pub mod artifacts;
pub mod error;
pub mod escalation;
pub mod git_manager;
pub mod router;
pub mod shell_safety;
pub mod task;
pub mod verifier;

pub use error::{CoordinationError, CoordinationResult};
