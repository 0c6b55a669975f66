//! TDD role swarm runtime
//!
//! Routes a requirement to the right role model, keeps the working set of
//! models inside the host's memory budget, and drives the design → implement
//! → test → review → commit → document loop on top of the deterministic
//! pieces in `coordination`.

pub mod api;
pub mod config;
pub mod gateway;
pub mod inference;
pub mod learning;
pub mod orchestrator;
pub mod prompts;
pub mod residency;
pub mod roles;
pub mod sandbox;
pub mod state_machine;
