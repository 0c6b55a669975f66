//! Artifact extraction and sandboxed writing.
//!
//! [`extractor`] is a pure function from model output to declared file units.
//! [`writer`] resolves each unit under a project root and refuses anything
//! that would land outside it.

pub mod extractor;
pub mod writer;

pub use extractor::{extract_artifacts, Artifact};
pub use writer::{ArtifactWriter, WriteReport};
