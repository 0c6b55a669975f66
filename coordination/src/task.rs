//! Task identity and fingerprinting.
//!
//! The fingerprint keys escalation counters. The default strategy keys on the
//! first 50 characters of the requirement, which lets unrelated tasks sharing
//! a prefix collide; `ContentHash` keys on a blake3 digest of the full
//! requirement and reference document instead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::router::decision::truncate_chars;

/// Characters of requirement text used by the prefix strategy.
pub const FINGERPRINT_PREFIX_CHARS: usize = 50;

/// How task fingerprints are derived.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FingerprintStrategy {
    /// First 50 characters of the requirement.
    #[default]
    Prefix,
    /// blake3 hex digest of requirement and reference document.
    ContentHash,
}

impl FingerprintStrategy {
    /// Parse a config value ("prefix" or "content-hash").
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "prefix" => Some(Self::Prefix),
            "content-hash" | "content_hash" | "hash" => Some(Self::ContentHash),
            _ => None,
        }
    }

    /// Derive a fingerprint for the given task content.
    pub fn fingerprint(self, requirement: &str, reference: Option<&str>) -> String {
        match self {
            Self::Prefix => truncate_chars(requirement, FINGERPRINT_PREFIX_CHARS),
            Self::ContentHash => {
                let mut hasher = blake3::Hasher::new();
                hasher.update(requirement.as_bytes());
                // Separator keeps ("ab", "c") and ("a", "bc") distinct.
                hasher.update(&[0u8]);
                if let Some(doc) = reference {
                    hasher.update(doc.as_bytes());
                }
                hasher.finalize().to_hex().to_string()
            }
        }
    }
}

/// A unit of work entering the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub fingerprint: String,
    pub requirement: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Create a task, fingerprinting it with `strategy`.
    pub fn new(
        requirement: impl Into<String>,
        reference: Option<String>,
        strategy: FingerprintStrategy,
    ) -> Self {
        let requirement = requirement.into();
        let fingerprint = strategy.fingerprint(&requirement, reference.as_deref());
        Self {
            id: Uuid::new_v4(),
            fingerprint,
            requirement,
            reference,
            created_at: Utc::now(),
        }
    }

    /// Requirement shortened for commit subjects and log lines.
    pub fn summary(&self, max_chars: usize) -> String {
        truncate_chars(&self.requirement, max_chars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_fingerprint_collides_on_shared_prefix() {
        let base = "x".repeat(50);
        let a = FingerprintStrategy::Prefix.fingerprint(&format!("{base} first"), None);
        let b = FingerprintStrategy::Prefix.fingerprint(&format!("{base} second"), None);
        assert_eq!(a, b);
        assert_eq!(a.chars().count(), 50);
    }

    #[test]
    fn test_content_hash_distinguishes_shared_prefix() {
        let base = "x".repeat(50);
        let a = FingerprintStrategy::ContentHash.fingerprint(&format!("{base} first"), None);
        let b = FingerprintStrategy::ContentHash.fingerprint(&format!("{base} second"), None);
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_content_hash_includes_reference() {
        let a = FingerprintStrategy::ContentHash.fingerprint("task", Some("doc a"));
        let b = FingerprintStrategy::ContentHash.fingerprint("task", Some("doc b"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!(FingerprintStrategy::parse("prefix"), Some(FingerprintStrategy::Prefix));
        assert_eq!(
            FingerprintStrategy::parse("Content-Hash"),
            Some(FingerprintStrategy::ContentHash)
        );
        assert_eq!(FingerprintStrategy::parse("md5"), None);
    }

    #[test]
    fn test_task_new() {
        let task = Task::new("add two integers", None, FingerprintStrategy::Prefix);
        assert_eq!(task.fingerprint, "add two integers");
        assert_eq!(task.summary(3), "add");
    }
}
