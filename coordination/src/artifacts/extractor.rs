//! Extract declared file units from free-form model output.
//!
//! Grammar (one file unit):
//!
//! ```text
//! unit      := outer | inner
//! outer     := decl NEWLINE blank* fence
//! inner     := FENCE_OPEN NEWLINE decl NEWLINE body FENCE_CLOSE
//! fence     := FENCE_OPEN NEWLINE body FENCE_CLOSE
//! decl      := '#'+ SP* 'File:' SP* path
//! FENCE_OPEN  := '```' lang?          (at line start)
//! FENCE_CLOSE := '```' SP* (NEWLINE | EOF)   (may end a body line)
//! ```
//!
//! Both placements are equivalent. When both are present the outer declaration
//! wins and the body is kept whole. Bodies are trimmed; empty bodies are
//! dropped. When a path is declared twice the first occurrence in document
//! order wins.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?ms)^[ \t]*```[A-Za-z0-9_+.\-]*[ \t]*\r?\n(.*?)```[ \t]*\r?(?:\n|\z)").unwrap()
});

static DECLARATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*#+\s*(?i:file)\s*:\s*(\S+)\s*$").unwrap());

/// A file unit declared in model output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Path exactly as declared (validated later by the writer).
    pub path: String,
    /// Trimmed, non-empty body.
    pub content: String,
    /// Zero-based position among extracted artifacts.
    pub order: usize,
}

/// Parse a declaration line, returning the declared path.
fn declared_path(line: &str) -> Option<String> {
    let caps = DECLARATION.captures(line)?;
    let path = caps[1].trim_matches(|c| matches!(c, '`' | '"' | '\''));
    (!path.is_empty()).then(|| path.to_string())
}

/// Last non-blank line of `text`, if any.
fn last_non_blank_line(text: &str) -> Option<&str> {
    text.lines().rev().find(|l| !l.trim().is_empty())
}

/// Extract every declared file unit from `text`.
///
/// Total: never fails, returns an empty list when nothing is declared.
pub fn extract_artifacts(text: &str) -> Vec<Artifact> {
    let mut artifacts = Vec::new();
    let mut seen = HashSet::new();
    let mut cursor = 0;

    for caps in FENCE.captures_iter(text) {
        let (Some(block), Some(body)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let preceding = &text[cursor..block.start()];
        cursor = block.end();

        let body = body.as_str();
        let outer = last_non_blank_line(preceding).and_then(declared_path);

        let (path, content) = match outer {
            Some(path) => (path, body),
            None => {
                let (first, rest) = body.split_once('\n').unwrap_or((body, ""));
                match declared_path(first) {
                    Some(path) => (path, rest),
                    None => continue,
                }
            }
        };

        let content = content.trim();
        if content.is_empty() {
            tracing::debug!(path = %path, "Dropping empty artifact");
            continue;
        }
        if !seen.insert(path.clone()) {
            tracing::debug!(path = %path, "Duplicate artifact declaration ignored");
            continue;
        }

        artifacts.push(Artifact {
            order: artifacts.len(),
            path,
            content: content.to_string(),
        });
    }

    artifacts
}
