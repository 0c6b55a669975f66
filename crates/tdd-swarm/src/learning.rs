//! Markdown learning log appended after successful runs.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use coordination::router::truncate_chars;

/// Header written when the log file is created.
pub const LOG_HEADER: &str = "# Learned Skills\n";

/// Longest prompt excerpt kept per entry.
const MAX_PROMPT_CHARS: usize = 300;

/// One successful run worth remembering.
#[derive(Debug, Clone)]
pub struct LearningEntry {
    pub timestamp: DateTime<Utc>,
    pub task: String,
    /// The prompt that produced the passing implementation.
    pub best_prompt: String,
    pub insights: Vec<String>,
}

impl LearningEntry {
    fn render(&self) -> String {
        let mut out = format!(
            "\n### [{}] {}\n- **Best Prompt**: `{}`\n",
            self.timestamp.format("%Y-%m-%d %H:%M"),
            self.task.trim(),
            truncate_chars(self.best_prompt.trim(), MAX_PROMPT_CHARS).replace('`', "'"),
        );
        if self.insights.is_empty() {
            out.push_str("- **Insights**: none recorded\n");
        } else {
            out.push_str("- **Insights**:\n");
            for insight in &self.insights {
                out.push_str(&format!("  - {}\n", insight.trim()));
            }
        }
        out
    }
}

/// Append-only markdown knowledge file.
#[derive(Debug, Clone)]
pub struct LearningLog {
    path: PathBuf,
}

impl LearningLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &LearningEntry) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let is_new = !self.path.exists();
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        if is_new {
            file.write_all(LOG_HEADER.as_bytes())?;
        }
        file.write_all(entry.render().as_bytes())
            .with_context(|| format!("Failed to append to {}", self.path.display()))?;
        tracing::info!(path = %self.path.display(), task = %entry.task, "Learning log updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(task: &str) -> LearningEntry {
        LearningEntry {
            timestamp: Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).unwrap(),
            task: task.into(),
            best_prompt: "Write `add(a, b)`".into(),
            insights: vec!["tests passed on attempt 2".into()],
        }
    }

    #[test]
    fn test_creates_file_with_header() {
        let dir = tempfile::tempdir().unwrap();
        let log = LearningLog::new(dir.path().join("notes/LEARNED.md"));
        log.append(&entry("add two integers")).unwrap();

        let text = std::fs::read_to_string(log.path()).unwrap();
        assert!(text.starts_with(LOG_HEADER));
        assert!(text.contains("### [2026-03-01 09:30] add two integers"));
        assert!(text.contains("- **Best Prompt**: `Write 'add(a, b)'`"));
        assert!(text.contains("  - tests passed on attempt 2"));
    }

    #[test]
    fn test_appends_without_second_header() {
        let dir = tempfile::tempdir().unwrap();
        let log = LearningLog::new(dir.path().join("LEARNED.md"));
        log.append(&entry("first")).unwrap();
        log.append(&entry("second")).unwrap();

        let text = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(text.matches(LOG_HEADER.trim()).count(), 1);
        assert!(text.find("first").unwrap() < text.find("second").unwrap());
    }
}
