//! Write extracted artifacts under a project root.
//!
//! Paths are normalized lexically first, so `..` escapes and absolute paths are
//! refused before anything touches the disk. Existing ancestors are then
//! canonicalized to catch symlinks pointing outside the root.

use std::path::{Component, Path, PathBuf};

use serde::Serialize;

use super::extractor::Artifact;
use crate::error::{CoordinationError, CoordinationResult};

/// Outcome of writing a batch of artifacts.
#[derive(Debug, Default, Serialize)]
pub struct WriteReport {
    /// Root-relative paths written, in artifact order.
    pub written: Vec<String>,
    /// Rejected artifacts with the reason.
    pub rejected: Vec<RejectedArtifact>,
}

/// An artifact the writer refused.
#[derive(Debug, Serialize)]
pub struct RejectedArtifact {
    pub path: String,
    pub code: &'static str,
    pub message: String,
    pub security_violation: bool,
}

impl WriteReport {
    /// Whether any artifact was refused for escaping the root.
    pub fn has_security_violation(&self) -> bool {
        self.rejected.iter().any(|r| r.security_violation)
    }
}

/// Writes artifacts beneath a fixed project root.
#[derive(Debug, Clone)]
pub struct ArtifactWriter {
    root: PathBuf,
}

impl ArtifactWriter {
    /// Create a writer for `root`. The root must exist.
    pub fn new(root: impl AsRef<Path>) -> CoordinationResult<Self> {
        let root = root.as_ref();
        let root = root
            .canonicalize()
            .map_err(|e| CoordinationError::io(root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a declared path to an absolute path inside the root without
    /// touching the filesystem.
    pub fn resolve(&self, declared: &str) -> CoordinationResult<PathBuf> {
        let trimmed = declared.trim();
        if trimmed.is_empty() {
            return Err(CoordinationError::invalid_path(declared, "empty path"));
        }
        if trimmed.contains('\0') {
            return Err(CoordinationError::invalid_path(declared, "NUL byte in path"));
        }

        let mut normalized = PathBuf::new();
        for component in Path::new(trimmed).components() {
            match component {
                Component::Normal(part) => normalized.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(CoordinationError::path_escape(declared, &self.root));
                    }
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(CoordinationError::path_escape(declared, &self.root));
                }
            }
        }

        if normalized.as_os_str().is_empty() {
            return Err(CoordinationError::invalid_path(declared, "path names the root"));
        }

        Ok(self.root.join(normalized))
    }

    /// Verify the deepest existing ancestor of `target` stays inside the root.
    fn check_existing_ancestor(&self, declared: &str, target: &Path) -> CoordinationResult<()> {
        let mut probe = target.parent();
        while let Some(dir) = probe {
            if dir.exists() {
                let real = dir
                    .canonicalize()
                    .map_err(|e| CoordinationError::io(dir, e))?;
                if !real.starts_with(&self.root) {
                    return Err(CoordinationError::path_escape(declared, &self.root));
                }
                return Ok(());
            }
            probe = dir.parent();
        }
        Err(CoordinationError::path_escape(declared, &self.root))
    }

    /// Write one artifact, returning the absolute path written.
    ///
    /// Content is written with a trailing newline. An existing file at the
    /// same path is overwritten.
    pub fn write(&self, artifact: &Artifact) -> CoordinationResult<PathBuf> {
        let target = self.resolve(&artifact.path)?;
        self.check_existing_ancestor(&artifact.path, &target)?;

        if let Ok(meta) = std::fs::symlink_metadata(&target) {
            if meta.file_type().is_symlink() {
                let real = target
                    .canonicalize()
                    .map_err(|e| CoordinationError::io(&target, e))?;
                if !real.starts_with(&self.root) {
                    return Err(CoordinationError::path_escape(&artifact.path, &self.root));
                }
            }
        }

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CoordinationError::io(parent, e))?;
        }

        std::fs::write(&target, format!("{}\n", artifact.content))
            .map_err(|e| CoordinationError::io(&target, e))?;

        tracing::debug!(path = %artifact.path, bytes = artifact.content.len(), "Wrote artifact");
        Ok(target)
    }

    /// Write every artifact. Rejected artifacts are reported and skipped;
    /// the rest are still written.
    pub fn write_all(&self, artifacts: &[Artifact]) -> WriteReport {
        let mut report = WriteReport::default();
        for artifact in artifacts {
            match self.write(artifact) {
                Ok(_) => report.written.push(artifact.path.clone()),
                Err(e) => {
                    if e.is_security_violation() {
                        tracing::warn!(path = %artifact.path, error = %e, "Security: artifact write refused");
                    } else {
                        tracing::warn!(path = %artifact.path, error = %e, "Artifact write failed");
                    }
                    report.rejected.push(RejectedArtifact {
                        path: artifact.path.clone(),
                        code: e.code(),
                        message: e.to_string(),
                        security_violation: e.is_security_violation(),
                    });
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(path: &str, content: &str) -> Artifact {
        Artifact {
            path: path.into(),
            content: content.into(),
            order: 0,
        }
    }

    #[test]
    fn test_resolve_normalizes_inside_root() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(dir.path()).unwrap();
        let resolved = writer.resolve("./src/../src/a.py").unwrap();
        assert_eq!(resolved, writer.root().join("src/a.py"));
    }

    #[test]
    fn test_resolve_rejects_escape() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(dir.path()).unwrap();
        for bad in ["../outside.txt", "a/../../x", "/etc/passwd"] {
            let err = writer.resolve(bad).unwrap_err();
            assert!(err.is_security_violation(), "{bad} should be refused");
        }
    }

    #[test]
    fn test_resolve_rejects_root_itself() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(dir.path()).unwrap();
        assert!(matches!(
            writer.resolve("a/.."),
            Err(CoordinationError::InvalidPath { .. })
        ));
        assert!(writer.resolve("   ").is_err());
    }

    #[test]
    fn test_write_creates_parents_and_appends_newline() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(dir.path()).unwrap();
        writer.write(&artifact("pkg/sub/mod.py", "x = 1")).unwrap();
        let written = std::fs::read_to_string(dir.path().join("pkg/sub/mod.py")).unwrap();
        assert_eq!(written, "x = 1\n");
    }

    #[test]
    fn test_write_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(dir.path()).unwrap();
        writer.write(&artifact("a.py", "old")).unwrap();
        writer.write(&artifact("a.py", "new")).unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("a.py")).unwrap(), "new\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_directory_escape_refused() {
        let outside = tempfile::tempdir().unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();

        let writer = ArtifactWriter::new(dir.path()).unwrap();
        let err = writer.write(&artifact("link/evil.py", "x")).unwrap_err();
        assert!(err.is_security_violation());
        assert!(!outside.path().join("evil.py").exists());
    }

    #[test]
    fn test_write_all_isolates_rejections() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(dir.path()).unwrap();
        let report = writer.write_all(&[
            artifact("../outside.txt", "nope"),
            artifact("ok.txt", "fine"),
        ]);
        assert_eq!(report.written, vec!["ok.txt"]);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].code, "PATH_ESCAPE");
        assert!(report.has_security_violation());
    }
}
