//! Per-run workspace directory
//!
//! Every generated or patched file reaches disk through [`Workspace`]. Paths
//! are resolved lexically: absolute paths and `..` components are rejected,
//! never clamped.

use std::path::{Component, Path, PathBuf};
use tracing::debug;

use crate::types::{GeneratedFile, ProjectId, RunId};
use crate::{KilnError, Result};

/// Directory owned by exactly one run
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
    /// Top-level entries generated content may not touch
    protected: Vec<String>,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            protected: Vec::new(),
        }
    }

    /// `<base>/project_<pid>/run_<rid>`
    pub fn for_run(base: &Path, project_id: ProjectId, run_id: RunId) -> Self {
        Self::new(
            base.join(format!("project_{}", project_id))
                .join(format!("run_{}", run_id)),
        )
    }

    /// Refuse writes under a top-level entry (the sandbox's own directories)
    pub fn protect(mut self, name: impl Into<String>) -> Self {
        self.protected.push(name.into());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the workspace directory if missing
    pub async fn ensure(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    /// Resolve a workspace-relative path to an absolute location inside the root
    pub fn resolve(&self, rel: &str) -> Result<PathBuf> {
        let cleaned = normalize_relative(rel);
        if cleaned.is_empty() {
            return Err(KilnError::MalformedPath {
                path: rel.to_string(),
                reason: "empty path".to_string(),
            });
        }
        if cleaned.contains('\0') {
            return Err(KilnError::MalformedPath {
                path: rel.to_string(),
                reason: "contains NUL".to_string(),
            });
        }
        if cleaned.starts_with('/') || has_drive_prefix(&cleaned) {
            return Err(KilnError::PathOutsideWorkspace(rel.to_string()));
        }

        let mut resolved = self.root.clone();
        let mut depth = 0usize;
        for component in Path::new(&cleaned).components() {
            match component {
                Component::Normal(part) => {
                    if depth == 0 && self.protected.iter().any(|p| part == p.as_str()) {
                        return Err(KilnError::MalformedPath {
                            path: rel.to_string(),
                            reason: "targets a protected directory".to_string(),
                        });
                    }
                    resolved.push(part);
                    depth += 1;
                }
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(KilnError::PathOutsideWorkspace(rel.to_string()));
                }
            }
        }

        if depth == 0 {
            return Err(KilnError::MalformedPath {
                path: rel.to_string(),
                reason: "names the workspace root".to_string(),
            });
        }
        Ok(resolved)
    }

    pub async fn exists(&self, rel: &str) -> Result<bool> {
        let path = self.resolve(rel)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    /// Read a file, `None` if it does not exist
    pub async fn read(&self, rel: &str) -> Result<Option<String>> {
        let path = self.resolve(rel)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write a whole file, creating parents. Readers see old or new content, never half.
    pub async fn write(&self, rel: &str, content: &str) -> Result<PathBuf> {
        let path = self.resolve(rel)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file");
        let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, content).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        debug!("Wrote {} ({} bytes)", rel, content.len());
        Ok(path)
    }

    /// Write every file of an artifact. All paths are validated before the first write.
    pub async fn materialize(&self, files: &[GeneratedFile]) -> Result<usize> {
        for file in files {
            self.resolve(&file.path)?;
        }
        self.ensure().await?;
        for file in files {
            self.write(&file.path, &file.content).await?;
        }
        Ok(files.len())
    }
}

/// Canonical spelling of a generated relative path: trimmed, forward slashes,
/// no leading `./`, no doubled separators
pub fn normalize_relative(path: &str) -> String {
    let mut p = path.trim().replace('\\', "/");
    while let Some(rest) = p.strip_prefix("./") {
        p = rest.to_string();
    }
    while p.contains("//") {
        p = p.replace("//", "/");
    }
    p
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_for_run_layout() {
        let ws = Workspace::for_run(Path::new("/data"), ProjectId(4), RunId(9));
        assert_eq!(ws.root(), Path::new("/data/project_4/run_9"));
    }

    #[test]
    fn test_resolve_rejects_escapes() {
        let ws = Workspace::new("/ws");
        assert!(matches!(
            ws.resolve("../outside.py"),
            Err(KilnError::PathOutsideWorkspace(_))
        ));
        assert!(matches!(
            ws.resolve("generated_app/../../etc/passwd"),
            Err(KilnError::PathOutsideWorkspace(_))
        ));
        assert!(matches!(
            ws.resolve("/etc/passwd"),
            Err(KilnError::PathOutsideWorkspace(_))
        ));
        assert!(matches!(
            ws.resolve("C:\\Windows\\system.ini"),
            Err(KilnError::PathOutsideWorkspace(_))
        ));
    }

    #[test]
    fn test_resolve_rejects_empty_and_protected() {
        let ws = Workspace::new("/ws").protect(".venv_sandbox");
        assert!(matches!(ws.resolve("   "), Err(KilnError::MalformedPath { .. })));
        assert!(matches!(ws.resolve("./"), Err(KilnError::MalformedPath { .. })));
        assert!(matches!(
            ws.resolve(".venv_sandbox/bin/python"),
            Err(KilnError::MalformedPath { .. })
        ));
        // Only the top level is protected
        assert!(ws.resolve("generated_app/.venv_sandbox").is_ok());
    }

    #[test]
    fn test_resolve_normalizes() {
        let ws = Workspace::new("/ws");
        assert_eq!(
            ws.resolve(" ./generated_app\\backend//main.py ").unwrap(),
            PathBuf::from("/ws/generated_app/backend/main.py")
        );
    }

    #[tokio::test]
    async fn test_write_creates_parents_and_reads_back() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path());

        ws.write("generated_app/frontend/index.html", "<h1>hi</h1>")
            .await
            .unwrap();
        assert_eq!(
            ws.read("generated_app/frontend/index.html").await.unwrap(),
            Some("<h1>hi</h1>".to_string())
        );
        assert_eq!(ws.read("missing.txt").await.unwrap(), None);

        // No temp files left behind
        let entries: Vec<_> = std::fs::read_dir(dir.path().join("generated_app/frontend"))
            .unwrap()
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_materialize_validates_before_writing() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path().join("run"));
        let files = vec![
            GeneratedFile::new("generated_app/backend/main.py", "print(1)"),
            GeneratedFile::new("../escape.py", "print(2)"),
        ];

        assert!(ws.materialize(&files).await.is_err());
        assert!(!dir.path().join("run/generated_app/backend/main.py").exists());
        assert!(!dir.path().join("escape.py").exists());
    }

    #[tokio::test]
    async fn test_materialize_writes_all() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path());
        let files = vec![
            GeneratedFile::new("generated_app/backend/main.py", "app = None\n"),
            GeneratedFile::new("generated_app/frontend/styles.css", "body {}\n"),
        ];
        assert_eq!(ws.materialize(&files).await.unwrap(), 2);
        assert!(ws.exists("generated_app/frontend/styles.css").await.unwrap());
    }
}
