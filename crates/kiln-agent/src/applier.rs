//! Apply parsed patches to a run's workspace
//!
//! Every target path is resolved against the workspace before anything is
//! written, so a patch with one escaping path changes nothing. After that,
//! directives are independent: a hunk that does not match fails its own file
//! only.

use crate::patch::{parse_patch, Hunk, Patch, UpdateBody};
use crate::PatchError;
use kiln_core::manifest::{clean_manifest, is_manifest_path};
use kiln_core::workspace::normalize_relative;
use kiln_core::Workspace;
use tracing::{debug, info, warn};

/// Outcome of applying a patch
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PatchReport {
    /// Files that did not exist before
    pub files_created: Vec<String>,
    /// Existing files that were rewritten
    pub files_modified: Vec<String>,
    /// Sections with nothing to write, with the reason
    pub skipped: Vec<(String, String)>,
    /// Sections whose hunks could not be applied, with the reason
    pub failed: Vec<(String, String)>,
}

impl PatchReport {
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();

        if !self.files_created.is_empty() {
            parts.push(format!("{} created", self.files_created.len()));
        }
        if !self.files_modified.is_empty() {
            parts.push(format!("{} modified", self.files_modified.len()));
        }
        if !self.skipped.is_empty() {
            parts.push(format!("{} skipped", self.skipped.len()));
        }
        if !self.failed.is_empty() {
            parts.push(format!("{} failed", self.failed.len()));
        }

        if parts.is_empty() {
            "no file sections".to_string()
        } else {
            parts.join(", ")
        }
    }

    pub fn has_changes(&self) -> bool {
        !self.files_created.is_empty() || !self.files_modified.is_empty()
    }

    pub fn touched(&self) -> Vec<&str> {
        self.files_created
            .iter()
            .chain(self.files_modified.iter())
            .map(String::as_str)
            .collect()
    }
}

/// Parse and apply patch text
pub async fn apply_patch_text(workspace: &Workspace, text: &str) -> Result<PatchReport, PatchError> {
    let patch = parse_patch(text)?;
    apply_patch(workspace, &patch).await
}

/// Apply a parsed patch.
///
/// Manifest targets are cleaned down to bare package names before writing.
/// Fails if any path is unusable, or if no section produced a write.
pub async fn apply_patch(workspace: &Workspace, patch: &Patch) -> Result<PatchReport, PatchError> {
    if patch.directives.is_empty() {
        return Err(PatchError::NoSections);
    }
    for directive in &patch.directives {
        workspace
            .resolve(&directive.target)
            .map_err(PatchError::from_resolve)?;
    }

    let mut report = PatchReport::default();

    for directive in &patch.directives {
        let target = normalize_relative(&directive.target);
        let current = workspace
            .read(&target)
            .await
            .map_err(PatchError::Write)?;

        let new_content = match &directive.body {
            UpdateBody::Replace(content) | UpdateBody::Raw(content) => content.clone(),
            UpdateBody::Hunks(hunks) => {
                match apply_hunks(current.as_deref().unwrap_or(""), hunks) {
                    Ok(content) => content,
                    Err(reason) => {
                        warn!("Patch section for {} failed: {}", target, reason);
                        report.failed.push((target, reason));
                        continue;
                    }
                }
            }
        };

        let new_content = if is_manifest_path(&target) {
            clean_manifest(&new_content)
        } else {
            new_content
        };
        if new_content.trim().is_empty() {
            debug!("Skipping empty patch section for {}", target);
            report
                .skipped
                .push((target, "section has no content".to_string()));
            continue;
        }

        workspace
            .write(&target, &new_content)
            .await
            .map_err(PatchError::Write)?;

        if current.is_some() {
            info!("Patched {}", target);
            report.files_modified.push(target);
        } else {
            info!("Created {} from patch", target);
            report.files_created.push(target);
        }
    }

    if !report.has_changes() {
        return Err(PatchError::NothingApplied {
            details: report.summary(),
        });
    }
    Ok(report)
}

/// Apply hunks in order by locating each hunk's old block in the file
fn apply_hunks(original: &str, hunks: &[Hunk]) -> Result<String, String> {
    let mut lines: Vec<String> = original.lines().map(str::to_string).collect();

    for (i, hunk) in hunks.iter().enumerate() {
        let old = hunk.old_lines();
        let new: Vec<String> = hunk.new_lines().into_iter().map(str::to_string).collect();

        if old.is_empty() {
            lines.extend(new);
            continue;
        }

        let at = find_block(&lines, &old)
            .ok_or_else(|| format!("hunk {} does not match the current file", i + 1))?;
        lines.splice(at..at + old.len(), new);
    }

    let mut content = lines.join("\n");
    if !content.is_empty() {
        content.push('\n');
    }
    Ok(content)
}

/// Exact match first, then ignoring trailing whitespace
fn find_block(lines: &[String], block: &[&str]) -> Option<usize> {
    if block.len() > lines.len() {
        return None;
    }
    let windows = || lines.windows(block.len()).enumerate();
    windows()
        .find(|(_, w)| w.iter().zip(block).all(|(a, b)| a == b))
        .or_else(|| {
            windows().find(|(_, w)| w.iter().zip(block).all(|(a, b)| a.trim_end() == b.trim_end()))
        })
        .map(|(at, _)| at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MAIN: &str = "generated_app/backend/main.py";
    const MANIFEST: &str = "generated_app/backend/requirements.txt";

    fn replace(path: &str, body: &str) -> String {
        format!(
            "*** Begin Patch\n*** Update File: {}\n+++ REPLACE ENTIRE FILE +++\n{}\n*** End Patch\n",
            path, body
        )
    }

    #[tokio::test]
    async fn test_full_replacement_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path());
        ws.write(MAIN, "broken(\n").await.unwrap();

        let text = replace(MAIN, "from fastapi import FastAPI\napp = FastAPI()");
        let first = apply_patch_text(&ws, &text).await.unwrap();
        let after_first = ws.read(MAIN).await.unwrap();
        let second = apply_patch_text(&ws, &text).await.unwrap();
        let after_second = ws.read(MAIN).await.unwrap();

        assert_eq!(first.files_modified, vec![MAIN.to_string()]);
        assert_eq!(second.files_modified, vec![MAIN.to_string()]);
        assert_eq!(after_first, after_second);
        assert_eq!(
            after_second.unwrap(),
            "from fastapi import FastAPI\napp = FastAPI()\n"
        );
    }

    #[tokio::test]
    async fn test_creates_missing_file_and_parents() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path());

        let report = apply_patch_text(&ws, &replace("generated_app/frontend/new.html", "<p>new</p>"))
            .await
            .unwrap();
        assert_eq!(report.files_created, vec!["generated_app/frontend/new.html"]);
        assert!(dir.path().join("generated_app/frontend/new.html").exists());
    }

    #[tokio::test]
    async fn test_path_outside_workspace_rejected_before_any_write() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path().join("run"));

        let text = format!(
            "*** Begin Patch\n*** Update File: {}\n+++ REPLACE ENTIRE FILE +++\nok = 1\n*** Update File: ../../escape.py\n+++ REPLACE ENTIRE FILE +++\nbad = 1\n*** End Patch",
            MAIN
        );
        let err = apply_patch_text(&ws, &text).await.unwrap_err();

        assert!(matches!(err, PatchError::PathOutsideWorkspace { .. }));
        assert!(!dir.path().join("run").join(MAIN).exists());
        assert!(!dir.path().join("escape.py").exists());
    }

    #[tokio::test]
    async fn test_absolute_path_rejected() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path());
        let err = apply_patch_text(&ws, &replace("/etc/hosts", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, PatchError::PathOutsideWorkspace { .. }));
    }

    #[tokio::test]
    async fn test_manifest_cleaned_on_write() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path());

        apply_patch_text(&ws, &replace(MANIFEST, "fastapi==0.104.1[all]\nuvicorn>=0.20\n# db\nsqlalchemy"))
            .await
            .unwrap();
        assert_eq!(
            ws.read(MANIFEST).await.unwrap().unwrap(),
            "fastapi\nuvicorn\nsqlalchemy\n"
        );
    }

    #[tokio::test]
    async fn test_manifest_cleaned_to_nothing_is_skipped() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path());
        ws.write(MANIFEST, "fastapi\n").await.unwrap();

        let err = apply_patch_text(&ws, &replace(MANIFEST, "# pinned below\n==1.0"))
            .await
            .unwrap_err();

        assert!(matches!(err, PatchError::NothingApplied { .. }));
        assert_eq!(ws.read(MANIFEST).await.unwrap().unwrap(), "fastapi\n");
    }

    #[tokio::test]
    async fn test_empty_section_skipped_not_zeroed() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path());
        ws.write(MAIN, "keep = True\n").await.unwrap();
        ws.write("generated_app/frontend/app.js", "old();\n").await.unwrap();

        let text = "*** Begin Patch\n*** Update File: generated_app/backend/main.py\n+++ REPLACE ENTIRE FILE +++\n\n*** Update File: generated_app/frontend/app.js\n+++ REPLACE ENTIRE FILE +++\nnew();\n*** End Patch";
        let report = apply_patch_text(&ws, text).await.unwrap();

        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.summary(), "1 modified, 1 skipped");
        assert_eq!(ws.read(MAIN).await.unwrap().unwrap(), "keep = True\n");
    }

    #[tokio::test]
    async fn test_nothing_applied_is_an_error() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path());
        let err = apply_patch_text(&ws, &replace(MAIN, "   "))
            .await
            .unwrap_err();
        assert!(matches!(err, PatchError::NothingApplied { .. }));
    }

    #[tokio::test]
    async fn test_hunks_apply_and_mismatch_fails_only_that_file() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path());
        ws.write(MAIN, "import os\nprint('a')\nrun()\n").await.unwrap();
        ws.write("generated_app/frontend/app.js", "one();\n").await.unwrap();

        let text = "*** Begin Patch\n*** Update File: generated_app/backend/main.py\n@@\n import os\n-print('a')\n+print('b')\n*** Update File: generated_app/frontend/app.js\n@@\n-missing();\n+other();\n*** End Patch";
        let report = apply_patch_text(&ws, text).await.unwrap();

        assert_eq!(report.files_modified, vec![MAIN.to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(
            ws.read(MAIN).await.unwrap().unwrap(),
            "import os\nprint('b')\nrun()\n"
        );
        assert_eq!(
            ws.read("generated_app/frontend/app.js").await.unwrap().unwrap(),
            "one();\n"
        );
    }

    #[test]
    fn test_pure_addition_hunk_appends() {
        let hunk = Hunk {
            lines: vec![crate::HunkLine::Add("extra".to_string())],
        };
        assert_eq!(apply_hunks("a\n", &[hunk]).unwrap(), "a\nextra\n");
    }
}
