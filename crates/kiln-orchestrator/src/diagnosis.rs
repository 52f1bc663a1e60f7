//! Failure signals and the files they point at
//!
//! A repair request carries the error text plus the content of the few files
//! most likely involved. Traceback references narrow the set; without any,
//! the layout's conventional files are sent instead.

use kiln_core::workspace::normalize_relative;
use kiln_core::{ArtifactLayout, Result, Workspace};
use kiln_sandbox::{ExecResult, LaunchOutcome, SyntaxFailure};
use regex::Regex;
use std::sync::OnceLock;
use tracing::debug;

fn traceback_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"File "(.*?)", line (\d+)"#).ok())
        .as_ref()
}

/// Where in an attempt the failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Install,
    Syntax,
    Runtime,
    HealthCheck,
}

impl SignalKind {
    /// Log stage name
    pub fn stage(&self) -> &'static str {
        match self {
            SignalKind::Install => "deps",
            SignalKind::Syntax => "syntax",
            SignalKind::Runtime | SignalKind::HealthCheck => "launch",
        }
    }
}

/// A file location named in a failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReference {
    /// As written in the error text
    pub raw_path: String,
    pub line: u32,
}

/// Failure text of one attempt plus the file references found in it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticSignal {
    pub kind: SignalKind,
    pub error_text: String,
    pub references: Vec<FileReference>,
}

impl DiagnosticSignal {
    pub fn new(kind: SignalKind, error_text: impl Into<String>) -> Self {
        let error_text = error_text.into();
        let references = parse_references(&error_text);
        Self {
            kind,
            error_text,
            references,
        }
    }

    pub fn from_install(result: &ExecResult) -> Self {
        Self::new(
            SignalKind::Install,
            format!(
                "Dependency Installation Failed:\n{}\nOutput:\n{}",
                result.stderr.trim(),
                result.stdout.trim()
            ),
        )
    }

    pub fn from_syntax(failure: &SyntaxFailure) -> Self {
        Self::new(
            SignalKind::Syntax,
            format!("Syntax Error in {}:\n{}", failure.file, failure.message),
        )
    }

    /// `None` when the launch succeeded
    pub fn from_launch(outcome: &LaunchOutcome) -> Option<Self> {
        let kind = match outcome {
            LaunchOutcome::Ready(_) => return None,
            LaunchOutcome::Exited { .. } => SignalKind::Runtime,
            LaunchOutcome::TimedOut { .. } => SignalKind::HealthCheck,
        };
        let text = outcome.failure_text()?;
        let heading = match kind {
            SignalKind::HealthCheck => "Health Check Failed",
            _ => "Runtime Error",
        };
        Some(Self::new(kind, format!("{}:\n{}", heading, text)))
    }
}

/// `File "<path>", line <n>` references in order of appearance
pub fn parse_references(error_text: &str) -> Vec<FileReference> {
    let Some(re) = traceback_regex() else {
        return Vec::new();
    };
    re.captures_iter(error_text)
        .filter_map(|caps| {
            Some(FileReference {
                raw_path: caps.get(1)?.as_str().to_string(),
                line: caps.get(2)?.as_str().parse().ok()?,
            })
        })
        .collect()
}

/// Workspace-relative path of a reference: the suffix starting at the
/// artifact root marker, or `None` for files outside the artifact
pub fn workspace_relative(raw_path: &str, layout: &ArtifactLayout) -> Option<String> {
    let path = raw_path.replace('\\', "/");
    let marker = format!("{}/", layout.root());
    let start = if path.starts_with(&marker) {
        0
    } else {
        path.find(&format!("/{}", marker))? + 1
    };
    Some(normalize_relative(&path[start..]))
}

/// Labelled file contents for a repair request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NarrowedContext {
    /// Files included, in order
    pub files: Vec<String>,
    pub text: String,
}

/// Pick the files relevant to `signal` and render them for the repair request.
///
/// Referenced files come first in first-seen order, followed by the manifest.
/// With no usable reference the layout's candidate files are used. Missing
/// files are left out and each file is cut to `char_budget` characters.
pub async fn narrow_context(
    workspace: &Workspace,
    layout: &ArtifactLayout,
    signal: &DiagnosticSignal,
    char_budget: usize,
) -> Result<NarrowedContext> {
    let mut selected: Vec<String> = Vec::new();
    for reference in &signal.references {
        if let Some(rel) = workspace_relative(&reference.raw_path, layout) {
            if !selected.contains(&rel) {
                selected.push(rel);
            }
        }
    }

    if selected.is_empty() {
        selected = layout.candidate_files();
    } else {
        let manifest = layout.manifest_path();
        if !selected.contains(&manifest) {
            selected.push(manifest);
        }
    }
    debug!("Context candidates for {:?}: {:?}", signal.kind, selected);

    let mut context = NarrowedContext::default();
    let mut parts = Vec::new();
    for rel in selected {
        let content = match workspace.read(&rel).await {
            Ok(Some(content)) => content,
            Ok(None) => continue,
            // Traceback paths are untrusted; anything unresolvable is skipped
            Err(e) => {
                debug!("Skipping context file {}: {}", rel, e);
                continue;
            }
        };
        parts.push(format!(
            "\n--- FILE: {} (Use this exact path for patching) ---\n{}\n",
            rel,
            truncate_chars(&content, char_budget)
        ));
        context.files.push(rel);
    }
    context.text = parts.join("\n");
    Ok(context)
}

fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MAIN: &str = "generated_app/backend/main.py";
    const MANIFEST: &str = "generated_app/backend/requirements.txt";

    #[test]
    fn test_traceback_pattern_compiles() {
        assert!(traceback_regex().is_some());
    }

    async fn seeded() -> (TempDir, Workspace) {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path());
        ws.write(MAIN, "from fastapi import FastAPI\n").await.unwrap();
        ws.write(MANIFEST, "fastapi\nuvicorn\n").await.unwrap();
        ws.write("generated_app/backend/models.py", "class Item: ...\n")
            .await
            .unwrap();
        ws.write("generated_app/frontend/index.html", "<html></html>\n")
            .await
            .unwrap();
        ws.write("generated_app/frontend/styles.css", "body {}\n")
            .await
            .unwrap();
        (dir, ws)
    }

    #[test]
    fn test_parse_references_in_order() {
        let text = r#"Traceback (most recent call last):
  File "/ws/generated_app/backend/main.py", line 12, in <module>
  File "/usr/lib/python3.11/importlib/__init__.py", line 126, in import_module
  File "/ws/generated_app/backend/models.py", line 3"#;
        let refs = parse_references(text);
        assert_eq!(refs.len(), 3);
        assert_eq!(refs[0].raw_path, "/ws/generated_app/backend/main.py");
        assert_eq!(refs[0].line, 12);
        assert_eq!(refs[2].line, 3);
    }

    #[test]
    fn test_workspace_relative() {
        let layout = ArtifactLayout::default();
        assert_eq!(
            workspace_relative("/ws/generated_app/backend/main.py", &layout).as_deref(),
            Some(MAIN)
        );
        assert_eq!(
            workspace_relative(r"C:\runs\generated_app\backend\main.py", &layout).as_deref(),
            Some(MAIN)
        );
        assert_eq!(
            workspace_relative("generated_app/backend/main.py", &layout).as_deref(),
            Some(MAIN)
        );
        assert_eq!(workspace_relative("/usr/lib/python3/os.py", &layout), None);
        assert_eq!(
            workspace_relative("/ws/not_generated_app/x.py", &layout),
            None
        );
    }

    #[tokio::test]
    async fn test_traceback_narrows_to_file_and_manifest() {
        let (_dir, ws) = seeded().await;
        let signal = DiagnosticSignal::new(
            SignalKind::Runtime,
            r#"File "/ws/generated_app/backend/main.py", line 12, in <module>"#,
        );
        let context = narrow_context(&ws, &ArtifactLayout::default(), &signal, 4000)
            .await
            .unwrap();

        assert_eq!(context.files, vec![MAIN, MANIFEST]);
        assert!(context
            .text
            .contains("--- FILE: generated_app/backend/main.py (Use this exact path for patching) ---"));
        assert!(!context.text.contains("index.html"));
        assert!(!context.text.contains("styles.css"));
    }

    #[tokio::test]
    async fn test_duplicates_collapse_in_first_seen_order() {
        let (_dir, ws) = seeded().await;
        let text = r#"File "/a/generated_app/backend/models.py", line 1
File "/a/generated_app/backend/main.py", line 2
File "/a/generated_app/backend/models.py", line 9"#;
        let signal = DiagnosticSignal::new(SignalKind::Runtime, text);
        let context = narrow_context(&ws, &ArtifactLayout::default(), &signal, 4000)
            .await
            .unwrap();
        assert_eq!(
            context.files,
            vec!["generated_app/backend/models.py", MAIN, MANIFEST]
        );
    }

    #[tokio::test]
    async fn test_no_references_falls_back_to_candidates() {
        let (_dir, ws) = seeded().await;
        let signal = DiagnosticSignal::new(
            SignalKind::Install,
            "ERROR: No matching distribution found for fastapi-magic",
        );
        let context = narrow_context(&ws, &ArtifactLayout::default(), &signal, 4000)
            .await
            .unwrap();
        assert_eq!(
            context.files,
            vec![
                MAIN,
                MANIFEST,
                "generated_app/frontend/index.html",
                "generated_app/frontend/styles.css"
            ]
        );
    }

    #[tokio::test]
    async fn test_escaping_reference_ignored() {
        let (_dir, ws) = seeded().await;
        let signal = DiagnosticSignal::new(
            SignalKind::Runtime,
            r#"File "/x/generated_app/../../etc/passwd", line 1"#,
        );
        let context = narrow_context(&ws, &ArtifactLayout::default(), &signal, 4000)
            .await
            .unwrap();
        assert_eq!(context.files, vec![MANIFEST]);
    }

    #[tokio::test]
    async fn test_content_truncated_on_char_boundary() {
        let (_dir, ws) = seeded().await;
        ws.write(MAIN, &"é".repeat(10)).await.unwrap();
        let signal = DiagnosticSignal::new(
            SignalKind::Syntax,
            r#"File "generated_app/backend/main.py", line 1"#,
        );
        let context = narrow_context(&ws, &ArtifactLayout::default(), &signal, 4)
            .await
            .unwrap();
        assert!(context.text.contains("\néééé\n"));
        assert!(!context.text.contains("ééééé"));
    }

    #[test]
    fn test_signal_texts() {
        let install = DiagnosticSignal::from_install(&ExecResult::new(1, "out", "err"));
        assert_eq!(
            install.error_text,
            "Dependency Installation Failed:\nerr\nOutput:\nout"
        );
        assert_eq!(install.kind.stage(), "deps");

        let timed_out = DiagnosticSignal::from_launch(&LaunchOutcome::TimedOut {
            output: String::new(),
        })
        .unwrap();
        assert_eq!(timed_out.kind, SignalKind::HealthCheck);
        assert!(timed_out.error_text.starts_with("Health Check Failed:"));
    }
}
