//! Generation pipeline: prompt -> brief -> task spec -> code files
//!
//! Each structured step gets a small local budget: the task spec one
//! corrective retry, the code files `generation_attempts`. When the generator's answer
//! cannot be used, the failure is turned into corrective notes that are added
//! to the next request's system instructions. Transport failures are not
//! retried here; the HTTP client already backs off on its own.

use crate::generator::{GenerationRequest, Generator};
use crate::prompts;
use crate::GenerationError;
use kiln_core::config::ModelRouting;
use kiln_core::manifest::{ensure_packages, is_manifest_path};
use kiln_core::{ArtifactLayout, GeneratedArtifact, GeneratedFile, KilnConfig, TaskSpec};
use kiln_extract::{extract_artifact, extract_document, parse_document};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Corrective notes accumulated across local generation attempts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationFeedback {
    last_error: Option<String>,
    notes: Vec<String>,
}

impl GenerationFeedback {
    /// Turn a failed attempt into notes for the next one
    pub fn record(&mut self, error: &str) {
        let lower = error.to_lowercase();
        let note = if lower.contains("escape") {
            Some("You produced invalid escape sequences. Inside JSON strings write \\\\ for a backslash, \\n for a newline and \\\" for a quote.")
        } else if lower.contains("multiple") || lower.contains("sibling") {
            Some("Merge everything into ONE JSON object with a single 'files' array.")
        } else if lower.contains("no structured data") {
            Some("Reply with the JSON object only, no prose.")
        } else if lower.contains("no files") {
            Some("The 'files' array must list every file with non-empty content.")
        } else {
            None
        };

        if let Some(note) = note {
            if !self.notes.iter().any(|n| n == note) {
                self.notes.push(note.to_string());
            }
        }
        self.last_error = Some(error.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.last_error.is_none()
    }

    pub fn notes(&self) -> &[String] {
        &self.notes
    }

    /// System instructions for the next attempt
    pub fn apply(&self, base: &str) -> String {
        let Some(error) = &self.last_error else {
            return base.to_string();
        };
        let mut system = format!("{}\n\nPREVIOUS OUTPUT CAUSED ERROR: {}\n", base, error);
        for note in &self.notes {
            system.push_str("- ");
            system.push_str(note);
            system.push('\n');
        }
        system.push_str("Return ONE valid JSON object and nothing else.");
        system
    }
}

/// Task spec requests: the first try plus one corrective retry
pub const SPEC_ATTEMPTS: u32 = 2;

/// Where a repair request sits in the run's attempt budget
#[derive(Debug, Clone, Copy, Default)]
pub struct RepairContext<'a> {
    /// The attempt whose failure is being repaired
    pub attempt: u32,
    pub max_attempts: u32,
    /// Attempts left once this repair has run
    pub remaining: u32,
    /// Failure text of the attempt before `attempt`
    pub previous_error: Option<&'a str>,
    /// Instructions from rejected patches, oldest first
    pub notes: &'a [String],
}

/// Drives the generator through each generation stage
#[derive(Clone)]
pub struct CodeGenerator {
    generator: Arc<dyn Generator>,
    models: ModelRouting,
    layout: ArtifactLayout,
    max_tokens: u32,
    attempts: u32,
    enhance: bool,
    baseline_packages: Vec<String>,
}

impl CodeGenerator {
    pub fn new(generator: Arc<dyn Generator>, config: &KilnConfig) -> Self {
        Self {
            generator,
            models: config.generator.models.clone(),
            layout: config.layout(),
            max_tokens: config.generator.max_tokens,
            attempts: config.run.generation_attempts.max(1),
            enhance: config.run.enhance_prompt,
            baseline_packages: config.sandbox.baseline_packages.clone(),
        }
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    pub fn enhances_prompt(&self) -> bool {
        self.enhance
    }

    /// Expand a short prompt into a build brief.
    ///
    /// Falls back to the original prompt if the generator fails or returns nothing.
    pub async fn enhance_prompt(&self, prompt: &str) -> String {
        if !self.enhance {
            return prompt.to_string();
        }
        let request = self.request(&self.models.enhance, prompts::ENHANCE_SYSTEM, prompts::enhance_user(prompt));
        match self.generator.complete(&request).await {
            Ok(brief) if !brief.trim().is_empty() => brief.trim().to_string(),
            Ok(_) => {
                warn!("Prompt enhancement returned nothing, using original prompt");
                prompt.to_string()
            }
            Err(e) => {
                warn!("Prompt enhancement failed (fail-open): {}", e);
                prompt.to_string()
            }
        }
    }

    /// Ask for a [`TaskSpec`] describing the brief
    pub async fn task_spec(&self, brief: &str) -> Result<TaskSpec, GenerationError> {
        let user = prompts::spec_user(brief);
        self.with_feedback(
            "spec",
            &self.models.spec,
            prompts::SPEC_SYSTEM,
            &user,
            SPEC_ATTEMPTS,
            |raw| {
                let candidate = extract_document(raw).map_err(|e| e.to_string())?;
                let doc = parse_document(&candidate).map_err(|e| e.to_string())?;
                serde_json::from_value::<TaskSpec>(doc)
                    .map_err(|e| format!("invalid TaskSpec: {}", e))
            },
        )
        .await
    }

    /// Ask for the application's files
    pub async fn generate_code(&self, spec: &TaskSpec) -> Result<GeneratedArtifact, GenerationError> {
        let spec_json = serde_json::to_string_pretty(spec)?;
        let user = prompts::code_user(&spec_json);
        let system = prompts::code_system(&self.layout);

        let artifact = self
            .with_feedback("codegen", &self.models.code, &system, &user, self.attempts, |raw| {
                let artifact = extract_artifact(raw, &self.layout).map_err(|e| e.to_string())?;
                if artifact.files.is_empty() {
                    return Err("document contained no files".to_string());
                }
                Ok(artifact)
            })
            .await?;

        Ok(post_process(artifact, &self.layout, &self.baseline_packages))
    }

    /// Ask for a patch fixing `error_text`, given labelled file context
    pub async fn request_repair(
        &self,
        error_text: &str,
        context: &str,
        repair: &RepairContext<'_>,
    ) -> Result<String, GenerationError> {
        let mut system = prompts::repair_system(&self.layout);
        if !repair.notes.is_empty() {
            system.push_str("\n\nNotes from earlier attempts:\n");
            for note in repair.notes {
                system.push_str("- ");
                system.push_str(note);
                system.push('\n');
            }
        }
        let request = self.request(
            &self.models.repair,
            &system,
            prompts::repair_user(error_text, context, repair),
        );
        Ok(self.generator.complete(&request).await?)
    }

    async fn with_feedback<T, F>(
        &self,
        stage: &str,
        model: &str,
        base_system: &str,
        user: &str,
        attempts: u32,
        parse: F,
    ) -> Result<T, GenerationError>
    where
        F: Fn(&str) -> Result<T, String>,
    {
        let mut feedback = GenerationFeedback::default();
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let request = self.request(model, &feedback.apply(base_system), user.to_string());
            let raw = self.generator.complete(&request).await?;
            debug!("{} attempt {} returned {} chars", stage, attempt, raw.len());

            match parse(&raw) {
                Ok(value) => {
                    info!("{} succeeded on attempt {}/{}", stage, attempt, attempts);
                    return Ok(value);
                }
                Err(e) => {
                    warn!("{} output unusable (attempt {}/{}): {}", stage, attempt, attempts, e);
                    feedback.record(&e);
                    last_error = e;
                }
            }
        }

        Err(GenerationError::AttemptsExhausted {
            attempts,
            last_error,
        })
    }

    fn request(&self, model: &str, system: &str, user: String) -> GenerationRequest {
        GenerationRequest {
            model: model.to_string(),
            system: system.to_string(),
            user,
            max_tokens: self.max_tokens,
        }
    }
}

/// Framework names the entrypoint must import, with their modules
const ENTRYPOINT_IMPORTS: &[(&str, &str)] = &[
    ("fastapi", "FastAPI"),
    ("fastapi.responses", "FileResponse"),
];

/// Fix up generated files before they are written.
///
/// - content escaped twice (no real newline, only literal `\n`) is unescaped
/// - the entrypoint gets imports for framework names it uses but never imports
/// - manifests are cleaned and the baseline packages ensured
/// - a manifest holding the baseline is added if none was generated
pub fn post_process(
    mut artifact: GeneratedArtifact,
    layout: &ArtifactLayout,
    baseline: &[String],
) -> GeneratedArtifact {
    let entrypoint = if artifact.entrypoint.is_empty() {
        layout.entrypoint()
    } else {
        artifact.entrypoint.clone()
    };

    for file in &mut artifact.files {
        if !file.content.contains('\n') && file.content.contains("\\n") {
            file.content = file.content.replace("\\n", "\n");
        }
        if file.path == entrypoint && file.path.ends_with(".py") {
            if let Some(fixed) = inject_missing_imports(&file.content) {
                info!("Added missing framework imports to {}", file.path);
                file.content = fixed;
            }
        }
        if is_manifest_path(&file.path) {
            file.content = ensure_packages(&file.content, baseline);
        }
    }

    if !artifact.files.iter().any(|f| is_manifest_path(&f.path)) && !baseline.is_empty() {
        artifact.files.push(GeneratedFile::new(
            layout.manifest_path(),
            ensure_packages("", baseline),
        ));
    }
    artifact
}

/// Import every [`ENTRYPOINT_IMPORTS`] name used but not imported.
///
/// A name joins a single-line `from <module> import` when one exists, else a
/// new import line is prepended. `None` when nothing was missing.
fn inject_missing_imports(content: &str) -> Option<String> {
    let is_import = |line: &str| {
        let line = line.trim_start();
        line.starts_with("from ") || line.starts_with("import ")
    };

    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
    let mut prepend = Vec::new();
    let mut changed = false;

    for (module, name) in ENTRYPOINT_IMPORTS {
        let used = lines
            .iter()
            .any(|l| !is_import(l) && mentions(l, name));
        let imported = lines.iter().any(|l| is_import(l) && mentions(l, name));
        if !used || imported {
            continue;
        }

        let prefix = format!("from {} import ", module);
        match lines
            .iter_mut()
            .find(|l| l.trim_start().starts_with(&prefix) && !l.contains('('))
        {
            Some(line) => *line = line.replacen(&prefix, &format!("{}{}, ", prefix, name), 1),
            None => prepend.push(format!("{}{}", prefix, name)),
        }
        changed = true;
    }

    if !changed {
        return None;
    }
    let mut out = prepend.join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    out.push_str(&lines.join("\n"));
    if content.ends_with('\n') {
        out.push('\n');
    }
    Some(out)
}

/// Whether `name` appears in `line` as a bare identifier
fn mentions(line: &str, name: &str) -> bool {
    let is_ident = |c: char| c.is_alphanumeric() || c == '_';
    line.match_indices(name).any(|(start, _)| {
        let before = line[..start].chars().next_back();
        let after = line[start + name.len()..].chars().next();
        !before.is_some_and(|c| is_ident(c) || c == '.') && !after.is_some_and(is_ident)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ScriptedGenerator;

    const SPEC: &str = r#"{"app_name": "Bakery", "pages": [{"name": "Home", "route": "/"}]}"#;

    fn code_answer() -> String {
        serde_json::json!({
            "files": [
                {"path": "generated_app/backend/main.py", "content": "from fastapi import FastAPI\napp = FastAPI()\n"},
                {"path": "generated_app/backend/requirements.txt", "content": "fastapi==0.104.1\n"},
                {"path": "generated_app/frontend/index.html", "content": "<html></html>"}
            ]
        })
        .to_string()
    }

    fn generator_with(script: ScriptedGenerator) -> (Arc<ScriptedGenerator>, CodeGenerator) {
        let script = Arc::new(script);
        let codegen = CodeGenerator::new(script.clone(), &KilnConfig::default());
        (script, codegen)
    }

    #[tokio::test]
    async fn test_enhance_falls_back_on_failure() {
        let (_, codegen) = generator_with(ScriptedGenerator::new().with_failure("offline"));
        assert_eq!(codegen.enhance_prompt("a bakery site").await, "a bakery site");
    }

    #[tokio::test]
    async fn test_task_spec_retries_with_feedback() {
        let (script, codegen) = generator_with(
            ScriptedGenerator::new()
                .with_response("Sorry, here is the spec in words.")
                .with_response(format!("```json\n{}\n```", SPEC)),
        );

        let spec = codegen.task_spec("a bakery").await.unwrap();
        assert_eq!(spec.app_name, "Bakery");

        let requests = script.requests();
        assert_eq!(requests.len(), 2);
        assert!(!requests[0].system.contains("PREVIOUS OUTPUT CAUSED ERROR"));
        assert!(requests[1].system.contains("PREVIOUS OUTPUT CAUSED ERROR"));
        assert!(requests[1].system.contains("JSON object only"));
    }

    #[tokio::test]
    async fn test_task_spec_gets_one_corrective_retry() {
        let (script, codegen) = generator_with(
            ScriptedGenerator::new()
                .with_response("no json here")
                .with_response("still nothing")
                .with_response(SPEC),
        );

        let err = codegen.task_spec("a bakery").await.unwrap_err();
        assert!(matches!(
            err,
            GenerationError::AttemptsExhausted { attempts: SPEC_ATTEMPTS, .. }
        ));
        assert_eq!(script.requests().len(), 2);
        assert_eq!(script.remaining(), 1);
    }

    #[test]
    fn test_encode_failure_is_not_a_transport_error() {
        let err: GenerationError = serde_json::from_str::<TaskSpec>("{").unwrap_err().into();
        assert!(matches!(err, GenerationError::Encode(_)));
        assert!(err.to_string().starts_with("Failed to encode generator input"));
    }

    #[tokio::test]
    async fn test_generate_code_post_processes_manifest() {
        let (script, codegen) = generator_with(ScriptedGenerator::new().with_response(code_answer()));
        let spec: TaskSpec = serde_json::from_str(SPEC).unwrap();

        let artifact = codegen.generate_code(&spec).await.unwrap();
        let manifest = artifact.file("generated_app/backend/requirements.txt").unwrap();
        assert_eq!(manifest.content, "fastapi\nuvicorn\n");
        assert_eq!(artifact.entrypoint, "generated_app/backend/main.py");
        assert_eq!(script.requests()[0].model, "llama3.1");
    }

    #[tokio::test]
    async fn test_generate_code_gives_up_after_budget() {
        let (script, codegen) = generator_with(
            ScriptedGenerator::new()
                .with_response("```json\n{}\n```\n```json\n{}\n```")
                .with_response("{\"files\": []}")
                .with_response("nothing here"),
        );
        let spec: TaskSpec = serde_json::from_str(SPEC).unwrap();

        let err = codegen.generate_code(&spec).await.unwrap_err();
        assert!(matches!(
            err,
            GenerationError::AttemptsExhausted { attempts: 3, .. }
        ));
        let requests = script.requests();
        assert!(requests[1].system.contains("ONE JSON object with a single 'files' array"));
        assert!(requests[2].system.contains("non-empty content"));
    }

    #[tokio::test]
    async fn test_transport_failure_is_not_retried_locally() {
        let (script, codegen) = generator_with(ScriptedGenerator::new().with_failure("503"));
        let spec: TaskSpec = serde_json::from_str(SPEC).unwrap();

        let err = codegen.generate_code(&spec).await.unwrap_err();
        assert!(matches!(err, GenerationError::Transport(_)));
        assert_eq!(script.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_repair_request_carries_notes_and_budget() {
        let (script, codegen) = generator_with(ScriptedGenerator::new().with_response("*** Begin Patch"));
        let notes = vec!["Fix the import".to_string()];
        let repair = RepairContext {
            attempt: 1,
            max_attempts: 3,
            remaining: 2,
            previous_error: None,
            notes: &notes,
        };
        let patch = codegen
            .request_repair("Traceback ...", "--- FILE: a ---", &repair)
            .await
            .unwrap();
        assert_eq!(patch, "*** Begin Patch");

        let request = &script.requests()[0];
        assert!(request.system.contains("Fix the import"));
        assert!(request.user.contains("Traceback ..."));
        assert!(request.user.contains("Attempt 1 of 3 failed; 2 left"));
    }

    #[test]
    fn test_post_process_unescapes_and_adds_manifest() {
        let artifact = GeneratedArtifact {
            files: vec![GeneratedFile::new(
                "generated_app/backend/main.py",
                "import os\\nprint(1)",
            )],
            entrypoint: "generated_app/backend/main.py".to_string(),
            run_config: Default::default(),
        };
        let baseline = vec!["fastapi".to_string(), "uvicorn".to_string()];
        let out = post_process(artifact, &ArtifactLayout::default(), &baseline);

        assert_eq!(out.files[0].content, "import os\nprint(1)");
        assert_eq!(out.files[1].path, "generated_app/backend/requirements.txt");
        assert_eq!(out.files[1].content, "fastapi\nuvicorn\n");
    }

    #[test]
    fn test_post_process_injects_missing_entrypoint_imports() {
        let main = "import os\n\napp = FastAPI()\n\n@app.get('/')\ndef home():\n    return FileResponse(os.path.join('frontend', 'index.html'))\n";
        let artifact = GeneratedArtifact {
            files: vec![
                GeneratedFile::new("generated_app/backend/main.py", main),
                GeneratedFile::new("generated_app/backend/util.py", "x = FastAPI()\n"),
            ],
            entrypoint: "generated_app/backend/main.py".to_string(),
            run_config: Default::default(),
        };
        let out = post_process(artifact, &ArtifactLayout::default(), &[]);

        assert_eq!(
            out.files[0].content,
            format!(
                "from fastapi import FastAPI\nfrom fastapi.responses import FileResponse\n{}",
                main
            )
        );
        assert_eq!(out.files[1].content, "x = FastAPI()\n");
    }

    #[test]
    fn test_injection_extends_existing_import_and_keeps_complete_files() {
        let partial = "from fastapi import FastAPI\nfrom fastapi.responses import HTMLResponse\napp = FastAPI()\nFileResponse('x')";
        assert_eq!(
            inject_missing_imports(partial).unwrap(),
            "from fastapi import FastAPI\nfrom fastapi.responses import FileResponse, HTMLResponse\napp = FastAPI()\nFileResponse('x')"
        );

        let complete = "from fastapi import FastAPI, Request\nfrom fastapi.responses import FileResponse\napp = FastAPI()\n";
        assert_eq!(inject_missing_imports(complete), None);

        let qualified = "import fastapi\napp = fastapi.FastAPI()\n";
        assert_eq!(inject_missing_imports(qualified), None);
    }

    #[test]
    fn test_feedback_dedupes_notes() {
        let mut feedback = GenerationFeedback::default();
        assert!(feedback.is_empty());
        feedback.record("Multiple fenced blocks found (2)");
        feedback.record("Multiple sibling top-level objects found");
        assert_eq!(feedback.notes().len(), 1);
        assert!(feedback.apply("BASE").starts_with("BASE\n\nPREVIOUS OUTPUT CAUSED ERROR: Multiple sibling"));
    }
}
