//! System instructions for each generation stage

use crate::codegen::RepairContext;
use crate::patch::{BEGIN_PATCH, END_PATCH, REPLACE_MARKER, UPDATE_FILE};
use kiln_core::ArtifactLayout;

pub const ENHANCE_SYSTEM: &str = "You turn a short product request into a precise build brief for a small web application.
Describe the pages, the data the application manages, the HTTP endpoints it needs and the interactions on each page.
Backend: FastAPI. Frontend: plain HTML, CSS and JavaScript served by the backend.
Reply with the improved brief only.";

pub const SPEC_SYSTEM: &str = r##"You convert a product brief into a STRICT JSON TaskSpec.
Return ONLY one JSON object. No markdown, no commentary.

TaskSpec keys:
- app_name (string)
- pages: [{"name", "route", "sections": [string]}]
- api: [{"method", "path", "desc"}]
- data_models: [{"name", "fields": [{"name", "type"}]}]
- styling: {"theme": "light" | "dark", "primary_color": "#rrggbb"}
- constraints: {"frontend": "html_css", "backend": "fastapi"}
- notes (string)"##;

/// Instructions for the code stage, naming the layout the files must follow
pub fn code_system(layout: &ArtifactLayout) -> String {
    format!(
        r#"You generate a complete, runnable web application from a TaskSpec JSON.

Layout:
- {backend}/main.py: FastAPI app object named `app`; serves every page and API route in the spec and mounts {frontend} for static assets
- {manifest}: one package name per line, no versions
- {frontend}/: one complete HTML file per page plus the CSS and JavaScript they reference

Rules:
- Every route must have its file; every import must be in the manifest
- No placeholder text

Output format:
Return ONE JSON object: {{"files": [{{"path": "...", "content": "..."}}], "entrypoint": "{entrypoint}"}}
All string content must be valid JSON: escape backslashes as \\, quotes as \", newlines as \n.
Do not wrap the JSON in markdown."#,
        backend = layout.backend_dir(),
        frontend = layout.frontend_dir(),
        manifest = layout.manifest_path(),
        entrypoint = layout.entrypoint(),
    )
}

/// Instructions for repair requests, spelling out the patch envelope
pub fn repair_system(layout: &ArtifactLayout) -> String {
    format!(
        r#"You are a code repair agent. Given an error and the relevant files, return a patch that fixes the error.

Patch format (plain text, no markdown):
{begin}
{update} <path exactly as labelled in the context>
{replace}
<complete new content of the file>
{end}

Rules:
- One "{update}" section per file you change
- Always send the complete file after "{replace}"
- Make the smallest change that fixes the error
- A missing dependency goes into {manifest}"#,
        begin = BEGIN_PATCH,
        update = UPDATE_FILE,
        replace = REPLACE_MARKER,
        end = END_PATCH,
        manifest = layout.manifest_path(),
    )
}

pub fn enhance_user(prompt: &str) -> String {
    format!("User request: {}\n\nImproved brief:", prompt)
}

pub fn spec_user(brief: &str) -> String {
    format!("USER_PROMPT:\n{}\n\nReturn TaskSpec JSON only.", brief)
}

pub fn code_user(spec_json: &str) -> String {
    format!(
        "TASKSPEC_JSON:\n{}\n\nReturn the code files in ONE JSON object with a 'files' key.",
        spec_json
    )
}

pub fn repair_user(error_text: &str, context: &str, repair: &RepairContext<'_>) -> String {
    let mut user = String::new();
    if repair.max_attempts > 0 {
        user.push_str(&format!(
            "Attempt {} of {} failed; {} left after this fix.\n\n",
            repair.attempt, repair.max_attempts, repair.remaining
        ));
    }
    user.push_str(&format!("ERROR:\n{}\n\n", error_text));
    if let Some(previous) = repair.previous_error.filter(|p| p.trim() != error_text.trim()) {
        user.push_str(&format!(
            "The attempt before this one failed differently, so the last patch changed the failure:\n{}\n\n",
            previous
        ));
    }
    user.push_str(&format!("CONTEXT:\n{}\n\nReturn ONLY the patch.", context));
    user
}
