//! Core type definitions for Kiln runs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Project identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(pub u64);

impl std::fmt::Display for ProjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Run identifier
///
/// Also used to derive the run's port (`base_port + id`), so it stays numeric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub u64);

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Queued,
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    /// Forward-only transitions. `Running -> Running` is allowed for the repair loop.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        match (self, next) {
            (Self::Queued, Self::Running) => true,
            (Self::Queued, Self::Failed) => true,
            (Self::Running, Self::Running) => true,
            (Self::Running, Self::Success) => true,
            (Self::Running, Self::Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

/// Log event severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warn,
    Error,
    /// Internal fault that ended the run
    Fatal,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warn => write!(f, "WARN"),
            Self::Error => write!(f, "ERROR"),
            Self::Fatal => write!(f, "FATAL"),
        }
    }
}

/// A named project grouping runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Persisted state of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: RunId,
    pub project_id: ProjectId,
    pub prompt: String,
    pub status: RunStatus,
    pub entrypoint: String,
    /// Attempts consumed so far
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One structured log line for a run, append-ordered by `id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub id: u64,
    pub run_id: RunId,
    pub stage: String,
    pub severity: Severity,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// A single generated source file, path relative to the workspace root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedFile {
    pub path: String,
    pub content: String,
}

impl GeneratedFile {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

/// Output of one generation call: files plus how to run them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedArtifact {
    pub files: Vec<GeneratedFile>,
    pub entrypoint: String,
    #[serde(default)]
    pub run_config: BTreeMap<String, serde_json::Value>,
}

impl GeneratedArtifact {
    pub fn paths(&self) -> Vec<&str> {
        self.files.iter().map(|f| f.path.as_str()).collect()
    }

    pub fn file(&self, path: &str) -> Option<&GeneratedFile> {
        self.files.iter().find(|f| f.path == path)
    }
}

/// Conventional directory layout of a generated application
///
/// Everything lives under one root marker directory (`generated_app` by
/// default) with a `backend/` and a `frontend/` half.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactLayout {
    root: String,
}

impl ArtifactLayout {
    pub fn new(root: impl Into<String>) -> Self {
        let root = root.into().trim_matches('/').to_string();
        Self { root }
    }

    /// Root marker directory name
    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn backend_dir(&self) -> String {
        format!("{}/backend", self.root)
    }

    pub fn frontend_dir(&self) -> String {
        format!("{}/frontend", self.root)
    }

    pub fn manifest_path(&self) -> String {
        format!("{}/backend/requirements.txt", self.root)
    }

    pub fn entrypoint(&self) -> String {
        format!("{}/backend/main.py", self.root)
    }

    /// Files consulted for repair when a failure names no file
    pub fn candidate_files(&self) -> Vec<String> {
        let frontend = self.frontend_dir();
        vec![
            self.entrypoint(),
            self.manifest_path(),
            format!("{}/app.js", frontend),
            format!("{}/index.html", frontend),
            format!("{}/menu.html", frontend),
            format!("{}/order.html", frontend),
            format!("{}/styles.css", frontend),
        ]
    }

    /// Default directory for a file given only by name, chosen by extension
    pub fn default_dir_for(&self, file_name: &str) -> String {
        let ext = file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "py" | "txt" | "toml" | "cfg" | "ini" | "env" => self.backend_dir(),
            "html" | "htm" | "css" | "js" | "mjs" | "svg" => self.frontend_dir(),
            _ => self.root.clone(),
        }
    }
}

impl Default for ArtifactLayout {
    fn default() -> Self {
        Self::new("generated_app")
    }
}

/// Structured description of the application to build
///
/// Produced by the generator from the (optionally enhanced) prompt and fed
/// back into the code generation step. Every field has a default so partial
/// documents still deserialize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    #[serde(default = "default_app_name")]
    pub app_name: String,
    #[serde(default)]
    pub pages: Vec<PageSpec>,
    #[serde(default)]
    pub api: Vec<EndpointSpec>,
    #[serde(default)]
    pub data_models: Vec<DataModelSpec>,
    #[serde(default)]
    pub styling: StylingSpec,
    #[serde(default)]
    pub constraints: StackConstraints,
    #[serde(default)]
    pub notes: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageSpec {
    pub name: String,
    #[serde(default = "default_route")]
    pub route: String,
    #[serde(default)]
    pub sections: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointSpec {
    #[serde(default = "default_method")]
    pub method: String,
    pub path: String,
    #[serde(default, alias = "description")]
    pub desc: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataModelSpec {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type", default = "default_field_type")]
    pub field_type: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Light,
    Dark,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StylingSpec {
    #[serde(default)]
    pub theme: Theme,
    #[serde(default = "default_primary_color")]
    pub primary_color: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackConstraints {
    #[serde(default = "default_frontend")]
    pub frontend: String,
    #[serde(default = "default_backend")]
    pub backend: String,
}

fn default_app_name() -> String {
    "Generated App".to_string()
}

fn default_route() -> String {
    "/".to_string()
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_field_type() -> String {
    "string".to_string()
}

fn default_primary_color() -> String {
    "#2d6cdf".to_string()
}

fn default_frontend() -> String {
    "html_css".to_string()
}

fn default_backend() -> String {
    "fastapi".to_string()
}

impl Default for StylingSpec {
    fn default() -> Self {
        Self {
            theme: Theme::default(),
            primary_color: default_primary_color(),
        }
    }
}

impl Default for StackConstraints {
    fn default() -> Self {
        Self {
            frontend: default_frontend(),
            backend: default_backend(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_forward_only() {
        assert!(RunStatus::Queued.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Success));
        assert!(!RunStatus::Running.can_transition_to(RunStatus::Queued));
        assert!(!RunStatus::Success.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Failed.can_transition_to(RunStatus::Success));
    }

    #[test]
    fn test_run_status_round_trips_through_str() {
        for status in [
            RunStatus::Queued,
            RunStatus::Running,
            RunStatus::Success,
            RunStatus::Failed,
        ] {
            assert_eq!(status.to_string().parse::<RunStatus>(), Ok(status));
        }
        assert!("paused".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_layout_roots_bare_files_by_extension() {
        let layout = ArtifactLayout::default();
        assert_eq!(layout.default_dir_for("main.py"), "generated_app/backend");
        assert_eq!(
            layout.default_dir_for("requirements.txt"),
            "generated_app/backend"
        );
        assert_eq!(layout.default_dir_for("styles.css"), "generated_app/frontend");
        assert_eq!(layout.default_dir_for("INDEX.HTML"), "generated_app/frontend");
        assert_eq!(layout.default_dir_for("README"), "generated_app");
    }

    #[test]
    fn test_candidate_files_lead_with_entrypoint_and_manifest() {
        let layout = ArtifactLayout::new("app/");
        let candidates = layout.candidate_files();
        assert_eq!(candidates[0], "app/backend/main.py");
        assert_eq!(candidates[1], "app/backend/requirements.txt");
        assert!(candidates.contains(&"app/frontend/styles.css".to_string()));
    }

    #[test]
    fn test_task_spec_fills_defaults() {
        let spec: TaskSpec = serde_json::from_str(
            r#"{"pages": [{"name": "Home"}], "api": [{"path": "/api/items", "description": "list"}]}"#,
        )
        .unwrap();
        assert_eq!(spec.app_name, "Generated App");
        assert_eq!(spec.pages[0].route, "/");
        assert_eq!(spec.api[0].method, "GET");
        assert_eq!(spec.api[0].desc, "list");
        assert_eq!(spec.styling.primary_color, "#2d6cdf");
        assert_eq!(spec.constraints.backend, "fastapi");
    }
}
