//! Configuration management for Kiln
//!
//! Settings come from `.kiln/config.toml` (every field optional) and are then
//! overridden by environment variables, so the same binary can be pointed at a
//! local Ollama daemon or a hosted OpenAI-compatible endpoint without edits.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::types::ArtifactLayout;
use crate::{KilnError, Result};

/// Repository-level Kiln configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KilnConfig {
    #[serde(default)]
    pub generator: GeneratorConfig,

    #[serde(default)]
    pub run: RunConfig,

    #[serde(default)]
    pub sandbox: SandboxConfig,
}

/// Which generator backend to talk to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeneratorMode {
    #[default]
    Ollama,
    /// OpenAI-compatible chat completions endpoint
    Api,
}

impl std::str::FromStr for GeneratorMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "api" | "openai" => Ok(Self::Api),
            _ => Err(format!("Invalid generator mode: {}", s)),
        }
    }
}

/// Generator connection and model routing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    #[serde(default)]
    pub mode: GeneratorMode,

    #[serde(default = "default_ollama_base_url")]
    pub ollama_base_url: String,

    #[serde(default)]
    pub api_base_url: String,

    /// Environment variable containing the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default)]
    pub models: ModelRouting,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Model used for each generation stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRouting {
    #[serde(default = "default_model")]
    pub enhance: String,
    #[serde(default = "default_model")]
    pub spec: String,
    #[serde(default = "default_model")]
    pub code: String,
    #[serde(default = "default_model")]
    pub repair: String,
}

/// Attempt budgets and workspace placement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Execute-or-repair cycles before a run fails
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Local retries for a single generation call that yields unusable output
    #[serde(default = "default_generation_attempts")]
    pub generation_attempts: u32,

    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,

    /// Root marker directory of the generated application
    #[serde(default = "default_artifact_root")]
    pub artifact_root: String,

    /// Per-file character budget for repair context
    #[serde(default = "default_context_char_budget")]
    pub context_char_budget: usize,

    #[serde(default = "default_true")]
    pub enhance_prompt: bool,
}

/// Sandbox interpreter, installer and health-check settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_python")]
    pub python: String,

    /// Virtual environment directory, relative to the workspace
    #[serde(default = "default_venv_dir")]
    pub venv_dir: String,

    /// Installed once at setup, before the generated manifest
    #[serde(default = "default_baseline_packages")]
    pub baseline_packages: Vec<String>,

    #[serde(default = "default_install_timeout_secs")]
    pub install_timeout_secs: u64,

    #[serde(default = "default_health_check_timeout_secs")]
    pub health_check_timeout_secs: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_host")]
    pub host: String,

    /// A run listens on `base_port + run_id`
    #[serde(default = "default_base_port")]
    pub base_port: u16,
}

// Default value providers
fn default_ollama_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_api_key_env() -> String {
    "API_KEY".to_string()
}

fn default_model() -> String {
    "llama3.1".to_string()
}

fn default_max_tokens() -> u32 {
    8192
}

fn default_request_timeout_secs() -> u64 {
    180
}

fn default_max_attempts() -> u32 {
    3
}

fn default_generation_attempts() -> u32 {
    3
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from(".kiln/workspaces")
}

fn default_artifact_root() -> String {
    "generated_app".to_string()
}

fn default_context_char_budget() -> usize {
    4000
}

fn default_true() -> bool {
    true
}

fn default_python() -> String {
    "python3".to_string()
}

fn default_venv_dir() -> String {
    ".venv_sandbox".to_string()
}

fn default_baseline_packages() -> Vec<String> {
    vec!["fastapi".to_string(), "uvicorn".to_string()]
}

fn default_install_timeout_secs() -> u64 {
    300
}

fn default_health_check_timeout_secs() -> u64 {
    20
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_base_port() -> u16 {
    8010
}

impl KilnConfig {
    /// Load `.kiln/config.toml` (or defaults), then apply environment overrides
    pub fn load(repo_root: &Path) -> Result<Self> {
        let mut config = Self::load_or_default(repo_root)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Load configuration from `.kiln/config.toml` or use defaults
    pub fn load_or_default(repo_root: &Path) -> Result<Self> {
        let config_path = repo_root.join(".kiln/config.toml");

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            toml::from_str(&content)
                .map_err(|e| KilnError::Config(format!("Failed to parse config file: {}", e)))
        } else {
            Ok(Self::default())
        }
    }

    /// Write default configuration to `.kiln/config.toml`
    pub fn write_default(repo_root: &Path) -> Result<PathBuf> {
        let config_dir = repo_root.join(".kiln");
        std::fs::create_dir_all(&config_dir)?;

        let config_path = config_dir.join("config.toml");
        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| KilnError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(&config_path, content)?;
        Ok(config_path)
    }

    /// Apply environment-style overrides from `lookup`.
    ///
    /// Blank values are ignored. In `api` mode `API_MODEL_*` wins over `MODEL_*`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(mode) = get("LLM_MODE") {
            self.generator.mode = mode.parse().map_err(KilnError::Config)?;
        }
        if let Some(url) = get("OLLAMA_BASE_URL") {
            self.generator.ollama_base_url = url;
        }
        if let Some(url) = get("API_BASE_URL") {
            self.generator.api_base_url = url;
        }

        let api_mode = self.generator.mode == GeneratorMode::Api;
        let model = |stage: &str| {
            let api = if api_mode {
                get(&format!("API_MODEL_{}", stage))
            } else {
                None
            };
            api.or_else(|| get(&format!("MODEL_{}", stage)))
        };
        if let Some(m) = model("ENHANCE") {
            self.generator.models.enhance = m;
        }
        if let Some(m) = model("SPEC") {
            self.generator.models.spec = m;
        }
        if let Some(m) = model("CODE") {
            self.generator.models.code = m;
        }
        if let Some(m) = model("REPAIR") {
            self.generator.models.repair = m;
        }

        if let Some(raw) = get("MAX_REPAIR_ATTEMPTS") {
            self.run.max_attempts = raw.parse().map_err(|_| {
                KilnError::Config(format!("MAX_REPAIR_ATTEMPTS is not a number: {}", raw))
            })?;
        }
        if let Some(root) = get("KILN_WORKSPACE_ROOT") {
            self.run.workspace_root = PathBuf::from(root);
        }
        if let Some(python) = get("KILN_PYTHON") {
            self.sandbox.python = python;
        }
        Ok(())
    }

    /// API key read from the configured environment variable
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.generator.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
    }

    pub fn layout(&self) -> ArtifactLayout {
        ArtifactLayout::new(self.run.artifact_root.clone())
    }
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            mode: GeneratorMode::default(),
            ollama_base_url: default_ollama_base_url(),
            api_base_url: String::new(),
            api_key_env: default_api_key_env(),
            models: ModelRouting::default(),
            max_tokens: default_max_tokens(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for ModelRouting {
    fn default() -> Self {
        Self {
            enhance: default_model(),
            spec: default_model(),
            code: default_model(),
            repair: default_model(),
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            generation_attempts: default_generation_attempts(),
            workspace_root: default_workspace_root(),
            artifact_root: default_artifact_root(),
            context_char_budget: default_context_char_budget(),
            enhance_prompt: true,
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            python: default_python(),
            venv_dir: default_venv_dir(),
            baseline_packages: default_baseline_packages(),
            install_timeout_secs: default_install_timeout_secs(),
            health_check_timeout_secs: default_health_check_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            host: default_host(),
            base_port: default_base_port(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = KilnConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.run.max_attempts, 3);
        assert_eq!(config.run.context_char_budget, 4000);
        assert_eq!(config.sandbox.base_port, 8010);
        assert_eq!(config.generator.mode, GeneratorMode::Ollama);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".kiln")).unwrap();
        std::fs::write(
            dir.path().join(".kiln/config.toml"),
            "[run]\nmax_attempts = 5\n\n[sandbox]\npython = \"python3.12\"\n",
        )
        .unwrap();

        let config = KilnConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.run.max_attempts, 5);
        assert_eq!(config.run.generation_attempts, 3);
        assert_eq!(config.sandbox.python, "python3.12");
        assert_eq!(config.sandbox.venv_dir, ".venv_sandbox");
    }

    #[test]
    fn test_write_default_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = KilnConfig::write_default(dir.path()).unwrap();
        assert!(path.exists());
        let config = KilnConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.sandbox.baseline_packages, vec!["fastapi", "uvicorn"]);
    }

    #[test]
    fn test_env_overrides() {
        let vars = env(&[
            ("LLM_MODE", "api"),
            ("API_BASE_URL", "https://llm.example.com"),
            ("MODEL_CODE", "local-coder"),
            ("API_MODEL_CODE", "hosted-coder"),
            ("MODEL_REPAIR", "fixer"),
            ("MAX_REPAIR_ATTEMPTS", "2"),
            ("MODEL_SPEC", "   "),
        ]);
        let mut config = KilnConfig::default();
        config.apply_overrides(|k| vars.get(k).cloned()).unwrap();

        assert_eq!(config.generator.mode, GeneratorMode::Api);
        assert_eq!(config.generator.api_base_url, "https://llm.example.com");
        assert_eq!(config.generator.models.code, "hosted-coder");
        assert_eq!(config.generator.models.repair, "fixer");
        assert_eq!(config.generator.models.spec, "llama3.1");
        assert_eq!(config.run.max_attempts, 2);
    }

    #[test]
    fn test_api_models_ignored_in_ollama_mode() {
        let vars = env(&[("MODEL_CODE", "local-coder"), ("API_MODEL_CODE", "hosted")]);
        let mut config = KilnConfig::default();
        config.apply_overrides(|k| vars.get(k).cloned()).unwrap();
        assert_eq!(config.generator.models.code, "local-coder");
    }

    #[test]
    fn test_bad_attempt_count_is_config_error() {
        let vars = env(&[("MAX_REPAIR_ATTEMPTS", "many")]);
        let mut config = KilnConfig::default();
        let err = config
            .apply_overrides(|k| vars.get(k).cloned())
            .unwrap_err();
        assert!(matches!(err, KilnError::Config(_)));
    }
}
