//! Python virtualenv sandbox

use crate::process::{launch_and_probe, LaunchSpec};
use crate::{ExecResult, LaunchOutcome, Sandbox, SandboxError, SandboxState, SyntaxFailure};
use async_trait::async_trait;
use kiln_core::config::SandboxConfig;
use kiln_core::workspace::normalize_relative;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};
use walkdir::{DirEntry, WalkDir};

/// Workspace directory receiving application output
pub const LOG_DIR: &str = ".kiln_logs";

const COMPILE_TIMEOUT: Duration = Duration::from_secs(60);
const VENV_TIMEOUT: Duration = Duration::from_secs(300);

/// Sandbox backed by a virtualenv inside the run workspace.
///
/// The application is started as `python -m uvicorn <module>:app` from the
/// directory holding the entrypoint.
#[derive(Debug)]
pub struct VenvSandbox {
    workspace_root: PathBuf,
    app_dir: PathBuf,
    app_module: String,
    config: SandboxConfig,
    state: SandboxState,
}

impl VenvSandbox {
    /// `entrypoint` is relative to the workspace root, e.g. `generated_app/backend/main.py`
    pub fn new(workspace_root: impl Into<PathBuf>, entrypoint: &str, config: SandboxConfig) -> Self {
        let mut sandbox = Self {
            workspace_root: workspace_root.into(),
            app_dir: PathBuf::new(),
            app_module: String::new(),
            config,
            state: SandboxState::NotProvisioned,
        };
        sandbox.set_entrypoint(entrypoint);
        sandbox
    }

    pub fn venv_dir(&self) -> PathBuf {
        self.workspace_root.join(&self.config.venv_dir)
    }

    /// Interpreter inside the virtualenv
    pub fn venv_python(&self) -> PathBuf {
        if cfg!(windows) {
            self.venv_dir().join("Scripts").join("python.exe")
        } else {
            self.venv_dir().join("bin").join("python")
        }
    }

    pub fn app_dir(&self) -> &Path {
        &self.app_dir
    }

    /// `module:app` target handed to uvicorn
    pub fn app_target(&self) -> String {
        format!("{}:app", self.app_module)
    }

    fn advance(&mut self, next: SandboxState) -> Result<(), SandboxError> {
        if !self.state.can_transition_to(next) {
            return Err(SandboxError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        debug!("Sandbox {:?} -> {:?}", self.state, next);
        self.state = next;
        Ok(())
    }

    fn relative(&self, path: &Path) -> String {
        let rel = path.strip_prefix(&self.workspace_root).unwrap_or(path);
        normalize_relative(&rel.to_string_lossy())
    }

    async fn install_baseline(&self) {
        if self.config.baseline_packages.is_empty() {
            return;
        }
        let python = self.venv_python();
        let mut args = vec!["-m", "pip", "install", "--no-input", "--disable-pip-version-check"];
        args.extend(self.config.baseline_packages.iter().map(String::as_str));
        match exec(&python, &args, &self.workspace_root, self.install_timeout()).await {
            Ok(result) if result.success() => {
                info!("Installed baseline packages: {}", self.config.baseline_packages.join(", "))
            }
            Ok(result) => warn!(
                "Baseline install exited with {}: {}",
                result.exit_code,
                result.stderr.trim()
            ),
            Err(e) => warn!("Baseline install failed: {}", e),
        }
    }

    fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.config.install_timeout_secs)
    }

    fn python_sources(&self) -> Vec<PathBuf> {
        let venv = self.venv_dir();
        WalkDir::new(&self.app_dir)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !skip_entry(e, &venv))
            .filter_map(|e| match e {
                Ok(entry) => Some(entry),
                Err(err) => {
                    warn!("Skipping unreadable entry: {}", err);
                    None
                }
            })
            .filter(|e| e.file_type().is_file())
            .filter(|e| e.path().extension() == Some(OsStr::new("py")))
            .map(DirEntry::into_path)
            .collect()
    }
}

fn skip_entry(entry: &DirEntry, venv: &Path) -> bool {
    if entry.depth() == 0 {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    entry.path() == venv
        || (entry.file_type().is_dir() && (name == "__pycache__" || name.starts_with('.')))
}

#[async_trait]
impl Sandbox for VenvSandbox {
    fn state(&self) -> SandboxState {
        self.state
    }

    fn set_entrypoint(&mut self, entrypoint: &str) {
        let entrypoint = normalize_relative(entrypoint);
        let path = Path::new(&entrypoint);
        self.app_dir = match path.parent() {
            Some(parent) => self.workspace_root.join(parent),
            None => self.workspace_root.clone(),
        };
        self.app_module = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "main".to_string());
    }

    #[instrument(skip(self), fields(venv = %self.venv_dir().display()))]
    async fn setup(&mut self) -> Result<(), SandboxError> {
        if self.state.is_provisioned() {
            return Ok(());
        }

        if tokio::fs::try_exists(self.venv_python()).await? {
            debug!("Reusing existing environment");
        } else {
            tokio::fs::create_dir_all(&self.workspace_root).await?;
            info!("Creating virtual environment");
            let venv = self.venv_dir().to_string_lossy().into_owned();
            let result = exec(
                Path::new(&self.config.python),
                &["-m", "venv", venv.as_str()],
                &self.workspace_root,
                VENV_TIMEOUT,
            )
            .await?;
            if !result.success() {
                return Err(SandboxError::Provision(format!(
                    "venv creation exited with {}: {}",
                    result.exit_code,
                    result.stderr.trim()
                )));
            }
            self.install_baseline().await;
        }

        self.advance(SandboxState::Provisioned)
    }

    #[instrument(skip(self), fields(manifest = %manifest.display()))]
    async fn install_deps(&mut self, manifest: &Path) -> Result<ExecResult, SandboxError> {
        if !self.state.is_provisioned() {
            return Err(SandboxError::NotProvisioned);
        }
        self.advance(SandboxState::DepsInstalling)?;

        let has_requirements = match tokio::fs::read_to_string(manifest).await {
            Ok(content) => !content.trim().is_empty(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        if !has_requirements {
            self.advance(SandboxState::DepsReady)?;
            return Ok(ExecResult::skipped("No requirements to install."));
        }

        let manifest_arg = manifest.to_string_lossy().into_owned();
        let args = [
            "-m",
            "pip",
            "install",
            "--no-input",
            "--disable-pip-version-check",
            "--default-timeout",
            "120",
            "-r",
            manifest_arg.as_str(),
        ];
        let result = exec(
            &self.venv_python(),
            &args,
            &self.workspace_root,
            self.install_timeout(),
        )
        .await?;

        if result.success() {
            info!("Dependencies installed");
            self.advance(SandboxState::DepsReady)?;
        } else {
            warn!("Dependency install exited with {}", result.exit_code);
            self.advance(SandboxState::DepsFailed)?;
        }
        Ok(result)
    }

    #[instrument(skip(self), fields(dir = %self.app_dir.display()))]
    async fn check_syntax(&mut self) -> Result<Option<SyntaxFailure>, SandboxError> {
        self.advance(SandboxState::SyntaxChecking)?;
        let python = self.venv_python();

        for source in self.python_sources() {
            let file = source.to_string_lossy().into_owned();
            let result = exec(
                &python,
                &["-m", "py_compile", file.as_str()],
                &self.workspace_root,
                COMPILE_TIMEOUT,
            )
            .await?;
            if !result.success() {
                let message = if result.stderr.trim().is_empty() {
                    result.stdout.trim().to_string()
                } else {
                    result.stderr.trim().to_string()
                };
                let failure = SyntaxFailure {
                    file: self.relative(&source),
                    message,
                };
                warn!("Syntax check failed for {}", failure.file);
                self.advance(SandboxState::SyntaxFailed)?;
                return Ok(Some(failure));
            }
        }

        self.advance(SandboxState::SyntaxOk)?;
        Ok(None)
    }

    #[instrument(skip(self, timeout))]
    async fn launch_and_health_check(
        &mut self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<LaunchOutcome, SandboxError> {
        self.advance(SandboxState::Launching)?;

        if !tokio::fs::try_exists(&self.app_dir).await? {
            self.advance(SandboxState::LaunchFailed)?;
            return Ok(LaunchOutcome::Exited {
                code: None,
                output: format!(
                    "Application directory {} does not exist",
                    self.relative(&self.app_dir)
                ),
            });
        }

        let spec = LaunchSpec {
            program: self.venv_python(),
            args: vec![
                "-m".to_string(),
                "uvicorn".to_string(),
                self.app_target(),
                "--host".to_string(),
                host.to_string(),
                "--port".to_string(),
                port.to_string(),
            ],
            cwd: self.app_dir.clone(),
            log_dir: self.workspace_root.join(LOG_DIR),
            host: host.to_string(),
            port,
        };
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(10));
        let outcome = launch_and_probe(&spec, timeout, poll).await?;

        self.advance(if outcome.is_ready() {
            SandboxState::Running
        } else {
            SandboxState::LaunchFailed
        })?;
        Ok(outcome)
    }
}

/// Run a command to completion; a timeout kills it and reports exit code -1
async fn exec(
    program: &Path,
    args: &[&str],
    cwd: &Path,
    timeout: Duration,
) -> Result<ExecResult, SandboxError> {
    debug!("exec {} {}", program.display(), args.join(" "));
    let child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| SandboxError::Spawn {
            program: program.display().to_string(),
            source,
        })?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => {
            let output = output?;
            Ok(ExecResult::new(
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr),
            ))
        }
        Err(_) => Ok(ExecResult::new(
            -1,
            "",
            format!("Timed out after {}s", timeout.as_secs()),
        )),
    }
}
