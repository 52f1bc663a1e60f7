use crate::{ExecResult, LaunchOutcome, ProcessHandle, SandboxError, SandboxState, SyntaxFailure};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;

/// Isolated environment bound to one run workspace
#[async_trait]
pub trait Sandbox: Send {
    fn state(&self) -> SandboxState;

    /// Point the sandbox at the application entrypoint, relative to the
    /// workspace root. Called whenever generation settles on one.
    fn set_entrypoint(&mut self, _entrypoint: &str) {}

    /// Create the environment. Calling it again is a no-op.
    async fn setup(&mut self) -> Result<(), SandboxError>;

    /// Install the packages named in `manifest`. A missing or empty manifest
    /// succeeds without running the installer.
    async fn install_deps(&mut self, manifest: &Path) -> Result<ExecResult, SandboxError>;

    /// Byte-compile every backend source file, stopping at the first failure
    async fn check_syntax(&mut self) -> Result<Option<SyntaxFailure>, SandboxError>;

    /// Start the application and wait for it to accept connections
    async fn launch_and_health_check(
        &mut self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<LaunchOutcome, SandboxError>;
}

/// Scripted step results
#[derive(Debug)]
pub enum ScriptedLaunch {
    Ready,
    Exited { code: Option<i32>, output: String },
    TimedOut { output: String },
}

/// Sandbox that replays queued results, for exercising the run loop without
/// Python. Steps with nothing queued succeed.
#[derive(Debug, Default)]
pub struct ScriptedSandbox {
    state: SandboxState,
    installs: VecDeque<ExecResult>,
    syntax: VecDeque<Option<SyntaxFailure>>,
    launches: VecDeque<ScriptedLaunch>,
    setup_error: Option<String>,
    calls: Vec<String>,
}

impl ScriptedSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_install(mut self, result: ExecResult) -> Self {
        self.installs.push_back(result);
        self
    }

    pub fn with_syntax(mut self, result: Option<SyntaxFailure>) -> Self {
        self.syntax.push_back(result);
        self
    }

    pub fn with_launch(mut self, launch: ScriptedLaunch) -> Self {
        self.launches.push_back(launch);
        self
    }

    pub fn failing_setup(mut self, message: impl Into<String>) -> Self {
        self.setup_error = Some(message.into());
        self
    }

    /// Steps invoked so far, e.g. `["setup", "install:<manifest>", "syntax", "launch:8011"]`
    pub fn calls(&self) -> &[String] {
        &self.calls
    }

    fn advance(&mut self, next: SandboxState) {
        self.state = next;
    }
}

#[async_trait]
impl Sandbox for ScriptedSandbox {
    fn state(&self) -> SandboxState {
        self.state
    }

    async fn setup(&mut self) -> Result<(), SandboxError> {
        self.calls.push("setup".to_string());
        if let Some(message) = self.setup_error.take() {
            return Err(SandboxError::Provision(message));
        }
        if !self.state.is_provisioned() {
            self.advance(SandboxState::Provisioned);
        }
        Ok(())
    }

    async fn install_deps(&mut self, manifest: &Path) -> Result<ExecResult, SandboxError> {
        if !self.state.is_provisioned() {
            return Err(SandboxError::NotProvisioned);
        }
        self.calls.push(format!("install:{}", manifest.display()));
        let result = self
            .installs
            .pop_front()
            .unwrap_or_else(|| ExecResult::new(0, "ok", ""));
        self.advance(if result.success() {
            SandboxState::DepsReady
        } else {
            SandboxState::DepsFailed
        });
        Ok(result)
    }

    async fn check_syntax(&mut self) -> Result<Option<SyntaxFailure>, SandboxError> {
        self.calls.push("syntax".to_string());
        let result = self.syntax.pop_front().flatten();
        self.advance(if result.is_some() {
            SandboxState::SyntaxFailed
        } else {
            SandboxState::SyntaxOk
        });
        Ok(result)
    }

    async fn launch_and_health_check(
        &mut self,
        host: &str,
        port: u16,
        _timeout: Duration,
    ) -> Result<LaunchOutcome, SandboxError> {
        self.calls.push(format!("launch:{}", port));
        let outcome = match self.launches.pop_front().unwrap_or(ScriptedLaunch::Ready) {
            ScriptedLaunch::Ready => {
                LaunchOutcome::Ready(ProcessHandle::external(format!("{}:{}", host, port)))
            }
            ScriptedLaunch::Exited { code, output } => LaunchOutcome::Exited { code, output },
            ScriptedLaunch::TimedOut { output } => LaunchOutcome::TimedOut { output },
        };
        self.advance(if outcome.is_ready() {
            SandboxState::Running
        } else {
            SandboxState::LaunchFailed
        });
        Ok(outcome)
    }
}
