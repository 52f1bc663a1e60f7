use crate::ProcessHandle;

/// Output of a finished subprocess
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    /// Process exit code; -1 when the process was killed or timed out
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    pub fn new(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    /// A step that had nothing to do
    pub fn skipped(message: impl Into<String>) -> Self {
        Self::new(0, message, "")
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// First source file that failed to compile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxFailure {
    /// Path relative to the workspace root
    pub file: String,
    pub message: String,
}

/// Result of launching the application and waiting for it to listen
#[derive(Debug)]
pub enum LaunchOutcome {
    /// Accepting connections; the process is left running
    Ready(ProcessHandle),
    /// Exited before accepting a connection
    Exited { code: Option<i32>, output: String },
    /// Still not listening when the health-check window closed; the process was stopped
    TimedOut { output: String },
}

impl LaunchOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, LaunchOutcome::Ready(_))
    }

    /// Description of a failed launch, suitable as repair input
    pub fn failure_text(&self) -> Option<String> {
        match self {
            LaunchOutcome::Ready(_) => None,
            LaunchOutcome::Exited { code, output } => Some(format!(
                "Process exited with code {}\nOutput:\n{}",
                code.map(|c| c.to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
                output
            )),
            LaunchOutcome::TimedOut { output } => Some(format!(
                "Health check timed out: the server never accepted connections\nOutput:\n{}",
                output
            )),
        }
    }
}

/// Per-attempt lifecycle of the sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SandboxState {
    #[default]
    NotProvisioned,
    Provisioned,
    DepsInstalling,
    DepsReady,
    DepsFailed,
    SyntaxChecking,
    SyntaxOk,
    SyntaxFailed,
    Launching,
    Running,
    LaunchFailed,
}

impl SandboxState {
    /// Whether the environment exists
    pub fn is_provisioned(&self) -> bool {
        !matches!(self, SandboxState::NotProvisioned)
    }

    /// Legal steps. An install may start from any provisioned state that is
    /// not mid-step, which is how a new attempt begins.
    pub fn can_transition_to(&self, next: SandboxState) -> bool {
        use SandboxState::*;
        match (self, next) {
            (NotProvisioned, Provisioned) => true,
            (
                Provisioned | DepsReady | DepsFailed | SyntaxOk | SyntaxFailed | LaunchFailed,
                DepsInstalling,
            ) => true,
            (DepsInstalling, DepsReady | DepsFailed) => true,
            (DepsReady | SyntaxOk | SyntaxFailed | LaunchFailed, SyntaxChecking) => true,
            (SyntaxChecking, SyntaxOk | SyntaxFailed) => true,
            (SyntaxOk | LaunchFailed, Launching) => true,
            (Launching, Running | LaunchFailed) => true,
            _ => false,
        }
    }
}
