//! # kiln-sandbox
//!
//! One isolated execution environment per run workspace.
//!
//! The environment is a Python virtualenv created inside the workspace and
//! reused by every attempt of the run. Per attempt it installs the generated
//! manifest, byte-compiles the backend sources and launches the application,
//! probing its port until it answers, exits, or the health-check window
//! closes.
//!
//! Recoverable failures (install, syntax, launch) come back as values and
//! feed the repair loop. [`SandboxError`] is reserved for faults of the
//! sandbox itself.

mod error;
mod process;
mod sandbox;
mod types;
mod venv;

pub use error::SandboxError;
pub use process::{launch_and_probe, probe_host, LaunchSpec, ProcessHandle};
pub use sandbox::{Sandbox, ScriptedLaunch, ScriptedSandbox};
pub use types::{ExecResult, LaunchOutcome, SandboxState, SyntaxFailure};
pub use venv::{VenvSandbox, LOG_DIR};
