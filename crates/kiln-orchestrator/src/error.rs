use kiln_core::KilnError;
use kiln_sandbox::SandboxError;
use thiserror::Error;

/// A fault of the run machinery itself. Ends the run without retrying.
#[derive(Error, Debug)]
pub enum RunFault {
    #[error(transparent)]
    Kiln(#[from] KilnError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("{0}")]
    Invariant(String),
}
