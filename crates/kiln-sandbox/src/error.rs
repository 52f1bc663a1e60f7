use thiserror::Error;

/// Faults of the sandbox itself, as opposed to failures of the generated code
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Failed to provision environment: {0}")]
    Provision(String),

    #[error("Sandbox not provisioned; call setup first")]
    NotProvisioned,

    #[error("Invalid sandbox transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: crate::SandboxState,
        to: crate::SandboxState,
    },

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
