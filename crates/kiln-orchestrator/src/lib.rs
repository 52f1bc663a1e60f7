//! # kiln-orchestrator
//!
//! The build, execute, diagnose and repair loop.
//!
//! A run generates an application into its workspace, then repeats
//! install, syntax check and launch inside its sandbox. Each failure is
//! narrowed to the files it names and sent back for a patch, until the
//! application answers on its port or the attempt budget is spent.
//!
//! Control flow lives in [`state_machine`] as a pure function; the
//! [`RunOrchestrator`] performs the side effects it asks for.

mod attempt;
pub mod diagnosis;
mod error;
mod runner;
pub mod state_machine;

pub use attempt::AttemptContext;
pub use diagnosis::{narrow_context, DiagnosticSignal, NarrowedContext, SignalKind};
pub use error::RunFault;
pub use runner::{RunOrchestrator, RunOutcome};
