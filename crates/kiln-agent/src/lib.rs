//! # kiln-agent
//!
//! Everything that talks to the text generator, and everything that turns
//! its answers into files.
//!
//! - [`Generator`]: the request/response contract, with HTTP providers for
//!   Ollama and OpenAI-compatible endpoints and a scripted double for tests
//! - [`CodeGenerator`]: prompt enhancement, task spec, code files and repair
//!   requests, with bounded local retries carrying corrective feedback
//! - [`parse_patch`] / [`apply_patch`]: the plain-text patch envelope used by
//!   repair answers, applied through the run's workspace

mod applier;
mod circuit_breaker;
mod client;
mod codegen;
mod error;
mod generator;
mod patch;
pub mod prompts;

pub use applier::{apply_patch, apply_patch_text, PatchReport};
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use client::{HttpGenerator, Provider, RetryPolicy};
pub use codegen::{post_process, CodeGenerator, GenerationFeedback, RepairContext, SPEC_ATTEMPTS};
pub use error::{GenerationError, PatchError};
pub use generator::{GenerationRequest, Generator, ScriptedGenerator};
pub use patch::{
    parse_patch, FileUpdate, Hunk, HunkLine, Patch, UpdateBody, BEGIN_PATCH, END_PATCH,
    REPLACE_MARKER, UPDATE_FILE,
};
