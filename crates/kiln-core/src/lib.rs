//! # kiln-core
//!
//! Core types for the Kiln build-execute-diagnose-repair loop.
//!
//! Kiln takes a prompt, asks a text generator for a small web application,
//! writes it into a per-run workspace, runs it in a sandbox and keeps
//! patching it until it starts serving or the attempt budget runs out.
//!
//! ## Shared Pieces
//!
//! - Domain types: generated files, artifacts, run records, log events
//! - `KilnError` and the crate-wide `Result`
//! - `KilnConfig` loaded from `.kiln/config.toml` plus environment overrides
//! - `Workspace`: the only way generated content reaches the filesystem
//! - Dependency-manifest cleanup shared by generation and patching

pub mod config;
mod error;
pub mod fail_open;
pub mod manifest;
mod types;
pub mod workspace;

pub use config::KilnConfig;
pub use error::{KilnError, Result};
pub use types::*;
pub use workspace::Workspace;
