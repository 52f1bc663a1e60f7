//! # kiln-store
//!
//! Persistence for projects, runs and their log streams.
//!
//! Log events are append-ordered per store; a poller passing the last id it
//! saw gets exactly the events emitted after it, in emission order.

mod jsonl;
mod memory;
mod state;

pub use jsonl::JsonlStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use kiln_core::{LogEvent, Project, ProjectId, Result, RunId, RunRecord, RunStatus, Severity};

/// Status and log store shared by every run.
///
/// Implementations must accept concurrent appends from independent runs.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create_project(&self, name: &str) -> Result<Project>;

    async fn get_project(&self, id: ProjectId) -> Result<Project>;

    async fn list_projects(&self) -> Result<Vec<Project>>;

    /// Create a run in `Queued`
    async fn create_run(&self, project_id: ProjectId, prompt: &str) -> Result<RunRecord>;

    async fn get_run(&self, id: RunId) -> Result<RunRecord>;

    async fn list_runs(&self, project_id: ProjectId) -> Result<Vec<RunRecord>>;

    /// Move a run to `status`, rejecting backward transitions
    async fn update_status(&self, id: RunId, status: RunStatus) -> Result<RunRecord>;

    async fn set_attempts(&self, id: RunId, attempts: u32) -> Result<RunRecord>;

    async fn set_entrypoint(&self, id: RunId, entrypoint: &str) -> Result<RunRecord>;

    async fn append_log(
        &self,
        run_id: RunId,
        stage: &str,
        severity: Severity,
        message: &str,
    ) -> Result<LogEvent>;

    /// Events for a run in emission order, optionally only those after `after_id`
    async fn list_logs(&self, run_id: RunId, after_id: Option<u64>) -> Result<Vec<LogEvent>>;
}
