//! In-memory tables shared by the store implementations

use chrono::Utc;
use kiln_core::{
    KilnError, LogEvent, Project, ProjectId, Result, RunId, RunRecord, RunStatus, Severity,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One persisted line. Later run snapshots supersede earlier ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub(crate) enum Record {
    Project(Project),
    Run(RunRecord),
    Log(LogEvent),
}

impl From<Project> for Record {
    fn from(project: Project) -> Self {
        Record::Project(project)
    }
}

impl From<RunRecord> for Record {
    fn from(run: RunRecord) -> Self {
        Record::Run(run)
    }
}

impl From<LogEvent> for Record {
    fn from(event: LogEvent) -> Self {
        Record::Log(event)
    }
}

#[derive(Debug, Default)]
pub(crate) struct StoreState {
    projects: BTreeMap<ProjectId, Project>,
    runs: BTreeMap<RunId, RunRecord>,
    logs: Vec<LogEvent>,
    next_project: u64,
    next_run: u64,
    next_log: u64,
}

impl StoreState {
    /// Replay a persisted record
    pub fn apply(&mut self, record: Record) {
        match record {
            Record::Project(project) => {
                self.next_project = self.next_project.max(project.id.0);
                self.projects.insert(project.id, project);
            }
            Record::Run(run) => {
                self.next_run = self.next_run.max(run.id.0);
                self.runs.insert(run.id, run);
            }
            Record::Log(event) => {
                self.next_log = self.next_log.max(event.id);
                self.logs.push(event);
            }
        }
    }

    /// Next project record. Nothing changes until it is applied.
    pub fn new_project(&self, name: &str) -> Project {
        Project {
            id: ProjectId(self.next_project + 1),
            name: name.to_string(),
            created_at: Utc::now(),
        }
    }

    pub fn project(&self, id: ProjectId) -> Result<Project> {
        self.projects
            .get(&id)
            .cloned()
            .ok_or(KilnError::ProjectNotFound(id.0))
    }

    pub fn projects(&self) -> Vec<Project> {
        self.projects.values().cloned().collect()
    }

    /// Next run record, in `Queued`
    pub fn new_run(&self, project_id: ProjectId, prompt: &str) -> Result<RunRecord> {
        self.project(project_id)?;
        let now = Utc::now();
        Ok(RunRecord {
            id: RunId(self.next_run + 1),
            project_id,
            prompt: prompt.to_string(),
            status: RunStatus::Queued,
            entrypoint: String::new(),
            attempts: 0,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn run(&self, id: RunId) -> Result<RunRecord> {
        self.runs.get(&id).cloned().ok_or(KilnError::RunNotFound(id.0))
    }

    pub fn runs_for(&self, project_id: ProjectId) -> Vec<RunRecord> {
        self.runs
            .values()
            .filter(|r| r.project_id == project_id)
            .cloned()
            .collect()
    }

    /// Snapshot of run `id` with `change` applied
    pub fn updated_run(
        &self,
        id: RunId,
        change: impl FnOnce(&mut RunRecord) -> Result<()>,
    ) -> Result<RunRecord> {
        let mut updated = self.run(id)?;
        change(&mut updated)?;
        updated.updated_at = Utc::now();
        Ok(updated)
    }

    pub fn new_log(
        &self,
        run_id: RunId,
        stage: &str,
        severity: Severity,
        message: &str,
    ) -> Result<LogEvent> {
        self.run(run_id)?;
        Ok(LogEvent {
            id: self.next_log + 1,
            run_id,
            stage: stage.to_string(),
            severity,
            message: message.to_string(),
            created_at: Utc::now(),
        })
    }

    pub fn logs(&self, run_id: RunId, after_id: Option<u64>) -> Vec<LogEvent> {
        self.logs
            .iter()
            .filter(|e| e.run_id == run_id && after_id.map_or(true, |after| e.id > after))
            .cloned()
            .collect()
    }
}

pub(crate) fn transition(run: &mut RunRecord, status: RunStatus) -> Result<()> {
    if !run.status.can_transition_to(status) {
        return Err(KilnError::InvalidTransition {
            from: run.status.to_string(),
            to: status.to_string(),
        });
    }
    run.status = status;
    Ok(())
}
