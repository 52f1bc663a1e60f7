use crate::state::{transition, Record, StoreState};
use crate::RunStore;
use async_trait::async_trait;
use kiln_core::{LogEvent, Project, ProjectId, Result, RunId, RunRecord, RunStatus, Severity};
use tokio::sync::Mutex;

/// Process-local store; contents are lost on exit
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn update(
        &self,
        id: RunId,
        change: impl FnOnce(&mut RunRecord) -> Result<()> + Send,
    ) -> Result<RunRecord> {
        let mut state = self.state.lock().await;
        let run = state.updated_run(id, change)?;
        state.apply(Record::Run(run.clone()));
        Ok(run)
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn create_project(&self, name: &str) -> Result<Project> {
        let mut state = self.state.lock().await;
        let project = state.new_project(name);
        state.apply(Record::Project(project.clone()));
        Ok(project)
    }

    async fn get_project(&self, id: ProjectId) -> Result<Project> {
        self.state.lock().await.project(id)
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        Ok(self.state.lock().await.projects())
    }

    async fn create_run(&self, project_id: ProjectId, prompt: &str) -> Result<RunRecord> {
        let mut state = self.state.lock().await;
        let run = state.new_run(project_id, prompt)?;
        state.apply(Record::Run(run.clone()));
        Ok(run)
    }

    async fn get_run(&self, id: RunId) -> Result<RunRecord> {
        self.state.lock().await.run(id)
    }

    async fn list_runs(&self, project_id: ProjectId) -> Result<Vec<RunRecord>> {
        Ok(self.state.lock().await.runs_for(project_id))
    }

    async fn update_status(&self, id: RunId, status: RunStatus) -> Result<RunRecord> {
        self.update(id, |run| transition(run, status)).await
    }

    async fn set_attempts(&self, id: RunId, attempts: u32) -> Result<RunRecord> {
        self.update(id, |run| {
            run.attempts = attempts;
            Ok(())
        })
        .await
    }

    async fn set_entrypoint(&self, id: RunId, entrypoint: &str) -> Result<RunRecord> {
        self.update(id, |run| {
            run.entrypoint = entrypoint.to_string();
            Ok(())
        })
        .await
    }

    async fn append_log(
        &self,
        run_id: RunId,
        stage: &str,
        severity: Severity,
        message: &str,
    ) -> Result<LogEvent> {
        let mut state = self.state.lock().await;
        let event = state.new_log(run_id, stage, severity, message)?;
        state.apply(Record::Log(event.clone()));
        Ok(event)
    }

    async fn list_logs(&self, run_id: RunId, after_id: Option<u64>) -> Result<Vec<LogEvent>> {
        Ok(self.state.lock().await.logs(run_id, after_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::KilnError;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_run_lifecycle() {
        let store = MemoryStore::new();
        let project = store.create_project("menu site").await.unwrap();
        let run = store.create_run(project.id, "a cafe menu").await.unwrap();
        assert_eq!(run.status, RunStatus::Queued);
        assert_eq!(run.attempts, 0);

        store.update_status(run.id, RunStatus::Running).await.unwrap();
        store.update_status(run.id, RunStatus::Running).await.unwrap();
        store.set_attempts(run.id, 2).await.unwrap();
        let done = store.update_status(run.id, RunStatus::Success).await.unwrap();
        assert_eq!(done.status, RunStatus::Success);
        assert_eq!(done.attempts, 2);
        assert!(done.updated_at >= done.created_at);
    }

    #[tokio::test]
    async fn test_backward_transition_rejected() {
        let store = MemoryStore::new();
        let project = store.create_project("p").await.unwrap();
        let run = store.create_run(project.id, "x").await.unwrap();
        store.update_status(run.id, RunStatus::Failed).await.unwrap();

        let err = store
            .update_status(run.id, RunStatus::Running)
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::InvalidTransition { .. }));
        assert_eq!(store.get_run(run.id).await.unwrap().status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_unknown_ids() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.create_run(ProjectId(9), "x").await,
            Err(KilnError::ProjectNotFound(9))
        ));
        assert!(matches!(
            store.get_run(RunId(4)).await,
            Err(KilnError::RunNotFound(4))
        ));
    }

    #[tokio::test]
    async fn test_logs_ordered_and_pollable() {
        let store = MemoryStore::new();
        let project = store.create_project("p").await.unwrap();
        let a = store.create_run(project.id, "a").await.unwrap();
        let b = store.create_run(project.id, "b").await.unwrap();

        store.append_log(a.id, "generate", Severity::Info, "one").await.unwrap();
        store.append_log(b.id, "generate", Severity::Info, "other").await.unwrap();
        let second = store.append_log(a.id, "install", Severity::Error, "two").await.unwrap();
        store.append_log(a.id, "launch", Severity::Info, "three").await.unwrap();

        let all: Vec<String> = store
            .list_logs(a.id, None)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.message)
            .collect();
        assert_eq!(all, vec!["one", "two", "three"]);

        let after = store.list_logs(a.id, Some(second.id)).await.unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].message, "three");
    }

    #[tokio::test]
    async fn test_concurrent_appends() {
        let store = Arc::new(MemoryStore::new());
        let project = store.create_project("p").await.unwrap();
        let run = store.create_run(project.id, "x").await.unwrap();

        let tasks: Vec<_> = (0..20)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .append_log(run.id, "stage", Severity::Info, &i.to_string())
                        .await
                        .unwrap();
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let ids: Vec<u64> = store
            .list_logs(run.id, None)
            .await
            .unwrap()
            .iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, (1..=20).collect::<Vec<u64>>());
    }
}
