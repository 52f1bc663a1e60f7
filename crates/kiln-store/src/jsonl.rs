use crate::state::{transition, Record, StoreState};
use crate::RunStore;
use async_trait::async_trait;
use fs2::FileExt;
use kiln_core::{
    KilnError, LogEvent, Project, ProjectId, Result, RunId, RunRecord, RunStatus, Severity,
};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const LOCK_RETRIES: usize = 100;
const LOCK_RETRY: Duration = Duration::from_millis(50);

/// Append-only JSON-lines store.
///
/// Every change appends one line: projects, log events and a full run
/// snapshot on each run update. Replay applies lines in file order, with the
/// last snapshot of a run winning.
///
/// Several handles, in one process or many, may share a file. Writers hold an
/// exclusive lock on it while they read lines appended by others, allocate
/// ids and append, so ids never collide.
#[derive(Debug)]
pub struct JsonlStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    state: StoreState,
    /// Bytes of the file already applied to `state`
    offset: u64,
}

impl Inner {
    /// Apply complete lines written since the last read. Returns whether the
    /// file ends in a partial line.
    fn catch_up(&mut self, file: &mut File, path: &Path) -> Result<bool> {
        file.seek(SeekFrom::Start(self.offset))?;
        let mut tail = Vec::new();
        file.read_to_end(&mut tail)?;

        let complete = match tail.iter().rposition(|b| *b == b'\n') {
            Some(last) => last + 1,
            None => 0,
        };
        for line in String::from_utf8_lossy(&tail[..complete]).lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Record>(line) {
                Ok(record) => self.state.apply(record),
                Err(e) => warn!("Skipping unreadable line in {:?}: {}", path, e),
            }
        }
        self.offset += complete as u64;
        Ok(complete < tail.len())
    }
}

impl JsonlStore {
    /// Open or create the store at `path`
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let store = Self {
            path: path.into(),
            inner: Mutex::new(Inner::default()),
        };
        store.refresh(&mut *store.inner.lock().await).await?;
        debug!("Loaded store from {:?}", store.path);
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pick up lines appended by other handles
    async fn refresh(&self, inner: &mut Inner) -> Result<()> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        lock_with_retry(&file, <File as FileExt>::try_lock_shared).await?;
        inner.catch_up(&mut file, &self.path)?;
        Ok(())
    }

    /// Build a record from the current state and append it under the file
    /// lock. The state only changes once the line is written.
    async fn commit<T, F>(&self, build: F) -> Result<T>
    where
        T: Clone,
        F: FnOnce(&StoreState) -> Result<T>,
        Record: From<T>,
    {
        let mut inner = self.inner.lock().await;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)?;
        lock_with_retry(&file, <File as FileExt>::try_lock_exclusive).await?;
        let partial = inner.catch_up(&mut file, &self.path)?;

        let value = build(&inner.state)?;
        let record = Record::from(value.clone());
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        if partial {
            // Terminate a torn line so it is skipped on replay, not merged
            line.insert(0, '\n');
        }
        file.write_all(line.as_bytes())?;
        file.flush()?;

        inner.offset = file.seek(SeekFrom::End(0))?;
        inner.state.apply(record);
        Ok(value)
    }

    async fn update(
        &self,
        id: RunId,
        change: impl FnOnce(&mut RunRecord) -> Result<()> + Send,
    ) -> Result<RunRecord> {
        self.commit(|state| state.updated_run(id, change)).await
    }

    async fn read<T>(&self, f: impl FnOnce(&StoreState) -> T) -> Result<T> {
        let mut inner = self.inner.lock().await;
        self.refresh(&mut inner).await?;
        Ok(f(&inner.state))
    }
}

/// Take a file lock, polling while another handle holds it
async fn lock_with_retry(file: &File, try_lock: fn(&File) -> std::io::Result<()>) -> Result<()> {
    for _ in 0..LOCK_RETRIES {
        match try_lock(file) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == ErrorKind::WouldBlock => tokio::time::sleep(LOCK_RETRY).await,
            Err(e) => return Err(e.into()),
        }
    }
    Err(KilnError::Store("timed out waiting for the store lock".to_string()))
}

#[async_trait]
impl RunStore for JsonlStore {
    async fn create_project(&self, name: &str) -> Result<Project> {
        self.commit(|state| Ok(state.new_project(name))).await
    }

    async fn get_project(&self, id: ProjectId) -> Result<Project> {
        self.read(|state| state.project(id)).await?
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        self.read(StoreState::projects).await
    }

    async fn create_run(&self, project_id: ProjectId, prompt: &str) -> Result<RunRecord> {
        self.commit(|state| state.new_run(project_id, prompt)).await
    }

    async fn get_run(&self, id: RunId) -> Result<RunRecord> {
        self.read(|state| state.run(id)).await?
    }

    async fn list_runs(&self, project_id: ProjectId) -> Result<Vec<RunRecord>> {
        self.read(|state| state.runs_for(project_id)).await
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
        self.commit(|state| state.new_log(run_id, stage, severity, message))
            .await
    }

    async fn list_logs(&self, run_id: RunId, after_id: Option<u64>) -> Result<Vec<LogEvent>> {
        self.read(|state| state.logs(run_id, after_id)).await
    }
}
