//! Launching the application and probing it until it listens

use crate::{LaunchOutcome, SandboxError};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Characters of captured output kept for diagnostics; tracebacks end the log
const OUTPUT_TAIL_CHARS: usize = 8000;

/// Longest single connection attempt during probing
const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// What to start and where to look for it
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Directory holding the append-only stdout/stderr logs
    pub log_dir: PathBuf,
    pub host: String,
    pub port: u16,
}

impl LaunchSpec {
    pub fn stdout_log(&self) -> PathBuf {
        self.log_dir.join("app.stdout.log")
    }

    pub fn stderr_log(&self) -> PathBuf {
        self.log_dir.join("app.stderr.log")
    }
}

/// A launched application process.
///
/// Dropping the handle leaves the process running; call
/// [`ProcessHandle::shutdown`] to stop it.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Option<Child>,
    pid: Option<u32>,
    address: String,
    stdout_log: Option<PathBuf>,
    stderr_log: Option<PathBuf>,
}

impl ProcessHandle {
    fn owned(child: Child, spec: &LaunchSpec) -> Self {
        Self {
            pid: child.id(),
            child: Some(child),
            address: format!("{}:{}", spec.host, spec.port),
            stdout_log: Some(spec.stdout_log()),
            stderr_log: Some(spec.stderr_log()),
        }
    }

    /// Handle for a process this crate did not start, such as a server run by a
    /// test double. Shutdown is a no-op.
    pub fn external(address: impl Into<String>) -> Self {
        Self {
            child: None,
            pid: None,
            address: address.into(),
            stdout_log: None,
            stderr_log: None,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// `host:port` the application was told to bind
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn url(&self) -> String {
        let (host, port) = self
            .address
            .rsplit_once(':')
            .unwrap_or((self.address.as_str(), ""));
        format!("http://{}:{}", probe_host(host), port)
    }

    pub fn log_paths(&self) -> Option<(&Path, &Path)> {
        match (&self.stdout_log, &self.stderr_log) {
            (Some(out), Some(err)) => Some((out.as_path(), err.as_path())),
            _ => None,
        }
    }

    /// Whether the process is still alive
    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => true,
        }
    }

    /// Stop the process and wait for it to exit
    pub async fn shutdown(mut self) -> Result<(), SandboxError> {
        if let Some(mut child) = self.child.take() {
            if let Ok(None) = child.try_wait() {
                child.start_kill()?;
            }
            child.wait().await?;
            info!("Stopped application at {}", self.address);
        }
        Ok(())
    }
}

/// Address to connect to when probing a bind address
pub fn probe_host(host: &str) -> &str {
    match host {
        "" | "0.0.0.0" => "127.0.0.1",
        "::" | "[::]" => "::1",
        other => other,
    }
}

/// Start the process with output appended to the log files, then poll until
/// it accepts a TCP connection, exits, or `timeout` elapses.
///
/// Reported output covers only what this launch wrote.
#[instrument(skip(spec), fields(program = %spec.program.display(), port = spec.port))]
pub async fn launch_and_probe(
    spec: &LaunchSpec,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<LaunchOutcome, SandboxError> {
    tokio::fs::create_dir_all(&spec.log_dir).await?;
    let (stdout, stdout_offset) = open_append(&spec.stdout_log())?;
    let (stderr, stderr_offset) = open_append(&spec.stderr_log())?;

    let mut child = Command::new(&spec.program)
        .args(&spec.args)
        .current_dir(&spec.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .kill_on_drop(false)
        .spawn()
        .map_err(|source| SandboxError::Spawn {
            program: spec.program.display().to_string(),
            source,
        })?;
    debug!("Spawned pid {:?}", child.id());

    let target = (probe_host(&spec.host).to_string(), spec.port);
    let deadline = Instant::now() + timeout;

    loop {
        if let Some(status) = child.try_wait()? {
            let output = read_output(spec, stdout_offset, stderr_offset).await;
            warn!("Application exited during startup: {}", status);
            return Ok(LaunchOutcome::Exited {
                code: status.code(),
                output,
            });
        }

        let connected = matches!(
            tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(target.clone())).await,
            Ok(Ok(_))
        );
        // Something else may own the port; only trust the probe if we are still alive
        if connected && child.try_wait()?.is_none() {
            info!("Application listening on {}:{}", spec.host, spec.port);
            return Ok(LaunchOutcome::Ready(ProcessHandle::owned(child, spec)));
        }

        if Instant::now() >= deadline {
            warn!("Health check timed out after {:?}", timeout);
            if let Err(e) = child.start_kill() {
                warn!("Failed to stop timed-out process: {}", e);
            }
            child.wait().await?;
            let output = read_output(spec, stdout_offset, stderr_offset).await;
            return Ok(LaunchOutcome::TimedOut { output });
        }

        tokio::time::sleep(poll_interval).await;
    }
}

fn open_append(path: &Path) -> Result<(std::fs::File, u64), SandboxError> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let offset = file.metadata()?.len();
    Ok((file, offset))
}

async fn read_output(spec: &LaunchSpec, stdout_offset: u64, stderr_offset: u64) -> String {
    let stdout = read_from(&spec.stdout_log(), stdout_offset).await;
    let stderr = read_from(&spec.stderr_log(), stderr_offset).await;
    let combined = match (stdout.trim().is_empty(), stderr.trim().is_empty()) {
        (true, _) => stderr,
        (false, true) => stdout,
        (false, false) => format!("{}\n{}", stdout.trim_end(), stderr),
    };
    tail(combined.trim(), OUTPUT_TAIL_CHARS)
}

async fn read_from(path: &Path, offset: u64) -> String {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let start = usize::try_from(offset).unwrap_or(usize::MAX).min(bytes.len());
            String::from_utf8_lossy(&bytes[start..]).into_owned()
        }
        Err(e) => {
            warn!("Failed to read {}: {}", path.display(), e);
            String::new()
        }
    }
}

fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    text.chars().skip(count - max_chars).collect()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sh(dir: &Path, script: &str, port: u16) -> LaunchSpec {
        LaunchSpec {
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), script.to_string()],
            cwd: dir.to_path_buf(),
            log_dir: dir.join(".kiln_logs"),
            host: "0.0.0.0".to_string(),
            port,
        }
    }

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_early_exit_reports_code_and_output() {
        let dir = TempDir::new().unwrap();
        let spec = sh(dir.path(), "echo boom >&2; exit 3", free_port());

        let outcome = launch_and_probe(&spec, Duration::from_secs(5), Duration::from_millis(50))
            .await
            .unwrap();
        match outcome {
            LaunchOutcome::Exited { code, output } => {
                assert_eq!(code, Some(3));
                assert!(output.contains("boom"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ready_when_port_accepts() {
        let dir = TempDir::new().unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let spec = sh(dir.path(), "sleep 30", port);

        let outcome = launch_and_probe(&spec, Duration::from_secs(5), Duration::from_millis(50))
            .await
            .unwrap();
        let LaunchOutcome::Ready(mut handle) = outcome else {
            panic!("expected ready");
        };
        assert!(handle.pid().is_some());
        assert!(handle.is_running());
        assert_eq!(handle.url(), format!("http://127.0.0.1:{}", port));
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_stops_process() {
        let dir = TempDir::new().unwrap();
        let spec = sh(dir.path(), "echo starting; sleep 30", free_port());

        let started = Instant::now();
        let outcome = launch_and_probe(&spec, Duration::from_millis(300), Duration::from_millis(50))
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        match outcome {
            LaunchOutcome::TimedOut { output } => assert!(output.contains("starting")),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_output_scoped_to_this_launch() {
        let dir = TempDir::new().unwrap();
        let port = free_port();
        let timeout = Duration::from_secs(5);
        let poll = Duration::from_millis(50);

        launch_and_probe(&sh(dir.path(), "echo first; exit 1", port), timeout, poll)
            .await
            .unwrap();
        let second = launch_and_probe(&sh(dir.path(), "echo second; exit 1", port), timeout, poll)
            .await
            .unwrap();

        let LaunchOutcome::Exited { output, .. } = second else {
            panic!("expected exit");
        };
        assert_eq!(output, "second");
        let log = std::fs::read_to_string(dir.path().join(".kiln_logs/app.stdout.log")).unwrap();
        assert_eq!(log, "first\nsecond\n");
    }

    #[tokio::test]
    async fn test_external_handle_shutdown_is_noop() {
        let mut handle = ProcessHandle::external("127.0.0.1:9");
        assert!(handle.is_running());
        assert!(handle.log_paths().is_none());
        handle.shutdown().await.unwrap();
    }

    #[test]
    fn test_probe_host() {
        assert_eq!(probe_host("0.0.0.0"), "127.0.0.1");
        assert_eq!(probe_host("localhost"), "localhost");
    }
}
