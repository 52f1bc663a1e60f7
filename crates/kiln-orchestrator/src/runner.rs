//! Drives a run through the state machine
//!
//! The runner owns all I/O: it performs the actions a transition asks for and
//! turns each unit of work into the next event. Store writes for log events
//! are fail-open; status writes are not.

use crate::attempt::AttemptContext;
use crate::diagnosis::{narrow_context, DiagnosticSignal};
use crate::error::RunFault;
use crate::state_machine::{transition, Action, Event, State};
use kiln_agent::{apply_patch_text, CodeGenerator, PatchError};
use kiln_core::fail_open::fail_open;
use kiln_core::{KilnConfig, KilnError, RunId, RunRecord, RunStatus, Severity, Workspace};
use kiln_sandbox::{LaunchOutcome, ProcessHandle, Sandbox, VenvSandbox, LOG_DIR};
use kiln_store::RunStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Final state of a run
#[derive(Debug)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub status: RunStatus,
    /// Attempts consumed
    pub attempts: u32,
    /// Why the run failed
    pub reason: Option<String>,
    /// The running application on success. Dropping it leaves the process up.
    pub handle: Option<ProcessHandle>,
}

/// Per-run mutable state that lives outside the pure machine
struct RunContext<'a> {
    run: RunRecord,
    workspace: &'a Workspace,
    attempt: AttemptContext,
    signal: Option<DiagnosticSignal>,
    handle: Option<ProcessHandle>,
}

pub struct RunOrchestrator {
    codegen: CodeGenerator,
    store: Arc<dyn RunStore>,
    config: KilnConfig,
}

impl RunOrchestrator {
    pub fn new(codegen: CodeGenerator, store: Arc<dyn RunStore>, config: KilnConfig) -> Self {
        Self {
            codegen,
            store,
            config,
        }
    }

    /// The run's private workspace. The sandbox's own directories cannot be patched.
    pub fn workspace_for(&self, run: &RunRecord) -> Workspace {
        Workspace::for_run(&self.config.run.workspace_root, run.project_id, run.id)
            .protect(self.config.sandbox.venv_dir.clone())
            .protect(LOG_DIR)
    }

    /// Port the run's application listens on
    pub fn port_for(&self, run_id: RunId) -> Result<u16, KilnError> {
        u64::from(self.config.sandbox.base_port)
            .checked_add(run_id.0)
            .and_then(|p| u16::try_from(p).ok())
            .ok_or_else(|| {
                KilnError::Config(format!(
                    "port {} + run {} is out of range",
                    self.config.sandbox.base_port, run_id
                ))
            })
    }

    /// Run to completion in a virtualenv sandbox
    pub async fn execute(&self, run_id: RunId) -> Result<RunOutcome, KilnError> {
        let run = self.store.get_run(run_id).await?;
        let workspace = self.workspace_for(&run);
        let mut sandbox = VenvSandbox::new(
            workspace.root(),
            &self.codegen.layout().entrypoint(),
            self.config.sandbox.clone(),
        );
        self.execute_with(run_id, &workspace, &mut sandbox).await
    }

    /// Run to completion with the given workspace and sandbox.
    ///
    /// Only a run that cannot be loaded is an error; everything after that
    /// ends in a terminal status recorded in the store.
    #[instrument(skip(self, workspace, sandbox), fields(run = %run_id))]
    pub async fn execute_with<S: Sandbox + ?Sized>(
        &self,
        run_id: RunId,
        workspace: &Workspace,
        sandbox: &mut S,
    ) -> Result<RunOutcome, KilnError> {
        let run = self.store.get_run(run_id).await?;
        let mut ctx = RunContext {
            run,
            workspace,
            attempt: AttemptContext::new(self.config.run.max_attempts),
            signal: None,
            handle: None,
        };

        let mut state = State::Queued;
        let mut event = Event::Start {
            max_attempts: self.config.run.max_attempts,
        };

        loop {
            debug!("{:?} <- {:?}", state, event);
            let (next_state, actions) = transition(state, event);
            state = next_state;

            let mut next_event = None;
            for action in actions {
                match self.perform(action, &mut ctx, sandbox).await {
                    Ok(Some(produced)) => next_event = Some(produced),
                    Ok(None) => {}
                    Err(fault) => {
                        error!("Run {} fault: {}", run_id, fault);
                        if !state.is_terminal() {
                            next_event = Some(Event::InternalError {
                                message: fault.to_string(),
                            });
                            break;
                        }
                    }
                }
            }

            if state.is_terminal() {
                break;
            }
            event = next_event.unwrap_or_else(|| Event::InternalError {
                message: format!("no work scheduled in state {:?}", state),
            });
        }

        let (status, reason) = match state {
            State::Succeeded { .. } => (RunStatus::Success, None),
            State::Failed { reason } => (RunStatus::Failed, Some(reason)),
            other => (RunStatus::Failed, Some(format!("stopped in {:?}", other))),
        };
        info!("Run {} finished: {}", run_id, status);

        Ok(RunOutcome {
            run_id,
            status,
            attempts: ctx.attempt.attempt,
            reason,
            handle: if status == RunStatus::Success {
                ctx.handle
            } else {
                None
            },
        })
    }

    async fn perform<S: Sandbox + ?Sized>(
        &self,
        action: Action,
        ctx: &mut RunContext<'_>,
        sandbox: &mut S,
    ) -> Result<Option<Event>, RunFault> {
        match action {
            Action::SetStatus(status) => {
                self.store.update_status(ctx.run.id, status).await?;
                Ok(None)
            }
            Action::SetAttempts(attempts) => {
                ctx.attempt.begin(attempts);
                self.store.set_attempts(ctx.run.id, attempts).await?;
                Ok(None)
            }
            Action::Log {
                stage,
                severity,
                message,
            } => {
                self.log(ctx.run.id, &stage, severity, &message).await;
                Ok(None)
            }
            Action::GenerateArtifact => self.generate(ctx, sandbox).await.map(Some),
            Action::RunAttempt { attempt } => self.run_attempt(attempt, ctx, sandbox).await.map(Some),
            Action::RequestRepair { attempt } => self.repair(attempt, ctx).await.map(Some),
        }
    }

    /// Emit to tracing and the run's log stream
    async fn log(&self, run_id: RunId, stage: &str, severity: Severity, message: &str) {
        match severity {
            Severity::Info => info!(run = %run_id, stage, "{}", message),
            Severity::Warn => warn!(run = %run_id, stage, "{}", message),
            Severity::Error | Severity::Fatal => error!(run = %run_id, stage, "{}", message),
        }
        fail_open("run_log", || {
            self.store.append_log(run_id, stage, severity, message)
        })
        .await;
    }

    async fn generate<S: Sandbox + ?Sized>(
        &self,
        ctx: &mut RunContext<'_>,
        sandbox: &mut S,
    ) -> Result<Event, RunFault> {
        let run_id = ctx.run.id;

        let brief = if self.codegen.enhances_prompt() {
            self.log(run_id, "enhance", Severity::Info, "Enhancing prompt").await;
            self.codegen.enhance_prompt(&ctx.run.prompt).await
        } else {
            ctx.run.prompt.clone()
        };

        self.log(run_id, "spec", Severity::Info, "Generating task spec").await;
        let spec = match self.codegen.task_spec(&brief).await {
            Ok(spec) => spec,
            Err(e) => return Ok(Event::GenerationFailed { error: e.to_string() }),
        };
        self.log(
            run_id,
            "spec",
            Severity::Info,
            &format!(
                "Task spec '{}': {} pages, {} endpoints",
                spec.app_name,
                spec.pages.len(),
                spec.api.len()
            ),
        )
        .await;

        self.log(run_id, "codegen", Severity::Info, "Generating code").await;
        let artifact = match self.codegen.generate_code(&spec).await {
            Ok(artifact) => artifact,
            Err(e) => return Ok(Event::GenerationFailed { error: e.to_string() }),
        };

        match ctx.workspace.materialize(&artifact.files).await {
            Ok(_) => {}
            Err(e @ (KilnError::MalformedPath { .. } | KilnError::PathOutsideWorkspace(_))) => {
                return Ok(Event::GenerationFailed {
                    error: format!("generated file rejected: {}", e),
                });
            }
            Err(e) => return Err(e.into()),
        }
        self.log(
            run_id,
            "codegen",
            Severity::Info,
            &format!("Files: {}", artifact.paths().join(", ")),
        )
        .await;

        fail_open("run_entrypoint", || {
            self.store.set_entrypoint(run_id, &artifact.entrypoint)
        })
        .await;
        sandbox.set_entrypoint(&artifact.entrypoint);

        self.log(run_id, "sandbox", Severity::Info, "Setting up isolated environment")
            .await;
        sandbox.setup().await?;
        self.log(run_id, "sandbox", Severity::Info, "Environment ready").await;

        Ok(Event::ArtifactReady {
            files: artifact.files.len(),
        })
    }

    /// Install, syntax check and launch, stopping at the first failure
    async fn run_attempt<S: Sandbox + ?Sized>(
        &self,
        attempt: u32,
        ctx: &mut RunContext<'_>,
        sandbox: &mut S,
    ) -> Result<Event, RunFault> {
        let run_id = ctx.run.id;
        let port = self.port_for(run_id)?;
        let manifest = ctx
            .workspace
            .resolve(&self.codegen.layout().manifest_path())?;

        self.log(
            run_id,
            "deps",
            Severity::Info,
            &format!("Installing dependencies (attempt {})", attempt),
        )
        .await;
        let install = sandbox.install_deps(&manifest).await?;

        let signal = if !install.success() {
            DiagnosticSignal::from_install(&install)
        } else {
            if !install.stdout.trim().is_empty() {
                self.log(run_id, "deps", Severity::Info, last_line(&install.stdout))
                    .await;
            }

            match sandbox.check_syntax().await? {
                Some(failure) => DiagnosticSignal::from_syntax(&failure),
                None => {
                    let host = self.config.sandbox.host.clone();
                    self.log(
                        run_id,
                        "launch",
                        Severity::Info,
                        &format!("Starting application on {}:{}", host, port),
                    )
                    .await;
                    let timeout = Duration::from_secs(self.config.sandbox.health_check_timeout_secs);
                    let outcome = sandbox.launch_and_health_check(&host, port, timeout).await?;
                    match outcome {
                        LaunchOutcome::Ready(handle) => {
                            let address = handle.url();
                            ctx.handle = Some(handle);
                            return Ok(Event::AttemptPassed { address });
                        }
                        failed => DiagnosticSignal::from_launch(&failed).ok_or_else(|| {
                            RunFault::Invariant("failed launch without failure text".to_string())
                        })?,
                    }
                }
            }
        };

        ctx.attempt.record_failure(signal.error_text.clone());
        let event = Event::AttemptFailed {
            stage: signal.kind.stage().to_string(),
            error: signal.error_text.clone(),
        };
        ctx.signal = Some(signal);
        Ok(event)
    }

    /// Ask for a patch for the latest failure and apply it
    async fn repair(&self, attempt: u32, ctx: &mut RunContext<'_>) -> Result<Event, RunFault> {
        let run_id = ctx.run.id;
        let signal = ctx
            .signal
            .as_ref()
            .ok_or_else(|| RunFault::Invariant("repair requested before any failure".to_string()))?;

        let context = narrow_context(
            ctx.workspace,
            self.codegen.layout(),
            signal,
            self.config.run.context_char_budget,
        )
        .await?;
        self.log(
            run_id,
            "repair",
            Severity::Info,
            &format!(
                "Attempt {} context: {}",
                attempt,
                if context.files.is_empty() {
                    "no files".to_string()
                } else {
                    context.files.join(", ")
                }
            ),
        )
        .await;

        let patch = match self
            .codegen
            .request_repair(&signal.error_text, &context.text, &ctx.attempt.repair_context())
            .await
        {
            Ok(patch) => patch,
            Err(e) => return Ok(Event::PatchRejected { error: e.to_string() }),
        };

        match apply_patch_text(ctx.workspace, &patch).await {
            Ok(report) => {
                for (path, reason) in report.failed.iter().chain(report.skipped.iter()) {
                    self.log(
                        run_id,
                        "repair",
                        Severity::Warn,
                        &format!("{}: {}", path, reason),
                    )
                    .await;
                }
                Ok(Event::PatchApplied {
                    summary: format!("{} [{}]", report.summary(), report.touched().join(", ")),
                })
            }
            Err(PatchError::Write(e)) => Err(e.into()),
            Err(e) => {
                let error = e.to_string();
                ctx.attempt.note_rejected_patch(&error);
                Ok(Event::PatchRejected { error })
            }
        }
    }
}

fn last_line(text: &str) -> &str {
    text.trim().lines().last().unwrap_or("")
}
