//! Pure state machine for a run
//!
//! `transition(state, event) -> (state, actions)` with no I/O. The runner
//! performs the actions and feeds back the event each one produces.
//!
//! - Invalid transitions go to `Failed` (never panic)
//! - The attempt budget is checked before an attempt starts, so a run fails
//!   after exactly `max_attempts` failed attempts
//! - A rejected patch consumes an attempt like a failed execution does

use kiln_core::{RunStatus, Severity};

/// Run state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    Queued,
    /// Producing and writing the initial artifact
    Generating { max_attempts: u32 },
    /// Install, syntax check and launch for one attempt
    Verifying { attempt: u32, max_attempts: u32 },
    /// Waiting for a patch after `attempt` failed
    Repairing { attempt: u32, max_attempts: u32 },
    Succeeded { attempts: u32 },
    Failed { reason: String },
}

impl State {
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Succeeded { .. } | State::Failed { .. })
    }
}

/// Events that trigger transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Start { max_attempts: u32 },
    ArtifactReady { files: usize },
    GenerationFailed { error: String },
    /// The application is up and accepting connections
    AttemptPassed { address: String },
    AttemptFailed { stage: String, error: String },
    PatchApplied { summary: String },
    PatchRejected { error: String },
    /// A fault of the system itself, not of the generated code
    InternalError { message: String },
}

/// Side effects requested by a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    SetStatus(RunStatus),
    SetAttempts(u32),
    Log {
        stage: String,
        severity: Severity,
        message: String,
    },
    GenerateArtifact,
    RunAttempt { attempt: u32 },
    RequestRepair { attempt: u32 },
}

fn log(stage: &str, severity: Severity, message: impl Into<String>) -> Action {
    Action::Log {
        stage: stage.to_string(),
        severity,
        message: message.into(),
    }
}

/// Begin `attempt`, or fail if the budget is spent
fn start_attempt(attempt: u32, max_attempts: u32, mut actions: Vec<Action>) -> (State, Vec<Action>) {
    if attempt > max_attempts {
        return exhausted(attempt - 1, actions);
    }
    actions.push(Action::SetAttempts(attempt));
    actions.push(log(
        "run",
        Severity::Info,
        format!("Attempt {}/{}", attempt, max_attempts),
    ));
    actions.push(Action::RunAttempt { attempt });
    (
        State::Verifying {
            attempt,
            max_attempts,
        },
        actions,
    )
}

fn exhausted(attempts: u32, mut actions: Vec<Action>) -> (State, Vec<Action>) {
    let reason = format!("Attempt budget exhausted after {} attempts", attempts);
    actions.push(log("repair", Severity::Error, reason.clone()));
    actions.push(Action::SetStatus(RunStatus::Failed));
    (State::Failed { reason }, actions)
}

/// Pure state transition function
///
/// Takes current state and event, returns new state and actions to execute.
pub fn transition(state: State, event: Event) -> (State, Vec<Action>) {
    match (state, event) {
        (State::Queued, Event::Start { max_attempts }) => (
            State::Generating { max_attempts },
            vec![
                Action::SetStatus(RunStatus::Running),
                log("run", Severity::Info, "Run started"),
                Action::GenerateArtifact,
            ],
        ),

        (State::Generating { max_attempts }, Event::ArtifactReady { files }) => start_attempt(
            1,
            max_attempts,
            vec![log(
                "generate",
                Severity::Info,
                format!("Wrote {} generated files", files),
            )],
        ),

        (State::Generating { .. }, Event::GenerationFailed { error }) => {
            let reason = format!("Generation failed: {}", error);
            (
                State::Failed {
                    reason: reason.clone(),
                },
                vec![
                    log("generate", Severity::Error, reason),
                    Action::SetStatus(RunStatus::Failed),
                ],
            )
        }

        (State::Verifying { attempt, .. }, Event::AttemptPassed { address }) => (
            State::Succeeded { attempts: attempt },
            vec![
                log(
                    "done",
                    Severity::Info,
                    format!("Application running at {}", address),
                ),
                Action::SetStatus(RunStatus::Success),
            ],
        ),

        (
            State::Verifying {
                attempt,
                max_attempts,
            },
            Event::AttemptFailed { stage, error },
        ) => {
            let mut actions = vec![log(&stage, Severity::Error, error)];
            if attempt >= max_attempts {
                return exhausted(attempt, actions);
            }
            actions.push(log("repair", Severity::Info, "Requesting repair patch"));
            actions.push(Action::RequestRepair { attempt });
            (
                State::Repairing {
                    attempt,
                    max_attempts,
                },
                actions,
            )
        }

        (
            State::Repairing {
                attempt,
                max_attempts,
            },
            Event::PatchApplied { summary },
        ) => start_attempt(
            attempt + 1,
            max_attempts,
            vec![
                log("repair", Severity::Info, format!("Patch applied: {}", summary)),
                Action::SetStatus(RunStatus::Running),
            ],
        ),

        (
            State::Repairing {
                attempt,
                max_attempts,
            },
            Event::PatchRejected { error },
        ) => {
            let consumed = attempt + 1;
            let mut actions = vec![
                log("repair", Severity::Error, format!("Patch rejected: {}", error)),
                Action::SetAttempts(consumed),
            ];
            if consumed >= max_attempts {
                return exhausted(consumed, actions);
            }
            actions.push(log("repair", Severity::Info, "Requesting another patch"));
            actions.push(Action::RequestRepair { attempt: consumed });
            (
                State::Repairing {
                    attempt: consumed,
                    max_attempts,
                },
                actions,
            )
        }

        (state, Event::InternalError { message }) if !state.is_terminal() => (
            State::Failed {
                reason: message.clone(),
            },
            vec![
                log("fatal", Severity::Fatal, message),
                Action::SetStatus(RunStatus::Failed),
            ],
        ),

        // Terminal states accept nothing
        (state, event) if state.is_terminal() => (
            State::Failed {
                reason: format!("Invalid transition from {:?} on event {:?}", state, event),
            },
            vec![],
        ),

        (state, event) => {
            let reason = format!(
                "Invalid state transition: {:?} cannot handle event {:?}",
                state, event
            );
            (
                State::Failed {
                    reason: reason.clone(),
                },
                vec![
                    log("fatal", Severity::Fatal, reason),
                    Action::SetStatus(RunStatus::Failed),
                ],
            )
        }
    }
}
