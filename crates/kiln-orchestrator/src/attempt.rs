use kiln_agent::{RepairContext, UPDATE_FILE};

/// What one attempt knows about the ones before it.
///
/// Threaded through repair requests instead of editing prompt text in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptContext {
    pub attempt: u32,
    pub max_attempts: u32,
    /// Error text of the latest failed execution
    pub latest_error: Option<String>,
    /// Error text of the failed execution before the latest one
    pub previous_error: Option<String>,
    /// Instructions accumulated from rejected patches, oldest first
    pub corrective_notes: Vec<String>,
}

impl AttemptContext {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            latest_error: None,
            previous_error: None,
            corrective_notes: Vec::new(),
        }
    }

    /// Enter `attempt`. Notes carry over; they describe the repair channel, not the code.
    pub fn begin(&mut self, attempt: u32) {
        self.attempt = attempt;
    }

    pub fn remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt)
    }

    pub fn record_failure(&mut self, error_text: impl Into<String>) {
        self.previous_error = self.latest_error.replace(error_text.into());
    }

    /// What a repair request for the current attempt should know
    pub fn repair_context(&self) -> RepairContext<'_> {
        RepairContext {
            attempt: self.attempt,
            max_attempts: self.max_attempts,
            remaining: self.remaining(),
            previous_error: self.previous_error.as_deref(),
            notes: &self.corrective_notes,
        }
    }

    /// Add a note unless an identical one is already present
    pub fn add_note(&mut self, note: impl Into<String>) {
        let note = note.into();
        if !self.corrective_notes.contains(&note) {
            self.corrective_notes.push(note);
        }
    }

    /// Note for a patch that could not be applied
    pub fn note_rejected_patch(&mut self, error: &str) {
        self.add_note(format!(
            "Your previous patch was rejected ({}). Use '{} <path>' sections with paths exactly as labelled in the context.",
            error, UPDATE_FILE
        ));
    }
}
