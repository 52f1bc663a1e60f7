//! Generator contract

use async_trait::async_trait;
use kiln_core::{KilnError, Result};
use std::collections::VecDeque;
use std::sync::Mutex;

/// One completion request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub model: String,
    pub system: String,
    pub user: String,
    pub max_tokens: u32,
}

/// Anything that turns instructions plus content into raw text.
///
/// No structure is promised for the returned text.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn complete(&self, request: &GenerationRequest) -> Result<String>;
}

/// Generator that replays queued answers and records every request
#[derive(Default)]
pub struct ScriptedGenerator {
    responses: Mutex<VecDeque<std::result::Result<String, String>>>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful answer
    pub fn with_response(self, text: impl Into<String>) -> Self {
        self.push(Ok(text.into()));
        self
    }

    /// Queue a transport failure
    pub fn with_failure(self, message: impl Into<String>) -> Self {
        self.push(Err(message.into()));
        self
    }

    pub fn push(&self, response: std::result::Result<String, String>) {
        if let Ok(mut queue) = self.responses.lock() {
            queue.push_back(response);
        }
    }

    /// Requests seen so far, oldest first
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn remaining(&self) -> usize {
        self.responses.lock().map(|q| q.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn complete(&self, request: &GenerationRequest) -> Result<String> {
        if let Ok(mut seen) = self.requests.lock() {
            seen.push(request.clone());
        }
        let next = self
            .responses
            .lock()
            .map_err(|_| KilnError::Generator("scripted generator poisoned".to_string()))?
            .pop_front();
        match next {
            Some(Ok(text)) => Ok(text),
            Some(Err(message)) => Err(KilnError::Generator(message)),
            None => Err(KilnError::Generator("no scripted response left".to_string())),
        }
    }
}
