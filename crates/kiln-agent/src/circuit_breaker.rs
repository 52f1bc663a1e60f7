//! Circuit breaker shared by all requests to one generator endpoint
//!
//! Retryable responses (429, 5xx) are handled by backoff in the client. Only
//! requests that fail for good are counted here; once `threshold` of them
//! happen in a row the endpoint is refused until `cooldown` has elapsed.

use kiln_core::{KilnError, Result};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow normally
    Closed,
    /// Requests are refused without contacting the endpoint
    Open,
    /// Cooldown elapsed; the next request decides
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    consecutive_failures: AtomicU32,
    last_failure_ms: AtomicU64,
    threshold: u32,
    cooldown: Duration,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            last_failure_ms: AtomicU64::new(0),
            threshold,
            cooldown,
        }
    }

    pub fn state(&self) -> CircuitState {
        if self.consecutive_failures.load(Ordering::Relaxed) < self.threshold {
            return CircuitState::Closed;
        }
        if self.elapsed_since_failure() >= self.cooldown {
            CircuitState::HalfOpen
        } else {
            CircuitState::Open
        }
    }

    /// `Err` while the circuit is open
    pub fn check(&self) -> Result<()> {
        match self.state() {
            CircuitState::Open => Err(KilnError::Generator(format!(
                "circuit open after {} consecutive failures, retry in {}s",
                self.failure_count(),
                self.retry_in().as_secs()
            ))),
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
        }
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        self.last_failure_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Time until an open circuit goes half-open; zero otherwise
    pub fn retry_in(&self) -> Duration {
        match self.state() {
            CircuitState::Open => self.cooldown.saturating_sub(self.elapsed_since_failure()),
            _ => Duration::ZERO,
        }
    }

    fn elapsed_since_failure(&self) -> Duration {
        let last = self.last_failure_ms.load(Ordering::Relaxed);
        Duration::from_millis(now_ms().saturating_sub(last))
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(60))
    }
}
