/// Kodo error types and retry utilities
use crate::engine::EngineError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main error type for kodo operations
#[derive(Debug, thiserror::Error)]
pub enum KodoError {
    /// Backend identifier not recognized
    #[error("Invalid backend: {0}. Must be 'local' or 'cluster'")]
    UnknownBackend(String),
    /// Caller-supplied option could not be parsed
    #[error("Error parsing {option}: {reason}")]
    InvalidOption { option: String, reason: String },
    /// Configuration file or environment override is malformed
    #[error("Configuration error: {0}")]
    Config(String),
    /// Non-retryable failure reported by the container engine or cluster API
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// Transient failures persisted past the attempt budget
    #[error("Exceeded retry limit ({attempts}) {operation}: {last}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last: EngineError,
    },
    /// Readiness wait ran past its deadline
    #[error("Pod '{name}' timed out after {timeout:?}")]
    ReadinessTimeout { name: String, timeout: Duration },
    /// Target reached an end state without ever becoming ready
    #[error("Pod '{name}' entered terminal phase '{phase}'")]
    TerminalPhase { name: String, phase: String },
    /// A name already assigned to another image in this runner
    #[error("Name '{name}' is already assigned to image '{existing}', refusing to reuse it for '{requested}'")]
    NameConflict {
        name: String,
        existing: String,
        requested: String,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapped anyhow error for compatibility
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, KodoError>;

/// Retry configuration for pod creation and file injection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 5_000,
            max_backoff_ms: 60_000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Calculates the exponential backoff for a zero-based attempt index,
/// capped at `max_backoff_ms`.
pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> u64 {
    (config.initial_backoff_ms as f64 * config.backoff_multiplier.powi(attempt as i32))
        .min(config.max_backoff_ms as f64) as u64
}

/// Progress through one retry loop.
#[derive(Debug, Clone)]
pub struct RetryState {
    pub attempt: u32,
    pub backoff: Duration,
    config: RetryConfig,
}

impl RetryState {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            attempt: 0,
            backoff: Duration::from_millis(calculate_backoff(0, config)),
            config: config.clone(),
        }
    }

    /// Attempt budget, never below one.
    pub fn budget(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    pub fn has_budget(&self) -> bool {
        self.attempt < self.budget()
    }

    /// Sleeps for the current delay, then doubles it up to the ceiling.
    pub async fn wait(&mut self) {
        tokio::time::sleep(self.backoff).await;
        self.advance();
    }

    pub fn advance(&mut self) {
        let next = calculate_backoff(self.attempt, &self.config);
        self.backoff = Duration::from_millis(next);
    }
}
