//! Failure kinds raised by the match engine.
//!
//! Application plumbing (files, JSON, configuration) goes through [`anyhow`]. The kinds below are
//! the ones the scheduler needs to tell apart, so they get their own type. An [`EngineError`]
//! wrapped in an [`anyhow::Error`] can be recovered with `downcast_ref`.

use std::time::Duration;

use thiserror::Error;

/// Errors produced by a [`WorkerEngine`](crate::worker::WorkerEngine) or while resolving agents.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    /// The worker never signalled `Ready` within the startup timeout.
    #[error("worker did not become ready within {0:?}")]
    StartupTimeout(Duration),
    /// The worker context died (panicked or dropped its channels).
    #[error("worker crashed: {0}")]
    WorkerCrashed(String),
    /// No match result arrived within the match timeout.
    #[error("match did not finish within {0:?}")]
    MatchTimeout(Duration),
    /// The agent provider has no agent with this id.
    #[error("agent '{0}' not found")]
    AgentNotFound(String),
    /// A message arrived on a channel where it is not allowed.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// The match was stopped by a cancellation before it ended.
    #[error("match cancelled")]
    MatchCancelled,
}

impl EngineError {
    /// Errors the scheduler records as an inconclusive or skipped match and then moves on.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::MatchTimeout(_) | EngineError::AgentNotFound(_)
        )
    }
}
