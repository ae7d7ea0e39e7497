//! Engine error taxonomy
//!
//! Every fallible engine operation returns [`DeliberationError`]. Timeout and
//! deadlock are not errors: they are terminations with their own reason
//! codes. Chain corruption is reported through
//! [`ChainVerificationReport`](crate::witness::ChainVerificationReport), never
//! raised, so partial damage stays inspectable.

use thiserror::Error;

use crate::panel::PoolError;
use crate::state::{LedgerError, SessionId, TranscriptError};
use crate::timeout::SchedulerError;

/// Result type alias for engine operations
pub type DeliberationResult<T> = Result<T, DeliberationError>;

/// Errors surfaced by the deliberation engine
#[derive(Debug, Error)]
pub enum DeliberationError {
    /// Fewer than three eligible jurors; assignment fails outright.
    #[error("juror pool exhausted: {available} eligible, {required} required")]
    PoolExhausted { available: usize, required: usize },

    /// An operation arrived out of order. Always surfaced, never swallowed.
    #[error("invalid transition in session {session_id}: {reason}")]
    InvalidTransition { session_id: SessionId, reason: String },

    /// The substitution budget was spent. The session is recorded as
    /// ABORTED before this is observed anywhere.
    #[error("substitution budget exceeded in session {session_id} after {failures} failures")]
    SubstitutionBudgetExceeded { session_id: SessionId, failures: u32 },

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("juror {juror_id} is not on the panel of session {session_id}")]
    JurorNotOnPanel {
        session_id: SessionId,
        juror_id: String,
    },

    #[error("juror {juror_id} already voted in round {round} of session {session_id}")]
    DuplicateVote {
        session_id: SessionId,
        juror_id: String,
        round: u32,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("transcript store error: {0}")]
    Transcript(#[from] TranscriptError),

    #[error("juror pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DeliberationError {
    /// Shorthand for [`DeliberationError::InvalidTransition`].
    pub fn invalid_transition(session_id: &str, reason: impl Into<String>) -> Self {
        Self::InvalidTransition {
            session_id: session_id.to_string(),
            reason: reason.into(),
        }
    }

    /// Machine-readable error code for logs and CLI output.
    pub fn code(&self) -> &'static str {
        match self {
            Self::PoolExhausted { .. } => "POOL_EXHAUSTED",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::SubstitutionBudgetExceeded { .. } => "SUBSTITUTION_BUDGET_EXCEEDED",
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::JurorNotOnPanel { .. } => "JUROR_NOT_ON_PANEL",
            Self::DuplicateVote { .. } => "DUPLICATE_VOTE",
            Self::InvalidConfig(_) => "INVALID_CONFIG",
            Self::Ledger(_) => "LEDGER",
            Self::Transcript(_) => "TRANSCRIPT",
            Self::Pool(_) => "POOL",
            Self::Scheduler(_) => "SCHEDULER",
            Self::Serialization(_) => "SERIALIZATION",
        }
    }
}
