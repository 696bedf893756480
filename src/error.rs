// =============================================================================
// Engine error kinds
// =============================================================================
//
// The seven kinds the core distinguishes. Transient broker failures are
// retryable and never cause a trade state transition; permanent broker
// failures move the trade to CANCELLED (entry) or ERROR (exit).
// InvariantViolation signals a bug: the operation aborts and the scheduler
// escalates after three consecutive occurrences in the same loop.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Alert malformed or missing required fields. Surfaced to the caller,
    /// never persisted as an ERROR state.
    #[error("validation error: {0}")]
    Validation(String),

    /// Webhook secret mismatch.
    #[error("authentication failed")]
    Auth,

    /// A risk gate predicate failed. Carries the stable reason code.
    #[error("gate rejection: {0}")]
    GateRejection(String),

    /// The contract selector found no liquid contract.
    #[error("no liquid contract for {underlying} {direction}")]
    NoLiquidContract {
        underlying: String,
        direction: String,
    },

    /// Network failure, 5xx, or rate-limit from the broker. Retryable.
    #[error("transient broker error: {0}")]
    TransientBroker(String),

    /// The broker rejected or expired the order. Not retryable.
    #[error("permanent broker error: {0}")]
    PermanentBroker(String),

    /// An illegal state transition was attempted.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error(transparent)]
    Store(#[from] sqlx::Error),
}

impl EngineError {
    /// True for failures worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientBroker(_))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
