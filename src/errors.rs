//! Engine error taxonomy
//!
//! Stable error kinds surfaced to callers. Storage errors carry the rusqlite
//! cause; everything else maps one-to-one to a business failure mode.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("member {0} not found")]
    MemberNotFound(i64),

    /// Placement could not resolve a parent because the introducer id does
    /// not exist. Never silently defaults to root placement.
    #[error("placement parent not found for introducer {0}")]
    ParentNotFound(i64),

    #[error("introducer {0} not found while crediting direct commission")]
    IntroducerNotFound(i64),

    #[error("plan {0} not found")]
    PlanNotFound(i64),

    #[error("payment transaction '{0}' not found")]
    TransactionNotFound(String),

    #[error("withdrawal request {0} not found")]
    WithdrawalNotFound(i64),

    /// Re-activation attempt for a member that already activated a plan.
    #[error("member {0} is already activated")]
    AlreadyActivated(i64),

    /// A payment transaction or withdrawal request was already settled.
    #[error("record already processed: {0}")]
    AlreadyProcessed(String),

    #[error("insufficient balance: have {available:.2}, need {required:.2}")]
    InsufficientBalance { available: f64, required: f64 },

    /// Bounded internal retries on a busy store were exhausted.
    #[error("storage busy after {attempts} attempts")]
    ConcurrencyConflict { attempts: u32 },

    /// Data-corruption class failure (occupied slot where an empty one was
    /// expected, cycle in the tree, ...). Aborts the operation.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    /// True when the underlying storage reported busy/locked, i.e. the
    /// operation may succeed on retry.
    pub fn is_busy(&self) -> bool {
        match self {
            EngineError::Storage(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}
