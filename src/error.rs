//! Core error taxonomy.
//!
//! Every operation returns `Result<T, CoreError>`; nothing is coerced into
//! success and serialization failures are the only errors retried
//! transparently (see `db`). Messages never carry personally identifying
//! data.

use thiserror::Error;

/// PostgreSQL SQLSTATE codes for retryable errors
/// Reference: https://www.postgresql.org/docs/current/errcodes-appendix.html
mod pg_error_codes {
    // Class 40 — Transaction Rollback
    pub const SERIALIZATION_FAILURE: &str = "40001";
    pub const DEADLOCK_DETECTED: &str = "40P01";

    // Class 25 — Invalid Transaction State
    pub const ACTIVE_SQL_TRANSACTION: &str = "25001";

    // Class 23 — Integrity Constraint Violation (may indicate concurrent updates)
    pub const UNIQUE_VIOLATION: &str = "23505";
}

#[derive(Debug, Error)]
pub enum CoreError {
    // --- validation ---
    #[error("invalid ledger entry: {0}")]
    InvalidEntry(String),
    #[error("ledger transaction does not balance: sum of entries is {0} minor")]
    Unbalanced(i64),
    #[error("liquidity parameter {0} outside allowed band")]
    InvalidLiquidity(String),
    #[error("invalid share quantity: {0}")]
    InvalidShares(String),
    #[error("invalid outcome: {0}")]
    InvalidOutcome(String),

    // --- state ---
    #[error("market is not open for trading")]
    MarketNotOpen,
    #[error("market is closed")]
    MarketClosed,
    #[error("market is blocked: {0}")]
    MarketBlocked(String),
    #[error("market is not resolved")]
    MarketNotResolved,
    #[error("market already resolved")]
    AlreadyResolved,
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },
    #[error("insufficient funds: need {needed_minor} minor, have {available_minor}")]
    InsufficientFunds {
        needed_minor: i64,
        available_minor: i64,
    },
    #[error("insufficient {outcome} shares: need {needed}, have {held}")]
    InsufficientShares {
        outcome: &'static str,
        needed: String,
        held: String,
    },
    #[error("settlement would drive custody below zero by {shortfall_minor} minor")]
    SolvencyViolation { shortfall_minor: i64 },

    // --- concurrency ---
    #[error("idempotency key already claimed with no stored result")]
    Conflict,
    #[error("serialization failure persisted after {0} retries")]
    Serialization(u32),

    // --- freshness ---
    #[error("price moved: quoted {quoted_minor} minor, current {current_minor} minor")]
    PriceMoved {
        quoted_minor: i64,
        current_minor: i64,
    },
    #[error("quote expired")]
    QuoteExpired,
    #[error("quote signature invalid")]
    QuoteSignatureInvalid,

    // --- compliance ---
    #[error("forbidden: {0}")]
    Forbidden(String),

    // --- not found ---
    #[error("account {0} not found")]
    AccountNotFound(i64),
    #[error("market not found")]
    MarketNotFound,
    #[error("position not found")]
    PositionNotFound,
    #[error("trade {0} not found")]
    TradeNotFound(i64),
    #[error("ledger transaction not found")]
    TransactionNotFound,
    #[error("withdrawal {0} not found")]
    WithdrawalNotFound(i64),

    // --- external ---
    #[error("payment provider unavailable: {0}")]
    ProviderUnavailable(String),
    #[error("payment provider signature invalid")]
    ProviderSignatureInvalid,

    // --- internal ---
    #[error("domain error: {0}")]
    Domain(String),
    #[error("internal invariant broken: {0}")]
    InternalInvariantBroken(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("serialization of response failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl CoreError {
    /// Whether a fresh attempt of the enclosing transaction may succeed.
    /// Matches on SQLSTATE rather than message text.
    pub fn is_retryable(&self) -> bool {
        let CoreError::Database(sqlx_error) = self else {
            return false;
        };
        match sqlx_error {
            sqlx::Error::Database(db_error) => match db_error.code() {
                Some(code) => {
                    let retryable = matches!(
                        code.as_ref(),
                        pg_error_codes::SERIALIZATION_FAILURE
                            | pg_error_codes::DEADLOCK_DETECTED
                            | pg_error_codes::ACTIVE_SQL_TRANSACTION
                            | pg_error_codes::UNIQUE_VIOLATION
                    );
                    if retryable {
                        tracing::debug!(
                            sqlstate = code.as_ref(),
                            message = db_error.message(),
                            "detected retryable database error"
                        );
                    }
                    retryable
                }
                None => false,
            },
            _ => false,
        }
    }

    /// Fatal errors demand a high-severity alert and block further activity
    /// on the affected market.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CoreError::SolvencyViolation { .. } | CoreError::InternalInvariantBroken(_)
        )
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
