//! Error taxonomy for the session pool
//!
//! Every failure surfaced to a caller is classified into one of these
//! variants first; raw transport errors never leak out of the crate.
//! Connection-class failures and command timeouts are retryable at the
//! pool level (another session may work); application-level command
//! errors are not.

use std::time::Duration;

/// Errors produced by the session pool and the device client boundary
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Connecting, logging in, or probing the device failed.
    /// Retryable: a fresh session may succeed.
    #[error("connection to {endpoint} failed: {reason}")]
    Connection { endpoint: String, reason: String },

    /// A single command exceeded its time budget.
    /// Retryable: the session is assumed usable, the command is not.
    #[error("command '{command}' timed out after {timeout:?}")]
    CommandTimeout { command: String, timeout: Duration },

    /// The device returned an application-level failure (trap).
    /// Never retried: this is not a connectivity problem.
    #[error("device rejected command: {0}")]
    Command(String),

    /// No session became available within the caller's budget
    #[error("no session became available within {0:?}")]
    AcquireTimeout(Duration),

    /// The circuit breaker is open and its cooldown has not elapsed
    #[error("circuit breaker is open, retry in {retry_in:?}")]
    CircuitOpen { retry_in: Duration },

    /// The pool is configured with no session capacity
    #[error("pool has no session capacity")]
    PoolExhausted,

    /// The pool is shutting down; queued requests are rejected
    #[error("pool is shutting down")]
    ShuttingDown,

    /// Invalid pool configuration
    #[error("invalid configuration: {field}: {reason}")]
    Config { field: &'static str, reason: String },
}

impl Error {
    /// Whether the pool may transparently retry the failed operation
    /// on another (possibly fresh) session.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Connection { .. } | Error::CommandTimeout { .. }
        )
    }

    /// Build a connection-class error
    pub fn connection(endpoint: impl Into<String>, reason: impl ToString) -> Self {
        Error::Connection {
            endpoint: endpoint.into(),
            reason: reason.to_string(),
        }
    }
}

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, Error>;
