//! # Engine Error Types
//!
//! Structured error handling for the dispatch engine using thiserror.
//!
//! `EngineError::NoLock` is the expected, frequent outcome of lock contention
//! and is never reported as a failure by the engine loop.

use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::retry::Temporary;

/// SQLSTATE raised by `FOR UPDATE NOWAIT` when the row is already locked.
const LOCK_NOT_AVAILABLE: &str = "55P03";

/// Errors produced by a provider send or status call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("temporary send failure: {0}")]
    Temporary(String),

    #[error("send failure: {0}")]
    Permanent(String),
}

impl Temporary for SendError {
    fn is_temporary(&self) -> bool {
        matches!(self, SendError::Temporary(_))
    }
}

/// Comprehensive engine error types
#[derive(Error, Debug)]
pub enum EngineError {
    /// Lock contention, version mismatch, or a migration in progress.
    #[error("processing lock not acquired")]
    NoLock,

    #[error("aborted due to pause")]
    Aborted,

    #[error("database error: {operation}: {source}")]
    Database {
        operation: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("unknown cycle: {0}")]
    UnknownCycle(Uuid),

    #[error("operation canceled")]
    Canceled,

    #[error("timeout: {operation} did not finish within {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("panic in {component}: {message}")]
    Panic { component: String, message: String },

    #[error(transparent)]
    Send(#[from] SendError),

    #[error("module state error: {0}")]
    State(String),

    #[error("engine is shutting down")]
    ShuttingDown,

    #[error("engine loop already running")]
    AlreadyRunning,

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl EngineError {
    /// Wrap a sqlx error with the name of the failed operation.
    pub fn database(operation: impl Into<String>, source: sqlx::Error) -> Self {
        EngineError::Database {
            operation: operation.into(),
            source,
        }
    }

    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        EngineError::Timeout {
            operation: operation.into(),
            after,
        }
    }

    pub fn is_no_lock(&self) -> bool {
        matches!(self, EngineError::NoLock)
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, EngineError::Aborted)
    }

    /// SQLSTATE of the underlying database error, if any.
    pub fn sql_state(&self) -> Option<String> {
        match self {
            EngineError::Database { source, .. } => sql_state(source),
            _ => None,
        }
    }

    /// Class `40` (transaction rollback): serialization failures, deadlocks.
    pub fn is_transaction_failure(&self) -> bool {
        self.sql_state().is_some_and(|code| code.starts_with("40"))
    }
}

impl Temporary for EngineError {
    fn is_temporary(&self) -> bool {
        match self {
            EngineError::Database { source, .. } => is_temporary_sqlx(source),
            EngineError::Send(err) => err.is_temporary(),
            _ => false,
        }
    }
}

/// Extract the SQLSTATE code from a sqlx error.
pub fn sql_state(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db) => db.code().map(|c| c.into_owned()),
        _ => None,
    }
}

/// True when the error is `lock_not_available`, raised by `NOWAIT` row locks.
pub fn is_lock_not_available(err: &sqlx::Error) -> bool {
    sql_state(err).as_deref() == Some(LOCK_NOT_AVAILABLE)
}

/// Best-effort text of a caught panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn is_temporary_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db
            .code()
            .is_some_and(|code| code.starts_with("40") || code.starts_with("08")),
        _ => false,
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
