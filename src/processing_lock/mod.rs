//! # Processing Locks
//!
//! Versioned, cross-process exclusive transactions per engine module.
//!
//! A locked transaction first takes a shared, non-blocking advisory lock on
//! the global migration key (a running migration holds it exclusively), then
//! row-locks the module's entry in `engine_processing_versions` with
//! `FOR UPDATE NOWAIT` and compares the stored version to the one this binary
//! was built for. Any of those failing yields [`EngineError::NoLock`]: the
//! caller should simply try again next cycle.
//!
//! Two instances built for different versions of the same module can never
//! process it at the same time, which makes in-place schema changes safe.

pub mod conn;
pub mod module;
pub mod state;

pub use conn::LockConn;
pub use module::Updatable;
pub use state::{merge_state, ModuleState};

use std::fmt;
use std::panic::AssertUnwindSafe;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgArguments, PgQueryResult};
use sqlx::query::Query;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use tracing::{debug, error, instrument};

use crate::constants::advisory_locks::GLOBAL_MIGRATE;
use crate::error::{is_lock_not_available, panic_message, EngineError, Result};

/// Engine modules that take a processing lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    Compat,
    Rotation,
    Schedule,
    Escalation,
    NpCycle,
    StatusUpdate,
    Verify,
    Heartbeat,
    Cleanup,
    Metrics,
    Signals,
    Message,
}

impl LockType {
    pub const ALL: [LockType; 12] = [
        Self::Compat,
        Self::Rotation,
        Self::Schedule,
        Self::Escalation,
        Self::NpCycle,
        Self::StatusUpdate,
        Self::Verify,
        Self::Heartbeat,
        Self::Cleanup,
        Self::Metrics,
        Self::Signals,
        Self::Message,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compat => "compat",
            Self::Rotation => "rotation",
            Self::Schedule => "schedule",
            Self::Escalation => "escalation",
            Self::NpCycle => "np_cycle",
            Self::StatusUpdate => "status_update",
            Self::Verify => "verify",
            Self::Heartbeat => "heartbeat",
            Self::Cleanup => "cleanup",
            Self::Metrics => "metrics",
            Self::Signals => "signals",
            Self::Message => "message",
        }
    }
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LockType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("Invalid lock type: {s}"))
    }
}

/// Module identity plus the schema version this binary expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockConfig {
    pub lock_type: LockType,
    pub version: i32,
}

impl LockConfig {
    pub const fn new(lock_type: LockType, version: i32) -> Self {
        Self { lock_type, version }
    }
}

/// Starts locked transactions for one module.
#[derive(Debug, Clone)]
pub struct ProcessingLock {
    pool: PgPool,
    cfg: LockConfig,
}

impl ProcessingLock {
    /// Create a lock for `cfg`.
    ///
    /// A stored version that differs from `cfg.version` is logged but not an
    /// error: the module is disabled on this instance while the rest of the
    /// engine keeps running.
    #[instrument(skip(pool), fields(lock_type = %cfg.lock_type, version = cfg.version))]
    pub async fn new(pool: PgPool, cfg: LockConfig) -> Result<Self> {
        let stored = read_version(&pool, cfg.lock_type).await?;
        if stored != cfg.version {
            error!(
                lock_type = %cfg.lock_type,
                expected = cfg.version,
                got = stored,
                "engine module disabled: version mismatch"
            );
        }

        Ok(Self { pool, cfg })
    }

    pub fn config(&self) -> LockConfig {
        self.cfg
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Open a transaction holding this module's lock.
    pub async fn begin_tx(&self) -> Result<Transaction<'static, Postgres>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| EngineError::database("begin transaction", e))?;
        acquire(&mut *tx, self.cfg).await?;
        Ok(tx)
    }

    /// Run `f` in a locked transaction, committing on `Ok`.
    ///
    /// Errors and panics inside `f` roll the transaction back; a panic is
    /// returned as [`EngineError::Panic`].
    pub async fn with_tx<T, F>(&self, f: F) -> Result<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T>> + Send,
    {
        let tx = self.begin_tx().await?;
        run_in_tx(tx, self.cfg.lock_type, f).await
    }

    /// Execute a single statement in a locked transaction.
    pub async fn exec<'q>(&self, query: Query<'q, Postgres, PgArguments>) -> Result<PgQueryResult> {
        let mut tx = self.begin_tx().await?;
        let res = query
            .execute(&mut *tx)
            .await
            .map_err(|e| EngineError::database("locked exec", e))?;
        tx.commit()
            .await
            .map_err(|e| EngineError::database("commit", e))?;
        Ok(res)
    }

    /// Lease a single connection bound to this lock.
    pub async fn conn(&self) -> Result<LockConn> {
        let conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| EngineError::database("acquire connection", e))?;
        Ok(LockConn::new(conn, self.cfg))
    }
}

async fn read_version(pool: &PgPool, lock_type: LockType) -> Result<i32> {
    sqlx::query_scalar::<_, i32>("SELECT version FROM engine_processing_versions WHERE type_id = $1")
        .bind(lock_type.as_str())
        .fetch_one(pool)
        .await
        .map_err(|e| EngineError::database("read module version", e))
}

/// Take the migrate and module locks inside an open transaction.
pub(crate) async fn acquire(conn: &mut PgConnection, cfg: LockConfig) -> Result<()> {
    let got_migrate_lock =
        sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_xact_lock_shared($1)")
            .bind(GLOBAL_MIGRATE)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| EngineError::database("acquire shared migrate lock", e))?;
    if !got_migrate_lock {
        debug!(lock_type = %cfg.lock_type, "migration in progress");
        return Err(EngineError::NoLock);
    }

    let stored = sqlx::query_scalar::<_, i32>(
        "SELECT version FROM engine_processing_versions WHERE type_id = $1 FOR UPDATE NOWAIT",
    )
    .bind(cfg.lock_type.as_str())
    .fetch_one(&mut *conn)
    .await;

    match stored {
        Ok(version) if version == cfg.version => Ok(()),
        Ok(_) => Err(EngineError::NoLock),
        Err(e) if is_lock_not_available(&e) => Err(EngineError::NoLock),
        Err(e) => Err(EngineError::database("acquire module lock", e)),
    }
}

/// Run `f` against `tx` and commit, rolling back on error or panic.
pub(crate) async fn run_in_tx<T, F>(
    mut tx: Transaction<'_, Postgres>,
    lock_type: LockType,
    f: F,
) -> Result<T>
where
    F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T>>,
{
    let outcome = AssertUnwindSafe(f(&mut *tx)).catch_unwind().await;

    match outcome {
        Ok(Ok(value)) => {
            tx.commit()
                .await
                .map_err(|e| EngineError::database("commit", e))?;
            Ok(value)
        }
        Ok(Err(err)) => {
            rollback(tx, lock_type).await;
            Err(err)
        }
        Err(payload) => {
            rollback(tx, lock_type).await;
            Err(EngineError::Panic {
                component: lock_type.to_string(),
                message: panic_message(payload.as_ref()),
            })
        }
    }
}

async fn rollback(tx: Transaction<'_, Postgres>, lock_type: LockType) {
    if let Err(e) = tx.rollback().await {
        debug!(lock_type = %lock_type, error = %e, "rollback failed");
    }
}
