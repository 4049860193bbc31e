use futures::future::BoxFuture;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgArguments, PgQueryResult};
use sqlx::query::Query;
use sqlx::{Connection, PgConnection, Postgres};
use tokio::sync::Mutex;
use tracing::debug;

use super::{acquire, run_in_tx, LockConfig};
use crate::constants::advisory_locks::LOCK_POLL_INTERVAL;
use crate::error::{EngineError, Result};

/// A single pooled connection bound to a processing lock.
///
/// Session-level advisory locks live on one backend connection, so work that
/// must happen while such a lock is held goes through this type. Calls are
/// serialized on the connection.
///
/// Once a session advisory lock has been taken the connection is closed on
/// drop instead of returning to the pool, so a lock can never leak to
/// another user of the pool.
#[derive(Debug)]
pub struct LockConn {
    cfg: LockConfig,
    conn: Mutex<Option<PoolConnection<Postgres>>>,
}

impl LockConn {
    pub(crate) fn new(conn: PoolConnection<Postgres>, cfg: LockConfig) -> Self {
        Self {
            cfg,
            conn: Mutex::new(Some(conn)),
        }
    }

    /// Execute a single statement in a locked transaction on this connection.
    pub async fn exec<'q>(&self, query: Query<'q, Postgres, PgArguments>) -> Result<PgQueryResult> {
        let mut guard = self.conn.lock().await;
        let conn = live(&mut guard)?;

        let mut tx = conn
            .begin()
            .await
            .map_err(|e| EngineError::database("begin transaction", e))?;
        acquire(&mut *tx, self.cfg).await?;
        let res = query
            .execute(&mut *tx)
            .await
            .map_err(|e| EngineError::database("locked exec", e))?;
        tx.commit()
            .await
            .map_err(|e| EngineError::database("commit", e))?;
        Ok(res)
    }

    /// Run `f` in a locked transaction on this connection.
    pub async fn with_tx<T, F>(&self, f: F) -> Result<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T>> + Send,
    {
        let mut guard = self.conn.lock().await;
        let conn = live(&mut guard)?;

        let mut tx = conn
            .begin()
            .await
            .map_err(|e| EngineError::database("begin transaction", e))?;
        acquire(&mut *tx, self.cfg).await?;
        run_in_tx(tx, self.cfg.lock_type, f).await
    }

    /// Execute a statement outside of any processing lock.
    pub async fn exec_without_lock<'q>(
        &self,
        query: Query<'q, Postgres, PgArguments>,
    ) -> Result<PgQueryResult> {
        let mut guard = self.conn.lock().await;
        let conn = live(&mut guard)?;
        query
            .execute(conn)
            .await
            .map_err(|e| EngineError::database("exec", e))
    }

    /// Wait until the session advisory lock `key` is held.
    ///
    /// Polls with `pg_try_advisory_lock` so that dropping the future never
    /// leaves a blocked query on the connection.
    pub async fn advisory_lock(&self, key: i64) -> Result<()> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_mut() {
            conn.close_on_drop();
        }
        let conn = live(&mut guard)?;
        loop {
            let locked = sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock($1)")
                .bind(key)
                .fetch_one(&mut *conn)
                .await
                .map_err(|e| EngineError::database("acquire advisory lock", e))?;
            if locked {
                debug!(key, "session advisory lock acquired");
                return Ok(());
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }
    }

    /// Release every session advisory lock held by this connection.
    pub async fn unlock_all(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        let conn = live(&mut guard)?;
        sqlx::query("SELECT pg_advisory_unlock_all()")
            .execute(conn)
            .await
            .map_err(|e| EngineError::database("release advisory locks", e))?;
        Ok(())
    }

    /// Give the connection up. Later calls fail with [`EngineError::ShuttingDown`].
    pub async fn close(&self) {
        self.conn.lock().await.take();
    }
}

fn live(slot: &mut Option<PoolConnection<Postgres>>) -> Result<&mut PgConnection> {
    slot.as_deref_mut().ok_or(EngineError::ShuttingDown)
}
