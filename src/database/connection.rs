use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::info;

use crate::config::PagingConfig;
use crate::error::{EngineError, Result};

/// Owns the engine's connection pool.
#[derive(Debug, Clone)]
pub struct DatabaseConnection {
    pool: PgPool,
}

impl DatabaseConnection {
    /// Connect using the database section of `config`.
    pub async fn new(config: &PagingConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.database.pool)
            .acquire_timeout(config.database.checkout_timeout())
            .connect(&config.database_url())
            .await
            .map_err(|e| EngineError::database("connect", e))?;

        info!(
            database = %config.database.database_name(&config.environment),
            pool = config.database.pool,
            "🗄️ DATABASE: pool connected"
        );

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<bool> {
        let row = sqlx::query("SELECT 1 as health")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| EngineError::database("health check", e))?;

        let health: i32 = row.get("health");
        Ok(health == 1)
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}
