//! # Database
//!
//! Pool construction from [`PagingConfig`](crate::config::PagingConfig) and
//! the migration runner.
//!
//! ```rust,no_run
//! use paging_core::config::ConfigManager;
//! use paging_core::database::{DatabaseConnection, DatabaseMigrations};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConfigManager::load()?;
//! let db = DatabaseConnection::new(config.config()).await?;
//! let mut conn = db.pool().acquire().await?;
//! DatabaseMigrations::default().run_all(&mut conn).await?;
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod migrations;

pub use connection::DatabaseConnection;
pub use migrations::{DatabaseMigrations, Migration};
