#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Paging Core
//!
//! Notification dispatch engine for an on-call alerting platform.
//!
//! ## Overview
//!
//! Every few seconds the engine runs a cycle: each registered module
//! (escalation, rotation, heartbeat, ...) runs under its own cross-process
//! processing lock, then the message phase turns pending outgoing messages
//! into provider sends. That phase deduplicates and bundles the backlog,
//! orders it by priority, and applies per-destination throttles and
//! per-type rate limits before fanning out to bounded worker pools.
//!
//! All shared state lives in PostgreSQL. Only one instance sends at a time
//! (global advisory lock) and no two instances run the same module at once
//! (versioned row lock per module).
//!
//! ## Module Organization
//!
//! - [`engine`] - Cycle scheduler, cycle monitor, pause/resume/shutdown lifecycle
//! - [`processing_lock`] - Versioned per-module locked transactions
//! - [`message`] - Message model, queue, throttles, dedup/bundle, send pipeline
//! - [`database`] - Pool construction and migrations
//! - [`config`] - YAML configuration with per-environment overrides
//! - [`retry`] - Retry policies for temporary failures
//! - [`error`] - Structured error handling
//! - [`logging`] - Structured console and file logging
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use paging_core::config::ConfigManager;
//! use paging_core::database::DatabaseConnection;
//! use paging_core::engine::Engine;
//! use paging_core::message::{MessageSender, StatusFetcher};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(
//! #     sender: Arc<dyn MessageSender>,
//! #     fetcher: Arc<dyn StatusFetcher>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! paging_core::logging::init_structured_logging();
//!
//! let config = ConfigManager::load()?;
//! let db = DatabaseConnection::new(config.config()).await?;
//! let engine = Engine::connect(db.pool().clone(), config.config(), Vec::new(), sender, fetcher).await?;
//!
//! let token = CancellationToken::new();
//! engine.run(&token).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod database;
pub mod engine;
pub mod error;
pub mod logging;
pub mod message;
pub mod processing_lock;
pub mod retry;

pub use config::{ConfigManager, PagingConfig};
pub use engine::{CycleMonitor, Engine, LifecycleManager, LifecycleState, MessageDispatch};
pub use error::{EngineError, Result, SendError};
pub use message::{Message, MessageDb, MessageStatus, Queue, Throttle};
pub use processing_lock::{LockConfig, LockType, ProcessingLock, Updatable};
pub use retry::{retry_temporary, RetryPolicy};
