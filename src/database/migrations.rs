//! # Schema Migrations
//!
//! Applies the timestamp-named SQL files under `migrations/`
//! (`YYYYMMDDHHMMSS_description.sql`) in order, recording each applied
//! version in `paging_schema_migrations`.
//!
//! The runner holds the global migrate advisory lock exclusively for the
//! whole run. Every processing lock takes that key shared, so no engine
//! module on any instance can run while a migration is being applied.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use sqlx::{PgConnection, Row};
use tracing::{debug, info};

use crate::constants::advisory_locks::GLOBAL_MIGRATE;
use crate::error::{EngineError, Result};

/// Represents a single database migration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    /// Version timestamp (YYYYMMDDHHMMSS format)
    pub version: String,
    /// Human-readable migration name
    pub name: String,
    pub path: PathBuf,
}

/// Discovers and applies migrations from one directory.
#[derive(Debug, Clone)]
pub struct DatabaseMigrations {
    dir: PathBuf,
}

impl Default for DatabaseMigrations {
    fn default() -> Self {
        Self::new(default_migrations_dir())
    }
}

impl DatabaseMigrations {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Apply every migration not yet recorded. Returns the versions applied.
    pub async fn run_all(&self, conn: &mut PgConnection) -> Result<Vec<String>> {
        let migrations = self.discover()?;

        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(GLOBAL_MIGRATE)
            .execute(&mut *conn)
            .await
            .map_err(|e| EngineError::database("acquire migrate lock", e))?;

        let res = apply_outstanding(conn, &migrations).await;

        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(GLOBAL_MIGRATE)
            .execute(&mut *conn)
            .await
            .map_err(|e| EngineError::database("release migrate lock", e))?;

        res
    }

    /// All migration files in the directory, keyed and ordered by version.
    pub fn discover(&self) -> Result<BTreeMap<String, Migration>> {
        let mut migrations = BTreeMap::new();
        if !self.dir.exists() {
            return Ok(migrations);
        }

        let entries = fs::read_dir(&self.dir)
            .map_err(|e| EngineError::Configuration(format!("read {}: {e}", self.dir.display())))?;
        for entry in entries {
            let path = entry
                .map_err(|e| EngineError::Configuration(format!("read migration entry: {e}")))?
                .path();

            if !path.is_file() || path.extension().and_then(|ext| ext.to_str()) != Some("sql") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Some((version, name)) = parse_migration_filename(stem) {
                migrations.insert(
                    version.clone(),
                    Migration {
                        version,
                        name,
                        path,
                    },
                );
            }
        }

        Ok(migrations)
    }
}

async fn apply_outstanding(
    conn: &mut PgConnection,
    migrations: &BTreeMap<String, Migration>,
) -> Result<Vec<String>> {
    sqlx::raw_sql(
        r#"
        CREATE TABLE IF NOT EXISTS paging_schema_migrations (
            version VARCHAR(14) PRIMARY KEY,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
    "#,
    )
    .execute(&mut *conn)
    .await
    .map_err(|e| EngineError::database("create migration table", e))?;

    let applied: HashSet<String> = sqlx::query("SELECT version FROM paging_schema_migrations")
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| EngineError::database("list applied migrations", e))?
        .into_iter()
        .map(|row| row.get::<String, _>("version"))
        .collect();

    let mut newly_applied = Vec::new();
    for migration in migrations.values() {
        if applied.contains(&migration.version) {
            debug!(version = %migration.version, "migration already applied");
            continue;
        }

        info!(
            version = %migration.version,
            name = %migration.name,
            "🗄️ DATABASE: applying migration"
        );
        apply_one(conn, migration).await?;
        newly_applied.push(migration.version.clone());
    }

    Ok(newly_applied)
}

async fn apply_one(conn: &mut PgConnection, migration: &Migration) -> Result<()> {
    let sql = fs::read_to_string(&migration.path).map_err(|e| {
        EngineError::Configuration(format!("read {}: {e}", migration.path.display()))
    })?;

    let mut tx = sqlx::Connection::begin(&mut *conn)
        .await
        .map_err(|e| EngineError::database("begin migration", e))?;
    sqlx::raw_sql(&sql)
        .execute(&mut *tx)
        .await
        .map_err(|e| EngineError::database(format!("migration {}", migration.version), e))?;
    sqlx::query("INSERT INTO paging_schema_migrations (version) VALUES ($1)")
        .bind(&migration.version)
        .execute(&mut *tx)
        .await
        .map_err(|e| EngineError::database("record migration", e))?;
    tx.commit()
        .await
        .map_err(|e| EngineError::database("commit migration", e))
}

fn default_migrations_dir() -> PathBuf {
    std::env::var("CARGO_MANIFEST_DIR")
        .map(|dir| PathBuf::from(dir).join("migrations"))
        .unwrap_or_else(|_| PathBuf::from("migrations"))
}

/// Split `YYYYMMDDHHMMSS_migration_name` into version and readable name.
fn parse_migration_filename(filename: &str) -> Option<(String, String)> {
    if filename.len() < 15 || !filename.is_char_boundary(14) {
        return None;
    }

    let (version_part, name_part) = filename.split_at(14);
    if !version_part.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let name = name_part
        .strip_prefix('_')
        .unwrap_or(name_part)
        .replace('_', " ");
    Some((version_part.to_string(), name))
}
