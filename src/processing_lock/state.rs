use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sqlx::PgConnection;

use super::LockType;
use crate::error::{EngineError, Result};

/// Small JSON state persisted per module next to its lock version.
///
/// Must be used on a connection that already holds the module's processing
/// lock. Saving merges into the stored document, so fields written by a
/// newer or older version of the module survive.
#[derive(Debug, Clone, Copy)]
pub struct ModuleState {
    lock_type: LockType,
}

impl ModuleState {
    pub fn new(lock_type: LockType) -> Self {
        Self { lock_type }
    }

    /// Raw stored document; `{}` when nothing was saved yet.
    pub async fn load_raw(&self, conn: &mut PgConnection) -> Result<Value> {
        let stored = sqlx::query_scalar::<_, Option<Value>>(
            "SELECT state FROM engine_processing_versions WHERE type_id = $1",
        )
        .bind(self.lock_type.as_str())
        .fetch_one(conn)
        .await
        .map_err(|e| EngineError::database("load module state", e))?;

        Ok(stored.unwrap_or_else(|| Value::Object(Default::default())))
    }

    pub async fn load<T>(&self, conn: &mut PgConnection) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let raw = self.load_raw(conn).await?;
        serde_json::from_value(raw)
            .map_err(|e| EngineError::State(format!("decode {} state: {e}", self.lock_type)))
    }

    pub async fn save<T>(&self, conn: &mut PgConnection, state: &T) -> Result<()>
    where
        T: Serialize + Sync,
    {
        let new = serde_json::to_value(state)
            .map_err(|e| EngineError::State(format!("encode {} state: {e}", self.lock_type)))?;
        let old = self.load_raw(&mut *conn).await?;

        sqlx::query("UPDATE engine_processing_versions SET state = $2 WHERE type_id = $1")
            .bind(self.lock_type.as_str())
            .bind(merge_state(old, new))
            .execute(conn)
            .await
            .map_err(|e| EngineError::database("save module state", e))?;
        Ok(())
    }
}

/// Recursively merge `new` into `old`.
///
/// Objects merge key by key with `new` winning; keys only present in `old`
/// are kept. Any other value in `new` replaces the old one outright.
pub fn merge_state(old: Value, new: Value) -> Value {
    match (old, new) {
        (Value::Object(mut old), Value::Object(new)) => {
            for (key, value) in new {
                let merged = match old.remove(&key) {
                    Some(existing) => merge_state(existing, value),
                    None => value,
                };
                old.insert(key, merged);
            }
            Value::Object(old)
        }
        (_, new) => new,
    }
}
