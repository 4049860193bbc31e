use async_trait::async_trait;

use super::LockType;
use crate::error::Result;

/// An engine module run once per cycle.
///
/// Implementations take their own processing lock inside `update_all` and
/// return [`EngineError::NoLock`](crate::error::EngineError::NoLock) when
/// another instance holds it.
#[async_trait]
pub trait Updatable: Send + Sync {
    fn name(&self) -> &str;

    fn lock_type(&self) -> LockType;

    async fn update_all(&self) -> Result<()>;
}
