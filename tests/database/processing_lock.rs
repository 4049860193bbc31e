use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::PgPool;

use paging_core::constants::advisory_locks::GLOBAL_MIGRATE;
use paging_core::processing_lock::{LockConfig, LockType, ModuleState, ProcessingLock};
use paging_core::EngineError;

async fn lock(pool: &PgPool, lock_type: LockType, version: i32) -> ProcessingLock {
    ProcessingLock::new(pool.clone(), LockConfig::new(lock_type, version))
        .await
        .expect("create processing lock")
}

#[sqlx::test(migrations = "./migrations")]
async fn test_only_matching_version_gets_the_lock(pool: PgPool) -> sqlx::Result<()> {
    let current = lock(&pool, LockType::Escalation, 1).await;
    let newer = lock(&pool, LockType::Escalation, 2).await;

    assert!(matches!(newer.begin_tx().await, Err(EngineError::NoLock)));

    let held = current.begin_tx().await.expect("matching version locks");
    assert!(matches!(newer.begin_tx().await, Err(EngineError::NoLock)));
    held.rollback().await?;

    assert!(matches!(newer.begin_tx().await, Err(EngineError::NoLock)));
    Ok(())
}

#[sqlx::test(migrations = "./migrations")]
async fn test_same_module_is_exclusive_across_holders(pool: PgPool) -> sqlx::Result<()> {
    let first = lock(&pool, LockType::Heartbeat, 1).await;
    let second = lock(&pool, LockType::Heartbeat, 1).await;
    let other_module = lock(&pool, LockType::Rotation, 1).await;

    let held = first.begin_tx().await.expect("first holder");
    assert!(matches!(second.begin_tx().await, Err(EngineError::NoLock)));

    // different module types never contend
    let rotation = other_module.begin_tx().await.expect("other module");
    rotation.rollback().await?;

    held.commit().await?;
    let again = second.begin_tx().await.expect("released after commit");
    again.rollback().await?;
    Ok(())
}

#[sqlx::test(migrations = "./migrations")]
async fn test_running_migration_blocks_every_module(pool: PgPool) -> sqlx::Result<()> {
    let mut migrator = pool.acquire().await?;
    sqlx::query("SELECT pg_advisory_lock($1)")
        .bind(GLOBAL_MIGRATE)
        .execute(&mut *migrator)
        .await?;

    let escalation = lock(&pool, LockType::Escalation, 1).await;
    assert!(matches!(escalation.begin_tx().await, Err(EngineError::NoLock)));

    sqlx::query("SELECT pg_advisory_unlock($1)")
        .bind(GLOBAL_MIGRATE)
        .execute(&mut *migrator)
        .await?;
    let tx = escalation.begin_tx().await.expect("lock after migration");
    tx.rollback().await?;
    Ok(())
}

#[sqlx::test(migrations = "./migrations")]
async fn test_panic_in_locked_tx_rolls_back(pool: PgPool) -> sqlx::Result<()> {
    let cleanup = lock(&pool, LockType::Cleanup, 1).await;
    let explode = true;

    let res: paging_core::Result<()> = cleanup
        .with_tx(move |conn| {
            Box::pin(async move {
                sqlx::query("UPDATE engine_processing_versions SET state = '{\"x\": 1}' WHERE type_id = 'cleanup'")
                    .execute(&mut *conn)
                    .await
                    .map_err(|e| EngineError::database("write", e))?;
                if explode {
                    panic!("cleanup exploded");
                }
                Ok(())
            })
        })
        .await;
    assert!(matches!(res, Err(EngineError::Panic { .. })));

    let state: serde_json::Value =
        sqlx::query_scalar("SELECT state FROM engine_processing_versions WHERE type_id = 'cleanup'")
            .fetch_one(&pool)
            .await?;
    assert_eq!(state, json!({}));
    Ok(())
}

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
struct HeartbeatState {
    #[serde(default)]
    last_run: Option<String>,
}

#[sqlx::test(migrations = "./migrations")]
async fn test_module_state_merges_unknown_fields(pool: PgPool) -> sqlx::Result<()> {
    sqlx::query(
        "UPDATE engine_processing_versions SET state = '{\"future_field\": true}' WHERE type_id = 'heartbeat'",
    )
    .execute(&pool)
    .await?;

    let heartbeat = lock(&pool, LockType::Heartbeat, 1).await;
    let state = ModuleState::new(LockType::Heartbeat);

    let loaded: HeartbeatState = heartbeat
        .with_tx(move |conn| {
            Box::pin(async move {
                state
                    .save(&mut *conn, &HeartbeatState { last_run: Some("now".into()) })
                    .await?;
                state.load(&mut *conn).await
            })
        })
        .await
        .expect("save and load state");
    assert_eq!(loaded.last_run.as_deref(), Some("now"));

    let raw: serde_json::Value =
        sqlx::query_scalar("SELECT state FROM engine_processing_versions WHERE type_id = 'heartbeat'")
            .fetch_one(&pool)
            .await?;
    assert_eq!(raw, json!({"future_field": true, "last_run": "now"}));
    Ok(())
}
