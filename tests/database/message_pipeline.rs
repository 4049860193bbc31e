use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use paging_core::config::{MessagingConfig, RateConfig};
use paging_core::constants::advisory_locks::GLOBAL_MESSAGE_SENDING;
use paging_core::database::DatabaseMigrations;
use paging_core::engine::{LifecycleManager, NeverPause};
use paging_core::message::{
    DestType, Message, MessageDb, MessageSender, MessageState, MessageStatus, StatusFetcher,
};
use paging_core::{EngineError, SendError};

use super::{insert_pending_sms, message_state};

type SendResult = std::result::Result<MessageStatus, SendError>;

/// Answers every send the same way and counts the calls.
struct ScriptedSender {
    calls: AtomicUsize,
    reply: fn(&Message) -> SendResult,
}

impl ScriptedSender {
    fn new(reply: fn(&Message) -> SendResult) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            reply,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageSender for ScriptedSender {
    async fn send(&self, msg: &Message) -> SendResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.reply)(msg)
    }
}

struct DeliveredFetcher;

#[async_trait]
impl StatusFetcher for DeliveredFetcher {
    async fn status(&self, id: &str, provider_message_id: &str) -> SendResult {
        Ok(MessageStatus::new(id, MessageState::Delivered).with_provider_id(provider_message_id))
    }
}

fn accepted(msg: &Message) -> SendResult {
    Ok(MessageStatus::new(msg.id.clone(), MessageState::Sent).with_provider_id(format!("prov-{}", msg.id)))
}

async fn message_db(pool: &PgPool, cfg: MessagingConfig) -> MessageDb {
    MessageDb::new(pool.clone(), cfg, Arc::new(NeverPause))
        .await
        .expect("message module")
}

async fn run_cycle(db: &MessageDb, sender: Arc<ScriptedSender>) {
    db.send_messages(&CancellationToken::new(), sender, Arc::new(DeliveredFetcher))
        .await
        .expect("send cycle");
}

#[sqlx::test(migrations = "./migrations")]
async fn test_pending_messages_are_sent_and_recorded(pool: PgPool) -> sqlx::Result<()> {
    insert_pending_sms(&pool, "msg-a", "cm-a", 1, "svc-1").await;
    insert_pending_sms(&pool, "msg-b", "cm-b", 2, "svc-2").await;

    let db = message_db(&pool, MessagingConfig::default()).await;
    let sender = ScriptedSender::new(accepted);
    run_cycle(&db, Arc::clone(&sender)).await;

    assert_eq!(sender.calls(), 2);
    for id in ["msg-a", "msg-b"] {
        let (status, _, provider_id) = message_state(&pool, id).await;
        assert_eq!(status, "sent");
        assert_eq!(provider_id, Some(format!("prov-{id}")));
    }

    // nothing pending: a second cycle sends nothing
    run_cycle(&db, Arc::clone(&sender)).await;
    assert_eq!(sender.calls(), 2);
    Ok(())
}

#[sqlx::test(migrations = "./migrations")]
async fn test_permanent_failure_is_not_retried(pool: PgPool) -> sqlx::Result<()> {
    insert_pending_sms(&pool, "msg-a", "cm-a", 1, "svc-1").await;

    let db = message_db(&pool, MessagingConfig::default()).await;
    run_cycle(&db, ScriptedSender::new(|_| Err(SendError::Permanent("bad number".into())))).await;

    let (status, details, _) = message_state(&pool, "msg-a").await;
    assert_eq!(status, "failed");
    assert!(details.contains("bad number"));

    let next_retry: Option<chrono::DateTime<chrono::Utc>> =
        sqlx::query_scalar("SELECT next_retry_at FROM outgoing_messages WHERE id = 'msg-a'")
            .fetch_one(&pool)
            .await?;
    assert!(next_retry.is_none());
    Ok(())
}

#[sqlx::test(migrations = "./migrations")]
async fn test_temporary_failure_schedules_retry(pool: PgPool) -> sqlx::Result<()> {
    insert_pending_sms(&pool, "msg-a", "cm-a", 1, "svc-1").await;

    let cfg = MessagingConfig {
        send_timeout_ms: 200,
        ..MessagingConfig::default()
    };
    let db = message_db(&pool, cfg).await;
    run_cycle(&db, ScriptedSender::new(|_| Err(SendError::Temporary("carrier busy".into())))).await;

    let (status, _, _) = message_state(&pool, "msg-a").await;
    assert_eq!(status, "failed");

    let next_retry: Option<chrono::DateTime<chrono::Utc>> =
        sqlx::query_scalar("SELECT next_retry_at FROM outgoing_messages WHERE id = 'msg-a'")
            .fetch_one(&pool)
            .await?;
    assert!(next_retry.is_some());
    Ok(())
}

#[sqlx::test(migrations = "./migrations")]
async fn test_disabled_contact_method_fails_without_sending(pool: PgPool) -> sqlx::Result<()> {
    sqlx::query(
        "INSERT INTO user_contact_methods (id, user_id, dest_type, value, disabled) \
         VALUES ('cm-off', 'user-1', 'sms', '+15555550100', true)",
    )
    .execute(&pool)
    .await?;
    insert_pending_sms(&pool, "msg-a", "cm-off", 1, "svc-1").await;

    let db = message_db(&pool, MessagingConfig::default()).await;
    let sender = ScriptedSender::new(accepted);
    run_cycle(&db, Arc::clone(&sender)).await;

    assert_eq!(sender.calls(), 0);
    let (status, details, _) = message_state(&pool, "msg-a").await;
    assert_eq!(status, "failed");
    assert_eq!(details, "contact method disabled");
    Ok(())
}

#[sqlx::test(migrations = "./migrations")]
async fn test_status_updates_apply_in_provider_order(pool: PgPool) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO outgoing_messages (
            id, message_type, dest_type, dest_id, alert_id,
            last_status, sent_at, provider_msg_id, provider_seq
        )
        VALUES ('msg-a', 'alert_notification', 'sms', 'cm-a', 1, 'sent', now(), 'p1', 5)
        "#,
    )
    .execute(&pool)
    .await?;

    let db = message_db(&pool, MessagingConfig::default()).await;

    let mut stale = MessageStatus::new("", MessageState::Delivered).with_provider_id("p1");
    stale.sequence = 3;
    db.update_message_status(&stale).await.expect("stale update");
    assert_eq!(message_state(&pool, "msg-a").await.0, "sent");

    let mut fresh = MessageStatus::new("", MessageState::Delivered).with_provider_id("p1");
    fresh.sequence = 6;
    db.update_message_status(&fresh).await.expect("fresh update");
    assert_eq!(message_state(&pool, "msg-a").await.0, "delivered");
    Ok(())
}

#[sqlx::test(migrations = "./migrations")]
async fn test_stuck_messages_are_reconciled(pool: PgPool) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO outgoing_messages (
            id, message_type, dest_type, dest_id, alert_id,
            last_status, last_status_at, sent_at, provider_msg_id
        )
        VALUES (
            'msg-a', 'alert_notification', 'sms', 'cm-a', 1,
            'queued_remotely', now() - interval '2 minutes', now() - interval '2 minutes', 'p1'
        )
        "#,
    )
    .execute(&pool)
    .await?;

    let db = message_db(&pool, MessagingConfig::default()).await;
    run_cycle(&db, ScriptedSender::new(accepted)).await;

    assert_eq!(message_state(&pool, "msg-a").await.0, "delivered");
    Ok(())
}

#[sqlx::test(migrations = "./migrations")]
async fn test_rate_below_one_per_batch_does_not_block_sends(pool: PgPool) -> sqlx::Result<()> {
    insert_pending_sms(&pool, "msg-a", "cm-a", 1, "svc-1").await;

    let mut cfg = MessagingConfig::default();
    cfg.rate_limits.insert(DestType::Sms, RateConfig::new(1, 500));
    let db = message_db(&pool, cfg).await;
    let sender = ScriptedSender::new(accepted);
    run_cycle(&db, Arc::clone(&sender)).await;

    assert_eq!(sender.calls(), 1);
    assert_eq!(message_state(&pool, "msg-a").await.0, "sent");
    Ok(())
}

#[sqlx::test(migrations = "./migrations")]
async fn test_pause_aborts_while_waiting_for_sending_lock(pool: PgPool) -> sqlx::Result<()> {
    insert_pending_sms(&pool, "msg-a", "cm-a", 1, "svc-1").await;

    // another instance is sending
    let mut holder = pool.acquire().await?;
    sqlx::query("SELECT pg_advisory_lock($1)")
        .bind(GLOBAL_MESSAGE_SENDING)
        .execute(&mut *holder)
        .await?;

    let lifecycle = Arc::new(LifecycleManager::new());
    let db = MessageDb::new(pool.clone(), MessagingConfig::default(), lifecycle.clone())
        .await
        .expect("message module");
    let sender = ScriptedSender::new(accepted);

    let cycle = tokio::spawn({
        let sender = Arc::clone(&sender);
        async move {
            db.send_messages(&CancellationToken::new(), sender, Arc::new(DeliveredFetcher))
                .await
        }
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    lifecycle.pause(|| async { Ok::<(), EngineError>(()) }).await.expect("pause");

    let res = tokio::time::timeout(Duration::from_secs(2), cycle)
        .await
        .expect("send cycle returned after pause")
        .expect("send cycle task");
    assert!(matches!(res, Err(EngineError::Aborted)));
    assert_eq!(sender.calls(), 0);
    assert_eq!(message_state(&pool, "msg-a").await.0, "pending");

    sqlx::query("SELECT pg_advisory_unlock($1)")
        .bind(GLOBAL_MESSAGE_SENDING)
        .execute(&mut *holder)
        .await?;
    Ok(())
}

#[sqlx::test(migrations = "./migrations")]
async fn test_alerts_to_one_destination_are_bundled(pool: PgPool) -> sqlx::Result<()> {
    for (id, alert_id) in [("msg-a", 1), ("msg-b", 2), ("msg-c", 3)] {
        insert_pending_sms(&pool, id, "cm-a", alert_id, "svc-1").await;
    }

    let db = message_db(&pool, MessagingConfig::default()).await;
    let sender = ScriptedSender::new(accepted);
    run_cycle(&db, Arc::clone(&sender)).await;

    assert_eq!(sender.calls(), 1);
    for id in ["msg-a", "msg-b", "msg-c"] {
        let (status, details, _) = message_state(&pool, id).await;
        assert_eq!(status, "bundled");
        assert!(details.starts_with("bundled into "));
    }

    let bundles: Vec<(String, String)> = sqlx::query_as(
        "SELECT last_status, dest_id FROM outgoing_messages WHERE message_type = 'alert_notification_bundle'",
    )
    .fetch_all(&pool)
    .await?;
    assert_eq!(bundles, vec![("sent".to_string(), "cm-a".to_string())]);
    Ok(())
}

#[sqlx::test(migrations = "./migrations")]
async fn test_stale_status_updates_are_deleted(pool: PgPool) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO outgoing_messages (id, message_type, dest_type, dest_id, alert_id, alert_log_id, created_at)
        VALUES
            ('status-old', 'alert_status_update', 'sms', 'cm-a', 1, 10, now() - interval '1 minute'),
            ('status-new', 'alert_status_update', 'sms', 'cm-a', 1, 11, now())
        "#,
    )
    .execute(&pool)
    .await?;

    let db = message_db(&pool, MessagingConfig::default()).await;
    let sender = ScriptedSender::new(accepted);
    run_cycle(&db, Arc::clone(&sender)).await;

    let remaining: Vec<String> = sqlx::query_scalar("SELECT id FROM outgoing_messages ORDER BY id")
        .fetch_all(&pool)
        .await?;
    assert_eq!(remaining, vec!["status-new".to_string()]);
    assert_eq!(sender.calls(), 1);
    assert_eq!(message_state(&pool, "status-new").await.0, "sent");
    Ok(())
}

#[sqlx::test(migrations = "./migrations")]
async fn test_expired_sending_lease_is_failed(pool: PgPool) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO outgoing_messages (
            id, message_type, dest_type, dest_id, alert_id, last_status, sending_deadline, fired_at
        )
        VALUES (
            'msg-a', 'alert_notification', 'sms', 'cm-a', 1, 'sending',
            now() - interval '1 minute', now() - interval '2 minutes'
        )
        "#,
    )
    .execute(&pool)
    .await?;

    let db = message_db(&pool, MessagingConfig::default()).await;
    let sender = ScriptedSender::new(accepted);
    run_cycle(&db, Arc::clone(&sender)).await;

    assert_eq!(sender.calls(), 0);
    let (status, details, _) = message_state(&pool, "msg-a").await;
    assert_eq!(status, "failed");
    assert_eq!(details, "send deadline expired");
    Ok(())
}

#[sqlx::test(migrations = "./migrations")]
async fn test_migration_runner_is_idempotent(pool: PgPool) -> sqlx::Result<()> {
    let runner = DatabaseMigrations::default();
    let expected = runner.discover().expect("discover").len();

    let mut conn = pool.acquire().await?;
    // tables already exist, so every statement has to tolerate a rerun
    let first = runner.run_all(&mut conn).await.expect("first run");
    assert_eq!(first.len(), expected);
    let second = runner.run_all(&mut conn).await.expect("second run");
    assert!(second.is_empty());
    Ok(())
}
