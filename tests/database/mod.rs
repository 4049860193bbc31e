pub mod message_pipeline;
pub mod processing_lock;

use sqlx::PgPool;

/// Insert a pending SMS alert notification.
pub async fn insert_pending_sms(pool: &PgPool, id: &str, dest_id: &str, alert_id: i64, service_id: &str) {
    sqlx::query(
        r#"
        INSERT INTO outgoing_messages (
            id, message_type, dest_type, dest_id, dest_value, alert_id, service_id, created_at
        )
        VALUES ($1, 'alert_notification', 'sms', $2, '+15555550100', $3, $4, now())
        "#,
    )
    .bind(id)
    .bind(dest_id)
    .bind(alert_id)
    .bind(service_id)
    .execute(pool)
    .await
    .expect("insert pending message");
}

/// `(last_status, status_details, provider_msg_id)` of one message.
pub async fn message_state(pool: &PgPool, id: &str) -> (String, String, Option<String>) {
    sqlx::query_as::<_, (String, String, Option<String>)>(
        "SELECT last_status, status_details, provider_msg_id FROM outgoing_messages WHERE id = $1",
    )
    .bind(id)
    .fetch_one(pool)
    .await
    .expect("message row")
}
