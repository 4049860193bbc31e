//! SQL access to `outgoing_messages`.
//!
//! Everything that runs inside the send cycle's locked transaction takes a
//! `&mut PgConnection`; status writes from workers and provider callbacks go
//! straight to the pool.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::{PgConnection, PgPool, Postgres};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::bundle::{bundle_alert_messages, bundle_status_messages};
use super::dedup::{dedup_alerts, dedup_on_call_notifications, dedup_status_messages};
use super::status::{MessageState, MessageStatus, OutgoingStatus};
use super::types::{Dest, DestType, Message, MessageType};
use crate::config::MessagingConfig;
use crate::constants::advisory_locks::GLOBAL_MESSAGE_SENDING;
use crate::error::{EngineError, Result};
use crate::processing_lock::ProcessingLock;

/// Row counts touched by the per-cycle housekeeping statements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HousekeepingReport {
    pub disabled_contact_methods: u64,
    pub expired_leases: u64,
    pub retries_cleared: u64,
    pub retries_reset: u64,
}

#[derive(Debug, sqlx::FromRow)]
struct OutgoingRow {
    id: String,
    message_type: String,
    dest_type: String,
    dest_id: String,
    dest_value: String,
    alert_id: Option<i64>,
    alert_log_id: Option<i64>,
    user_verification_code_id: Option<String>,
    user_id: Option<String>,
    service_id: Option<String>,
    schedule_id: Option<String>,
    status_alert_ids: Option<Vec<i64>>,
    created_at: DateTime<Utc>,
    sent_at: Option<DateTime<Utc>>,
}

impl TryFrom<OutgoingRow> for Message {
    type Error = String;

    fn try_from(row: OutgoingRow) -> std::result::Result<Self, Self::Error> {
        let message_type: MessageType = row.message_type.parse()?;
        let dest_type: DestType = row.dest_type.parse()?;

        let mut msg = Message::new(
            row.id,
            message_type,
            Dest::new(dest_type, row.dest_id, row.dest_value),
            row.created_at,
        );
        msg.alert_id = row.alert_id.unwrap_or_default();
        msg.alert_log_id = row.alert_log_id.unwrap_or_default();
        msg.verify_id = row.user_verification_code_id.unwrap_or_default();
        msg.user_id = row.user_id.unwrap_or_default();
        msg.service_id = row.service_id.unwrap_or_default();
        msg.schedule_id = row.schedule_id.unwrap_or_default();
        msg.status_alert_ids = row.status_alert_ids.unwrap_or_default();
        msg.status_count = msg.status_alert_ids.len();
        msg.sent_at = row.sent_at;
        Ok(msg)
    }
}

/// Outgoing message persistence.
#[derive(Debug, Clone)]
pub struct MessageStore {
    pool: PgPool,
    cfg: Arc<MessagingConfig>,
}

impl MessageStore {
    pub fn new(pool: PgPool, cfg: Arc<MessagingConfig>) -> Self {
        Self { pool, cfg }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Kill idle backends that have held the global sending lock too long.
    #[instrument(skip(self))]
    pub async fn terminate_stale_lock_holders(&self) -> Result<usize> {
        let terminated = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT pg_terminate_backend(lock.pid)
            FROM pg_locks lock
            JOIN pg_database pgdat ON
                datname = current_database() AND
                lock.database = pgdat.oid
            JOIN pg_stat_activity act ON
                act.datid = pgdat.oid AND
                act.pid = lock.pid AND
                act.state = 'idle' AND
                act.state_change < now() - make_interval(secs => $2)
            WHERE lock.objid::bigint = $1 AND lock.locktype = 'advisory' AND lock.granted
            "#,
        )
        .bind(GLOBAL_MESSAGE_SENDING)
        .bind(secs(self.cfg.stale_lock()))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EngineError::database("terminate stale backend locks", e))?;

        Ok(terminated.into_iter().filter(|t| *t).count())
    }

    /// Take the table lock and settle leases and retries.
    ///
    /// Must run inside the locked send transaction; any failure aborts the
    /// whole transaction.
    pub async fn housekeeping(&self, conn: &mut PgConnection) -> Result<HousekeepingReport> {
        sqlx::query("LOCK outgoing_messages IN EXCLUSIVE MODE")
            .execute(&mut *conn)
            .await
            .map_err(|e| EngineError::database("acquire exclusive locks", e))?;

        let disabled = sqlx::query(
            r#"
            UPDATE outgoing_messages msg
            SET
                last_status = 'failed',
                last_status_at = now(),
                status_details = 'contact method disabled',
                cycle_id = NULL,
                next_retry_at = NULL
            FROM user_contact_methods cm
            WHERE
                msg.last_status = 'pending' AND
                msg.message_type != 'verification_message' AND
                cm.id = msg.dest_id AND
                cm.disabled
            "#,
        )
        .execute(&mut *conn)
        .await
        .map_err(|e| EngineError::database("check for disabled contact methods", e))?;

        let expired = sqlx::query(
            r#"
            UPDATE outgoing_messages
            SET
                last_status = 'failed',
                last_status_at = now(),
                status_details = 'send deadline expired',
                cycle_id = NULL,
                next_retry_at = NULL
            WHERE
                last_status = 'sending' AND
                sending_deadline <= now()
            "#,
        )
        .execute(&mut *conn)
        .await
        .map_err(|e| EngineError::database("fail expired messages", e))?;

        let cleared = sqlx::query(
            r#"
            UPDATE outgoing_messages
            SET
                next_retry_at = NULL,
                cycle_id = NULL
            WHERE
                last_status = 'failed' AND
                retry_count >= $1 AND
                (cycle_id IS NOT NULL OR next_retry_at IS NOT NULL)
            "#,
        )
        .bind(self.max_retries())
        .execute(&mut *conn)
        .await
        .map_err(|e| EngineError::database("clear max retries", e))?;

        let reset = sqlx::query(
            r#"
            UPDATE outgoing_messages
            SET
                last_status = 'pending',
                status_details = '',
                next_retry_at = NULL,
                retry_count = retry_count + 1,
                fired_at = NULL,
                sent_at = NULL,
                provider_msg_id = NULL,
                provider_seq = 0
            WHERE
                last_status = 'failed' AND
                now() > next_retry_at AND
                retry_count < $1
            "#,
        )
        .bind(self.max_retries())
        .execute(&mut *conn)
        .await
        .map_err(|e| EngineError::database("reset retry messages", e))?;

        Ok(HousekeepingReport {
            disabled_contact_methods: disabled.rows_affected(),
            expired_leases: expired.rows_affected(),
            retries_cleared: cleared.rows_affected(),
            retries_reset: reset.rows_affected(),
        })
    }

    pub async fn current_time(&self, conn: &mut PgConnection) -> Result<DateTime<Utc>> {
        sqlx::query_scalar::<_, DateTime<Utc>>("SELECT now()")
            .fetch_one(conn)
            .await
            .map_err(|e| EngineError::database("get current time", e))
    }

    /// Pending messages plus everything sent after `since`.
    ///
    /// Rows with an unrecognized message or destination type are skipped.
    pub async fn snapshot(&self, conn: &mut PgConnection, since: DateTime<Utc>) -> Result<Vec<Message>> {
        let rows = sqlx::query_as::<_, OutgoingRow>(
            r#"
            SELECT
                id, message_type, dest_type, dest_id, dest_value,
                alert_id, alert_log_id, user_verification_code_id,
                user_id, service_id, schedule_id, status_alert_ids,
                created_at, sent_at
            FROM outgoing_messages
            WHERE
                last_status = 'pending' OR
                (sent_at IS NOT NULL AND sent_at > $1)
            "#,
        )
        .bind(since)
        .fetch_all(conn)
        .await
        .map_err(|e| EngineError::database("fetch outgoing messages", e))?;

        let mut msgs = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id.clone();
            match Message::try_from(row) {
                Ok(msg) => msgs.push(msg),
                Err(reason) => warn!(message_id = %id, reason = %reason, "skipping unknown message"),
            }
        }
        Ok(msgs)
    }

    /// Apply dedup and bundling to a snapshot and persist the outcome.
    pub async fn reduce(&self, conn: &mut PgConnection, msgs: Vec<Message>) -> Result<Vec<Message>> {
        let on_call = dedup_on_call_notifications(msgs);
        self.delete_pending(&mut *conn, &on_call.stale_ids).await?;

        let mut merges: Vec<(String, Vec<String>)> = Vec::new();
        let msgs = dedup_alerts(on_call.messages, |parent, duplicates| {
            merges.push((parent.to_string(), duplicates.to_vec()))
        });
        for (parent, duplicates) in &merges {
            self.mark_bundled(&mut *conn, parent, duplicates).await?;
        }

        let status = dedup_status_messages(msgs);
        self.delete_pending(&mut *conn, &status.stale_ids).await?;
        let mut msgs = status.messages;

        if self.cfg.disable_bundling {
            return Ok(msgs);
        }

        let mut bundles: Vec<(Message, Vec<String>)> = Vec::new();
        msgs = bundle_alert_messages(msgs, new_message_id, |bundle, ids| {
            bundles.push((bundle.clone(), ids.to_vec()))
        });
        msgs = bundle_status_messages(msgs, new_message_id, |bundle, ids| {
            bundles.push((bundle.clone(), ids.to_vec()))
        });
        for (bundle, members) in &bundles {
            self.insert_bundle(&mut *conn, bundle).await?;
            self.mark_bundled(&mut *conn, &bundle.id, members).await?;
        }
        if !bundles.is_empty() {
            debug!(bundles = bundles.len(), "bundled pending messages");
        }

        Ok(msgs)
    }

    async fn delete_pending(&self, conn: &mut PgConnection, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query("DELETE FROM outgoing_messages WHERE id = ANY($1) AND last_status = 'pending'")
            .bind(ids)
            .execute(conn)
            .await
            .map_err(|e| EngineError::database("delete stale messages", e))?;
        Ok(())
    }

    async fn mark_bundled(&self, conn: &mut PgConnection, parent_id: &str, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            UPDATE outgoing_messages
            SET
                last_status = 'bundled',
                last_status_at = now(),
                status_details = $2,
                cycle_id = NULL
            WHERE id = ANY($1) AND last_status = 'pending'
            "#,
        )
        .bind(ids)
        .bind(format!("bundled into {parent_id}"))
        .execute(conn)
        .await
        .map_err(|e| EngineError::database("mark messages bundled", e))?;
        Ok(())
    }

    async fn insert_bundle(&self, conn: &mut PgConnection, bundle: &Message) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO outgoing_messages (
                id, message_type, dest_type, dest_id, dest_value,
                alert_id, alert_log_id, user_id, service_id,
                status_alert_ids, created_at, last_status
            )
            VALUES (
                $1, $2, $3, $4, $5,
                NULLIF($6, 0), NULLIF($7, 0), NULLIF($8, ''), NULLIF($9, ''),
                $10, $11, 'pending'
            )
            "#,
        )
        .bind(&bundle.id)
        .bind(bundle.message_type.as_str())
        .bind(bundle.dest.dest_type.as_str())
        .bind(&bundle.dest.id)
        .bind(&bundle.dest.value)
        .bind(bundle.alert_id)
        .bind(bundle.alert_log_id)
        .bind(&bundle.user_id)
        .bind(&bundle.service_id)
        .bind(&bundle.status_alert_ids)
        .bind(bundle.created_at)
        .execute(conn)
        .await
        .map_err(|e| EngineError::database("insert bundle message", e))?;
        Ok(())
    }

    /// Lease `id` for one send attempt. Run through the locked connection.
    pub fn set_sending_query(&self, id: &str) -> Query<'static, Postgres, PgArguments> {
        sqlx::query(
            r#"
            UPDATE outgoing_messages
            SET
                last_status = 'sending',
                last_status_at = now(),
                status_details = '',
                sending_deadline = now() + make_interval(secs => $2),
                fired_at = now(),
                provider_seq = 0,
                provider_msg_id = NULL,
                next_retry_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .bind(secs(self.cfg.sending_deadline()))
    }

    /// Persist a delivery status, matching on message ID or provider ID.
    pub async fn record_status(&self, status: &MessageStatus) -> Result<()> {
        let id = non_empty(&status.id);
        let provider_id = status.provider_message_id.as_deref().and_then(non_empty);

        match status.state {
            MessageState::FailedTemp => self.temp_fail(id, provider_id, &status.details).await,
            MessageState::FailedPerm => self.perm_fail(id, provider_id, &status.details).await,
            state => {
                let Some(outgoing) = state.outgoing_status() else {
                    return Ok(());
                };
                self.update_status(id, provider_id, status.sequence, outgoing, &status.details)
                    .await
            }
        }
    }

    /// Failed, with a retry scheduled while the retry budget lasts.
    pub async fn temp_fail(&self, id: Option<&str>, provider_id: Option<&str>, details: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE outgoing_messages
            SET
                last_status = 'failed',
                last_status_at = now(),
                status_details = $3,
                provider_msg_id = coalesce($2, provider_msg_id),
                next_retry_at = CASE
                    WHEN retry_count < $4 THEN now() + make_interval(secs => $5)
                    ELSE NULL
                END
            WHERE id = $1 OR provider_msg_id = $2
            "#,
        )
        .bind(id)
        .bind(provider_id)
        .bind(details)
        .bind(self.max_retries())
        .bind(secs(self.cfg.retry_delay()))
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::database("mark failed message (temp)", e))?;
        Ok(())
    }

    /// Failed for good.
    pub async fn perm_fail(&self, id: Option<&str>, provider_id: Option<&str>, details: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE outgoing_messages
            SET
                last_status = 'failed',
                last_status_at = now(),
                status_details = $3,
                cycle_id = NULL,
                provider_msg_id = coalesce($2, provider_msg_id),
                next_retry_at = NULL
            WHERE id = $1 OR provider_msg_id = $2
            "#,
        )
        .bind(id)
        .bind(provider_id)
        .bind(details)
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::database("mark failed message (perm)", e))?;
        Ok(())
    }

    /// Delivery progress. Older provider sequences and failed or pending rows
    /// are left alone.
    pub async fn update_status(
        &self,
        id: Option<&str>,
        provider_id: Option<&str>,
        sequence: i32,
        status: OutgoingStatus,
        details: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE outgoing_messages
            SET
                last_status = $4,
                last_status_at = now(),
                status_details = $5,
                cycle_id = NULL,
                sending_deadline = NULL,
                sent_at = coalesce(sent_at, fired_at, now()),
                fired_at = NULL,
                provider_msg_id = coalesce($2, provider_msg_id),
                provider_seq = CASE WHEN $3 = -1 THEN provider_seq ELSE $3 END,
                next_retry_at = NULL
            WHERE
                (id = $1 OR provider_msg_id = $2) AND
                (provider_seq <= $3 OR $3 = -1) AND
                last_status NOT IN ('failed', 'pending')
            "#,
        )
        .bind(id)
        .bind(provider_id)
        .bind(sequence)
        .bind(status.as_str())
        .bind(details)
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::database("update message status", e))?;
        Ok(())
    }

    /// Claim a batch of messages stuck in `queued_remotely` for a status refresh.
    ///
    /// Claimed rows get `last_status_at` bumped so concurrent cycles skip them.
    pub async fn claim_stuck(&self, lock: &ProcessingLock) -> Result<Vec<(String, String)>> {
        let stuck_after = secs(self.cfg.stuck_after());
        let limit = i64::from(self.cfg.stuck_batch_size);

        lock.with_tx(move |conn| {
            Box::pin(async move {
                sqlx::query_as::<_, (String, String)>(
                    r#"
                    WITH sel AS (
                        SELECT id, provider_msg_id
                        FROM outgoing_messages
                        WHERE
                            last_status = 'queued_remotely' AND
                            last_status_at < now() - make_interval(secs => $1) AND
                            provider_msg_id IS NOT NULL
                        ORDER BY last_status_at
                        LIMIT $2
                        FOR UPDATE
                    )
                    UPDATE outgoing_messages msg
                    SET last_status_at = now()
                    FROM sel
                    WHERE msg.id = sel.id
                    RETURNING msg.id, msg.provider_msg_id
                    "#,
                )
                .bind(stuck_after)
                .bind(limit)
                .fetch_all(conn)
                .await
                .map_err(|e| EngineError::database("claim stuck messages", e))
            })
        })
        .await
    }

    fn max_retries(&self) -> i32 {
        i32::try_from(self.cfg.max_retries).unwrap_or(i32::MAX)
    }
}

fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

fn non_empty(s: &str) -> Option<&str> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn secs(d: Duration) -> f64 {
    d.as_secs_f64()
}
