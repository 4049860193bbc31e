//! # Send Pipeline
//!
//! One send cycle: clear out stale holders of the global sending lock, take
//! it, settle leases and retries under an exclusive table lock, reduce the
//! snapshot and build a [`Queue`], then drain the queue with one bounded
//! worker pool per destination type. Afterwards messages stuck in
//! `queued_remotely` get their provider status refreshed.
//!
//! A pause cancels the in-flight cycle: workers finish the message they are
//! on but nothing new is pulled, and the cycle reports
//! [`EngineError::Aborted`].

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::queue::{Queue, QueueOptions};
use super::status::{MessageState, MessageStatus};
use super::store::{HousekeepingReport, MessageStore};
use super::types::{DestType, Message};
use crate::config::MessagingConfig;
use crate::constants::advisory_locks::GLOBAL_MESSAGE_SENDING;
use crate::constants::provider::{CALL_TIMEOUT, NO_SEQUENCE};
use crate::engine::lifecycle::Pausable;
use crate::error::{EngineError, Result, SendError};
use crate::logging::log_message_operation;
use crate::processing_lock::{LockConfig, LockConn, LockType, ProcessingLock};
use crate::retry::{retry_temporary, RetryPolicy};

/// Schema version of the message module's tables.
pub const MESSAGE_MODULE_VERSION: i32 = 1;

/// Delivers one message through a provider.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, msg: &Message) -> std::result::Result<MessageStatus, SendError>;
}

/// Looks up the current provider status of a sent message.
#[async_trait]
pub trait StatusFetcher: Send + Sync {
    async fn status(
        &self,
        id: &str,
        provider_message_id: &str,
    ) -> std::result::Result<MessageStatus, SendError>;
}

/// What to write back after a send attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Failed; eligible for another attempt after the retry delay.
    TempFail {
        provider_id: Option<String>,
        details: String,
    },
    /// Failed for good.
    PermFail {
        provider_id: Option<String>,
        details: String,
    },
    /// Accepted by the provider.
    Accepted(MessageStatus),
}

impl SendOutcome {
    /// Classify a provider result for the message `msg_id`.
    pub fn classify(msg_id: &str, res: std::result::Result<MessageStatus, SendError>) -> Self {
        match res {
            Err(err @ SendError::Temporary(_)) => SendOutcome::TempFail {
                provider_id: None,
                details: err.to_string(),
            },
            Err(err @ SendError::Permanent(_)) => SendOutcome::PermFail {
                provider_id: None,
                details: err.to_string(),
            },
            Ok(status) => match status.state {
                MessageState::FailedTemp => SendOutcome::TempFail {
                    provider_id: status.provider_message_id,
                    details: status.details,
                },
                MessageState::FailedPerm => SendOutcome::PermFail {
                    provider_id: status.provider_message_id,
                    details: status.details,
                },
                _ => {
                    let mut status = status;
                    if status.id.is_empty() {
                        status.id = msg_id.to_string();
                    }
                    SendOutcome::Accepted(status)
                }
            },
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, SendOutcome::Accepted(_))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SendOutcome::TempFail { .. } => "failed_temp",
            SendOutcome::PermFail { .. } => "failed_perm",
            SendOutcome::Accepted(_) => "accepted",
        }
    }
}

/// Message module: the send cycle plus status updates.
#[derive(Clone)]
pub struct MessageDb {
    lock: ProcessingLock,
    store: MessageStore,
    cfg: Arc<MessagingConfig>,
    pausable: Arc<dyn Pausable>,
}

impl fmt::Debug for MessageDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageDb")
            .field("lock", &self.lock)
            .field("cfg", &self.cfg)
            .finish_non_exhaustive()
    }
}

impl MessageDb {
    pub async fn new(pool: PgPool, cfg: MessagingConfig, pausable: Arc<dyn Pausable>) -> Result<Self> {
        let lock = ProcessingLock::new(
            pool.clone(),
            LockConfig::new(LockType::Message, MESSAGE_MODULE_VERSION),
        )
        .await?;
        let cfg = Arc::new(cfg);

        Ok(Self {
            lock,
            store: MessageStore::new(pool, Arc::clone(&cfg)),
            cfg,
            pausable,
        })
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    /// Run one send cycle.
    ///
    /// Returns [`EngineError::Aborted`] whenever a pause began during the
    /// cycle, regardless of how far it got.
    pub async fn send_messages(
        &self,
        token: &CancellationToken,
        sender: Arc<dyn MessageSender>,
        fetcher: Arc<dyn StatusFetcher>,
    ) -> Result<()> {
        let res = self.send_all(token, sender, fetcher).await;
        if self.pausable.is_pausing() {
            return Err(EngineError::Aborted);
        }
        res
    }

    /// Record an asynchronous provider status callback.
    pub async fn update_message_status(&self, status: &MessageStatus) -> Result<()> {
        retry_temporary(&RetryPolicy::status_update(), |_| self.store.record_status(status)).await
    }

    async fn send_all(
        &self,
        token: &CancellationToken,
        sender: Arc<dyn MessageSender>,
        fetcher: Arc<dyn StatusFetcher>,
    ) -> Result<()> {
        debug!("sending outgoing messages");

        let exec = token.child_token();
        let _exec_done = exec.clone().drop_guard();
        {
            let exec = exec.clone();
            let pausable = Arc::clone(&self.pausable);
            tokio::spawn(async move {
                tokio::select! {
                    _ = pausable.pause_wait() => exec.cancel(),
                    _ = exec.cancelled() => {}
                }
            });
        }

        let terminated = until_cancelled(&exec, self.store.terminate_stale_lock_holders()).await?;
        if terminated > 0 {
            warn!(
                count = terminated,
                "terminated stale backend instance(s) holding message sending lock"
            );
        }

        let conn = Arc::new(self.lock.conn().await?);
        let res = self.send_locked(&exec, &conn, sender).await;
        // a cancelled lock wait can leave a query in flight on the backend;
        // closing the connection ends it and drops any session lock
        if res.is_ok() {
            if let Err(e) = conn.unlock_all().await {
                debug!(error = %e, "release sending lock");
            }
        }
        conn.close().await;
        res?;

        self.update_stuck_messages(&exec, fetcher).await
    }

    async fn send_locked(
        &self,
        exec: &CancellationToken,
        conn: &Arc<LockConn>,
        sender: Arc<dyn MessageSender>,
    ) -> Result<()> {
        until_cancelled(exec, conn.advisory_lock(GLOBAL_MESSAGE_SENDING)).await?;

        let opts = QueueOptions::default();
        let window = self
            .cfg
            .history_window()
            .max(opts.per_destination.max_duration())
            .max(opts.global.max_duration());
        let window = chrono::Duration::from_std(window)
            .map_err(|e| EngineError::Configuration(format!("history window: {e}")))?;

        let store = self.store.clone();
        let (msgs, now, report) = until_cancelled(
            exec,
            conn.with_tx(move |tx| {
                Box::pin(async move {
                    let report = store.housekeeping(&mut *tx).await?;
                    let now = store.current_time(&mut *tx).await?;
                    let msgs = store.snapshot(&mut *tx, now - window).await?;
                    let msgs = store.reduce(&mut *tx, msgs).await?;
                    Ok((msgs, now, report))
                })
            }),
        )
        .await?;
        if report != HousekeepingReport::default() {
            debug!(?report, "message housekeeping");
        }

        let queue = Arc::new(Queue::with_options(msgs, now, opts));
        let mut by_type = JoinSet::new();
        for dest_type in queue.types() {
            let this = self.clone();
            let exec = exec.clone();
            let conn = Arc::clone(conn);
            let sender = Arc::clone(&sender);
            let queue = Arc::clone(&queue);
            by_type.spawn(async move {
                let res = this
                    .send_by_type(&exec, conn, sender, queue, dest_type)
                    .await;
                (dest_type, res)
            });
        }

        while let Some(joined) = by_type.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((_, Err(e))) if e.is_no_lock() || matches!(e, EngineError::Canceled) => {}
                Ok((dest_type, Err(e))) => warn!(dest_type = %dest_type, error = %e, "send"),
                Err(e) => warn!(error = %e, "send worker pool failed"),
            }
        }
        Ok(())
    }

    /// Drain `queue` for one destination type within its rate budget.
    ///
    /// The first worker error stops the pool from pulling more messages;
    /// sends already in flight are waited for before it is returned.
    #[instrument(skip_all, fields(dest_type = %dest_type))]
    async fn send_by_type(
        &self,
        exec: &CancellationToken,
        conn: Arc<LockConn>,
        sender: Arc<dyn MessageSender>,
        queue: Arc<Queue>,
        dest_type: DestType,
    ) -> Result<()> {
        let limit = self.cfg.rate_limit(dest_type);
        let to_send = limit.budget();
        let batch = limit.batch();
        let max_workers = self.cfg.workers_per_type.max(1);

        let mut failures = 0usize;
        let mut drained = false;
        let mut first_err = None;
        let mut workers: JoinSet<Result<bool>> = JoinSet::new();

        loop {
            if exec.is_cancelled() {
                first_err = Some(EngineError::Canceled);
                break;
            }

            while !drained
                && workers.len() < max_workers
                && queue.sent_by_type(dest_type, batch).saturating_sub(failures) < to_send
            {
                let Some(msg) = queue.next_by_type(dest_type) else {
                    drained = true;
                    break;
                };
                let this = self.clone();
                let conn = Arc::clone(&conn);
                let sender = Arc::clone(&sender);
                workers.spawn(async move { this.send_message(&conn, sender.as_ref(), &msg).await });
            }

            if workers.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = exec.cancelled() => {
                    first_err = Some(EngineError::Canceled);
                    break;
                }
                Some(joined) = workers.join_next() => match joined {
                    Ok(Ok(true)) => {}
                    Ok(Ok(false)) => failures += 1,
                    Ok(Err(e)) => {
                        first_err = Some(e);
                        break;
                    }
                    Err(e) => {
                        first_err = Some(EngineError::Panic {
                            component: format!("send {dest_type}"),
                            message: e.to_string(),
                        });
                        break;
                    }
                },
            }
        }

        while let Some(joined) = workers.join_next().await {
            if let Ok(Err(e)) = joined {
                debug!(error = %e, "in-flight send finished with error");
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Lease, send and record one message. `Ok(false)` means the send
    /// failed and the failure was recorded.
    #[instrument(
        skip_all,
        fields(message_id = %msg.id, dest_type = %msg.dest.dest_type, alert_id = msg.alert_id)
    )]
    async fn send_message(
        &self,
        conn: &LockConn,
        sender: &dyn MessageSender,
        msg: &Message,
    ) -> Result<bool> {
        conn.exec(self.store.set_sending_query(&msg.id)).await?;

        let res = send_with_retry(sender, msg, self.cfg.send_timeout()).await;
        if let Err(e) = &res {
            warn!(error = %e, "send message");
        }

        let write = RetryPolicy::status_write();
        let id = Some(msg.id.as_str());
        let outcome = SendOutcome::classify(&msg.id, res);
        log_message_operation(
            "send",
            Some(&msg.id),
            Some(msg.dest.dest_type.as_str()),
            (msg.alert_id != 0).then_some(msg.alert_id),
            outcome.as_str(),
            None,
        );

        match outcome {
            SendOutcome::TempFail { provider_id, details } => {
                let provider_id = provider_id.as_deref();
                retry_temporary(&write, |_| self.store.temp_fail(id, provider_id, &details)).await?;
                Ok(false)
            }
            SendOutcome::PermFail { provider_id, details } => {
                let provider_id = provider_id.as_deref();
                retry_temporary(&write, |_| self.store.perm_fail(id, provider_id, &details)).await?;
                Ok(false)
            }
            SendOutcome::Accepted(status) => {
                self.update_message_status(&status).await?;
                Ok(true)
            }
        }
    }

    /// Re-query providers for messages stuck in `queued_remotely`.
    async fn update_stuck_messages(
        &self,
        token: &CancellationToken,
        fetcher: Arc<dyn StatusFetcher>,
    ) -> Result<()> {
        let stuck = until_cancelled(token, self.store.claim_stuck(&self.lock)).await?;
        if stuck.is_empty() {
            return Ok(());
        }
        info!(count = stuck.len(), "refreshing stuck message status");

        let mut lookups = JoinSet::new();
        for (id, provider_id) in stuck {
            let fetcher = Arc::clone(&fetcher);
            lookups.spawn(async move { refresh_status(fetcher.as_ref(), id, provider_id).await });
        }

        while let Some(joined) = lookups.join_next().await {
            let status = match joined {
                Ok(status) => status,
                Err(e) => {
                    warn!(error = %e, "status lookup task failed");
                    continue;
                }
            };
            if let Err(e) = self.store.record_status(&status).await {
                warn!(message_id = %status.id, error = %e, "update stale message status");
            }
        }
        Ok(())
    }
}

/// Call `sender` with retries on temporary errors, bounded by `timeout`
/// overall. Running out of time counts as a temporary failure.
pub async fn send_with_retry(
    sender: &dyn MessageSender,
    msg: &Message,
    timeout: Duration,
) -> std::result::Result<MessageStatus, SendError> {
    let policy = RetryPolicy::send();
    let attempts = retry_temporary(&policy, |_| sender.send(msg));
    match tokio::time::timeout(timeout, attempts).await {
        Ok(res) => res,
        Err(_) => Err(SendError::Temporary(format!(
            "no response within {}ms",
            timeout.as_millis()
        ))),
    }
}

/// Fetch the provider status of one stuck message. Never fails: a lookup
/// error is recorded as an `active` status carrying the error text.
pub async fn refresh_status(
    fetcher: &dyn StatusFetcher,
    id: String,
    provider_id: String,
) -> MessageStatus {
    let res = tokio::time::timeout(CALL_TIMEOUT, fetcher.status(&id, &provider_id)).await;
    let err = match res {
        Ok(Ok(mut status)) => {
            if status.id.is_empty() {
                status.id = id;
            }
            if status.provider_message_id.is_none() {
                status.provider_message_id = Some(provider_id);
            }
            return status.into_reconciled();
        }
        Ok(Err(e)) => e.to_string(),
        Err(_) => format!("no response within {}ms", CALL_TIMEOUT.as_millis()),
    };

    let mut status = MessageStatus::new(id, MessageState::Active)
        .with_provider_id(provider_id)
        .with_details(format!("failed to update status: {err}"));
    status.sequence = NO_SEQUENCE;
    status
}

/// Run `fut` unless `token` is cancelled first.
pub async fn until_cancelled<T, F>(token: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        _ = token.cancelled() => Err(EngineError::Canceled),
        res = fut => res,
    }
}
