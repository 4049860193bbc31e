//! # Engine
//!
//! The outer scheduler. One loop drives a periodic ticker, an explicit
//! trigger rendezvous and a pause-request channel, and each cycle runs every
//! registered module in order followed by the message send phase.
//!
//! Pause requests are serviced before ticks and triggers so a pause never
//! queues up behind a slow cycle. A cycle that notices a pause in progress
//! stops between modules; the send pipeline aborts on its own.

pub mod cycle_monitor;
pub mod lifecycle;

pub use cycle_monitor::{CycleFinished, CycleMonitor};
pub use lifecycle::{LifecycleManager, LifecycleState, NeverPause, Pausable};

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use sqlx::PgPool;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{interval_at, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{EngineConfig, PagingConfig};
use crate::constants::engine::{LONG_CYCLE_WARNING, STUCK_CYCLE_WARNING};
use crate::error::{panic_message, EngineError, Result};
use crate::logging::{log_cycle_event, log_module_result};
use crate::message::{MessageDb, MessageSender, MessageStatus, StatusFetcher};
use crate::processing_lock::Updatable;

/// The message phase of a cycle, as seen by the engine.
#[async_trait]
pub trait MessageDispatch: Send + Sync {
    async fn send_messages(&self, token: &CancellationToken) -> Result<()>;

    async fn update_message_status(&self, status: &MessageStatus) -> Result<()>;
}

/// [`MessageDb`] bound to the provider adapters it sends through.
pub struct MessageDispatcher {
    db: MessageDb,
    sender: Arc<dyn MessageSender>,
    fetcher: Arc<dyn StatusFetcher>,
}

impl MessageDispatcher {
    pub fn new(db: MessageDb, sender: Arc<dyn MessageSender>, fetcher: Arc<dyn StatusFetcher>) -> Self {
        Self { db, sender, fetcher }
    }

    pub fn db(&self) -> &MessageDb {
        &self.db
    }
}

#[async_trait]
impl MessageDispatch for MessageDispatcher {
    async fn send_messages(&self, token: &CancellationToken) -> Result<()> {
        self.db
            .send_messages(token, Arc::clone(&self.sender), Arc::clone(&self.fetcher))
            .await
    }

    async fn update_message_status(&self, status: &MessageStatus) -> Result<()> {
        self.db.update_message_status(status).await
    }
}

/// Completed by the loop once it has taken the request.
type Ack = oneshot::Sender<()>;

struct LoopChannels {
    trigger_rx: mpsc::Receiver<Ack>,
    pause_rx: mpsc::Receiver<Ack>,
}

/// Cycle scheduler for the engine modules and the message phase.
pub struct Engine {
    cfg: EngineConfig,
    modules: Vec<Arc<dyn Updatable>>,
    messages: Arc<dyn MessageDispatch>,
    lifecycle: Arc<LifecycleManager>,
    monitor: CycleMonitor,
    trigger_tx: mpsc::Sender<Ack>,
    pause_tx: mpsc::Sender<Ack>,
    /// Held by `run` for as long as the loop is alive.
    channels: Mutex<LoopChannels>,
    /// Cancelled on shutdown and whenever the loop exits.
    halt: CancellationToken,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("cfg", &self.cfg)
            .field("modules", &self.modules.iter().map(|m| m.name()).collect::<Vec<_>>())
            .field("state", &self.lifecycle.state())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// `lifecycle` must be the same manager the message phase watches for
    /// pauses.
    pub fn new(
        cfg: EngineConfig,
        modules: Vec<Arc<dyn Updatable>>,
        messages: Arc<dyn MessageDispatch>,
        lifecycle: Arc<LifecycleManager>,
    ) -> Self {
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let (pause_tx, pause_rx) = mpsc::channel(1);

        Self {
            cfg,
            modules,
            messages,
            lifecycle,
            monitor: CycleMonitor::new(),
            trigger_tx,
            pause_tx,
            channels: Mutex::new(LoopChannels {
                trigger_rx,
                pause_rx,
            }),
            halt: CancellationToken::new(),
        }
    }

    /// Build an engine whose message phase sends through `sender` and
    /// reconciles through `fetcher`.
    pub async fn connect(
        pool: PgPool,
        config: &PagingConfig,
        modules: Vec<Arc<dyn Updatable>>,
        sender: Arc<dyn MessageSender>,
        fetcher: Arc<dyn StatusFetcher>,
    ) -> Result<Self> {
        let lifecycle = Arc::new(LifecycleManager::new());
        let pausable: Arc<dyn Pausable> = lifecycle.clone();
        let db = MessageDb::new(pool, config.messaging.clone(), pausable).await?;

        Ok(Self::new(
            config.engine.clone(),
            modules,
            Arc::new(MessageDispatcher::new(db, sender, fetcher)),
            lifecycle,
        ))
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// ID the next cycle to start will carry.
    pub fn next_cycle_id(&self) -> Uuid {
        self.monitor.next_cycle_id()
    }

    /// Wait for cycle `id` to finish. See [`CycleMonitor::wait_cycle_id`].
    pub async fn wait_cycle_id(&self, id: Uuid, token: &CancellationToken) -> Result<()> {
        self.monitor.wait_cycle_id(id, token).await
    }

    /// Forward an asynchronous provider status callback.
    pub async fn update_message_status(&self, status: &MessageStatus) -> Result<()> {
        self.messages.update_message_status(status).await
    }

    /// Ask for a cycle now.
    ///
    /// Returns once the loop has accepted the request and is about to start
    /// the cycle, or right away if the loop has stopped.
    pub async fn trigger(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        tokio::select! {
            res = self.trigger_tx.send(ack_tx) => {
                if res.is_err() {
                    return;
                }
            }
            _ = self.halt.cancelled() => return,
        }

        tokio::select! {
            _ = ack_rx => {}
            _ = self.halt.cancelled() => {}
        }
    }

    /// Pause the engine, waiting for any running cycle to wind down.
    pub async fn pause(&self, token: &CancellationToken) -> Result<()> {
        self.lifecycle.pause(|| self.request_pause(token)).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.lifecycle.resume(|| async { Ok(()) }).await
    }

    /// Stop the loop and wait for it to exit.
    pub async fn shutdown(&self, token: &CancellationToken) -> Result<()> {
        if self.lifecycle.begin_shutdown() {
            info!("engine shutting down");
        }
        self.halt.cancel();

        tokio::select! {
            _ = self.channels.lock() => {
                info!("engine stopped");
                Ok(())
            }
            _ = token.cancelled() => Err(EngineError::Canceled),
        }
    }

    /// Drive the engine until shutdown or until `token` is cancelled.
    ///
    /// Runs one cycle straight away unless cycles are disabled. Only one
    /// loop may run per engine.
    pub async fn run(&self, token: &CancellationToken) -> Result<()> {
        let mut channels = self
            .channels
            .try_lock()
            .map_err(|_| EngineError::AlreadyRunning)?;
        let LoopChannels {
            trigger_rx,
            pause_rx,
        } = &mut *channels;
        let _halt_on_exit = self.halt.clone().drop_guard();

        let cycle_time = self.cfg.cycle_time();
        info!(
            cycle_time_ms = cycle_time.as_millis() as u64,
            modules = self.modules.len(),
            disable_cycle = self.cfg.disable_cycle,
            "🚀 ENGINE: loop started"
        );

        if self.cfg.disable_cycle {
            info!("engine cycles disabled, answering API requests only");
        } else {
            self.cycle(token, "startup").await;
        }

        let mut ticker = interval_at(tokio::time::Instant::now() + cycle_time, cycle_time);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // pause requests first so they never wait behind a tick
            if let Ok(ack) = pause_rx.try_recv() {
                handle_pause(ack);
                continue;
            }
            if self.halt.is_cancelled() {
                break;
            }
            if token.is_cancelled() {
                info!("engine loop canceled");
                return Err(EngineError::Canceled);
            }

            tokio::select! {
                biased;

                Some(ack) = pause_rx.recv() => handle_pause(ack),
                _ = self.halt.cancelled() => break,
                _ = token.cancelled() => {
                    info!("engine loop canceled");
                    return Err(EngineError::Canceled);
                }
                Some(ack) = trigger_rx.recv() => {
                    let _ = ack.send(());
                    if !self.cfg.disable_cycle {
                        self.cycle(token, "direct").await;
                    }
                }
                _ = ticker.tick(), if !self.cfg.disable_cycle => {
                    self.cycle(token, "interval").await;
                }
            }
        }

        info!("engine loop stopped");
        Ok(())
    }

    async fn request_pause(&self, token: &CancellationToken) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        tokio::select! {
            res = self.pause_tx.send(ack_tx) => res.map_err(|_| EngineError::ShuttingDown)?,
            _ = self.halt.cancelled() => return Err(EngineError::ShuttingDown),
            _ = token.cancelled() => return Err(EngineError::Canceled),
        }

        tokio::select! {
            res = ack_rx => res.map_err(|_| EngineError::ShuttingDown),
            _ = self.halt.cancelled() => Err(EngineError::ShuttingDown),
            _ = token.cancelled() => Err(EngineError::Canceled),
        }
    }

    async fn cycle(&self, token: &CancellationToken, trigger: &str) {
        let finished = self.monitor.start_next_cycle();
        let cycle_id = finished.id();

        if self.lifecycle.is_pausing() {
            info!(cycle_id = %cycle_id, "engine cycle disabled (paused or shutting down)");
            return;
        }
        if self.cfg.log_cycles {
            log_cycle_event(cycle_id, "start", Some(trigger), None);
        }

        let started = Instant::now();
        let start = tokio::time::Instant::now();
        let mut long = interval_at(start + LONG_CYCLE_WARNING, LONG_CYCLE_WARNING);
        let mut stuck = interval_at(start + STUCK_CYCLE_WARNING, STUCK_CYCLE_WARNING);

        let work = self.process_all(token);
        tokio::pin!(work);
        loop {
            tokio::select! {
                _ = &mut work => break,
                _ = long.tick() => {
                    warn!(
                        cycle_id = %cycle_id,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "long engine cycle"
                    );
                }
                _ = stuck.tick() => {
                    error!(
                        cycle_id = %cycle_id,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "engine possibly stuck"
                    );
                }
            }
        }

        let elapsed = started.elapsed();
        if elapsed >= LONG_CYCLE_WARNING {
            warn!(
                cycle_id = %cycle_id,
                elapsed_ms = elapsed.as_millis() as u64,
                "slow cycle finished"
            );
        }

        if self.lifecycle.is_pausing() {
            info!(cycle_id = %cycle_id, "engine cycle aborted (paused or shutting down)");
            return;
        }
        if self.cfg.log_cycles {
            log_cycle_event(cycle_id, "end", Some(trigger), Some(elapsed));
        }
    }

    async fn process_all(&self, token: &CancellationToken) {
        for module in &self.modules {
            if self.lifecycle.is_pausing() {
                return;
            }
            self.process_module(module.as_ref()).await;
        }
        if self.lifecycle.is_pausing() {
            return;
        }
        self.process_messages(token).await;
    }

    /// Run one module under the module timeout.
    ///
    /// Transaction failures are retried until the timeout. Lock contention
    /// is skipped quietly and a panic never escapes.
    async fn process_module(&self, module: &dyn Updatable) {
        let name = module.name();
        let started = Instant::now();
        let timeout = self.cfg.module_timeout();

        let attempts = async {
            loop {
                match module.update_all().await {
                    Err(err) if err.is_transaction_failure() => {
                        debug!(module = %name, error = %err, "retrying module after transaction failure");
                        tokio::task::yield_now().await;
                    }
                    res => return res,
                }
            }
        };
        let outcome = tokio::time::timeout(timeout, AssertUnwindSafe(attempts).catch_unwind()).await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(Ok(Ok(()))) => log_module_result(name, "ok", elapsed, None),
            Ok(Ok(Err(EngineError::NoLock))) => log_module_result(name, "no_lock", elapsed, None),
            Ok(Ok(Err(err))) => {
                error!(module = %name, error = %err, "process module");
                log_module_result(name, "error", elapsed, Some(&err.to_string()));
            }
            Ok(Err(payload)) => {
                let message = panic_message(payload.as_ref());
                error!(module = %name, panic = %message, "PANIC in {name}");
                log_module_result(name, "panic", elapsed, Some(&message));
            }
            Err(_) => {
                let err = EngineError::timeout(name, timeout);
                error!(module = %name, error = %err, "process module");
                log_module_result(name, "timeout", elapsed, None);
            }
        }
    }

    async fn process_messages(&self, token: &CancellationToken) {
        let timeout = self.cfg.message_timeout();
        let res = match tokio::time::timeout(timeout, self.messages.send_messages(token)).await {
            Ok(res) => res,
            Err(_) => Err(EngineError::timeout("send outgoing messages", timeout)),
        };

        match res {
            Ok(()) | Err(EngineError::NoLock) | Err(EngineError::Aborted) => {}
            Err(err) => error!(error = %err, "send outgoing messages"),
        }
    }
}

fn handle_pause(ack: Ack) {
    debug!("pause request acknowledged");
    let _ = ack.send(());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageState;
    use crate::processing_lock::LockType;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct CountingModule {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Updatable for CountingModule {
        fn name(&self) -> &str {
            "counting"
        }

        fn lock_type(&self) -> LockType {
            LockType::Heartbeat
        }

        async fn update_all(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct PanickingModule;

    #[async_trait]
    impl Updatable for PanickingModule {
        fn name(&self) -> &str {
            "panicking"
        }

        fn lock_type(&self) -> LockType {
            LockType::Escalation
        }

        async fn update_all(&self) -> Result<()> {
            panic!("boom");
        }
    }

    struct HangingModule;

    #[async_trait]
    impl Updatable for HangingModule {
        fn name(&self) -> &str {
            "hanging"
        }

        fn lock_type(&self) -> LockType {
            LockType::Rotation
        }

        async fn update_all(&self) -> Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    /// Blocks until released, then reports lock contention.
    #[derive(Default)]
    struct GatedModule {
        gate: Notify,
    }

    #[async_trait]
    impl Updatable for GatedModule {
        fn name(&self) -> &str {
            "gated"
        }

        fn lock_type(&self) -> LockType {
            LockType::Schedule
        }

        async fn update_all(&self) -> Result<()> {
            self.gate.notified().await;
            Err(EngineError::NoLock)
        }
    }

    #[derive(Default)]
    struct CountingDispatch {
        sends: AtomicUsize,
        statuses: AtomicUsize,
    }

    #[async_trait]
    impl MessageDispatch for CountingDispatch {
        async fn send_messages(&self, _token: &CancellationToken) -> Result<()> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            Err(EngineError::NoLock)
        }

        async fn update_message_status(&self, _status: &MessageStatus) -> Result<()> {
            self.statuses.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn quiet_config() -> EngineConfig {
        EngineConfig {
            cycle_time_ms: 60 * 60 * 1000,
            ..EngineConfig::default()
        }
    }

    fn engine_with(
        cfg: EngineConfig,
        modules: Vec<Arc<dyn Updatable>>,
        dispatch: Arc<CountingDispatch>,
    ) -> Arc<Engine> {
        Arc::new(Engine::new(
            cfg,
            modules,
            dispatch,
            Arc::new(LifecycleManager::new()),
        ))
    }

    fn spawn_loop(engine: &Arc<Engine>, token: &CancellationToken) -> tokio::task::JoinHandle<Result<()>> {
        let engine = Arc::clone(engine);
        let token = token.clone();
        tokio::spawn(async move { engine.run(&token).await })
    }

    async fn wait_for_state(engine: &Engine, state: LifecycleState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while engine.state() != state {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("state never reached");
    }

    #[tokio::test]
    async fn test_startup_and_triggered_cycles() {
        let module = Arc::new(CountingModule::default());
        let dispatch = Arc::new(CountingDispatch::default());
        let engine = engine_with(quiet_config(), vec![module.clone() as Arc<dyn Updatable>], dispatch.clone());
        let token = CancellationToken::new();

        let startup = engine.next_cycle_id();
        let handle = spawn_loop(&engine, &token);
        engine.wait_cycle_id(startup, &token).await.unwrap();
        assert_eq!(module.calls.load(Ordering::SeqCst), 1);
        assert_eq!(dispatch.sends.load(Ordering::SeqCst), 1);

        let next = engine.next_cycle_id();
        engine.trigger().await;
        engine.wait_cycle_id(next, &token).await.unwrap();
        assert_eq!(module.calls.load(Ordering::SeqCst), 2);
        assert_eq!(dispatch.sends.load(Ordering::SeqCst), 2);

        engine.shutdown(&token).await.unwrap();
        handle.await.unwrap().unwrap();
        assert_eq!(engine.state(), LifecycleState::ShuttingDown);
    }

    #[tokio::test]
    async fn test_panicking_module_does_not_stop_the_cycle() {
        let module = Arc::new(CountingModule::default());
        let dispatch = Arc::new(CountingDispatch::default());
        let engine = engine_with(
            quiet_config(),
            vec![Arc::new(PanickingModule) as Arc<dyn Updatable>, module.clone()],
            dispatch.clone(),
        );
        let token = CancellationToken::new();

        let startup = engine.next_cycle_id();
        let handle = spawn_loop(&engine, &token);
        engine.wait_cycle_id(startup, &token).await.unwrap();
        assert_eq!(module.calls.load(Ordering::SeqCst), 1);
        assert_eq!(dispatch.sends.load(Ordering::SeqCst), 1);

        // loop is still alive
        let next = engine.next_cycle_id();
        engine.trigger().await;
        engine.wait_cycle_id(next, &token).await.unwrap();
        assert_eq!(module.calls.load(Ordering::SeqCst), 2);

        token.cancel();
        assert!(matches!(handle.await.unwrap(), Err(EngineError::Canceled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_module_times_out() {
        let cfg = EngineConfig {
            module_timeout_seconds: 1,
            ..quiet_config()
        };
        let engine = engine_with(cfg, Vec::new(), Arc::new(CountingDispatch::default()));

        let started = tokio::time::Instant::now();
        engine.process_module(&HangingModule).await;
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_pause_stops_cycle_between_modules() {
        let gated = Arc::new(GatedModule::default());
        let after = Arc::new(CountingModule::default());
        let dispatch = Arc::new(CountingDispatch::default());
        let engine = engine_with(
            quiet_config(),
            vec![gated.clone() as Arc<dyn Updatable>, after.clone()],
            dispatch.clone(),
        );
        let token = CancellationToken::new();
        let handle = spawn_loop(&engine, &token);

        let pause = {
            let engine = Arc::clone(&engine);
            let token = token.clone();
            tokio::spawn(async move { engine.pause(&token).await })
        };
        wait_for_state(&engine, LifecycleState::Pausing).await;
        gated.gate.notify_one();

        pause.await.unwrap().unwrap();
        assert_eq!(engine.state(), LifecycleState::Paused);
        assert_eq!(after.calls.load(Ordering::SeqCst), 0);
        assert_eq!(dispatch.sends.load(Ordering::SeqCst), 0);

        // triggered cycles are skipped while paused
        let skipped = engine.next_cycle_id();
        engine.trigger().await;
        engine.wait_cycle_id(skipped, &token).await.unwrap();
        assert_eq!(after.calls.load(Ordering::SeqCst), 0);

        engine.resume().await.unwrap();
        assert_eq!(engine.state(), LifecycleState::Running);
        gated.gate.notify_one();
        let resumed = engine.next_cycle_id();
        engine.trigger().await;
        engine.wait_cycle_id(resumed, &token).await.unwrap();
        assert_eq!(after.calls.load(Ordering::SeqCst), 1);
        assert_eq!(dispatch.sends.load(Ordering::SeqCst), 1);

        engine.shutdown(&token).await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_api_only_mode_never_cycles() {
        let module = Arc::new(CountingModule::default());
        let dispatch = Arc::new(CountingDispatch::default());
        let cfg = EngineConfig {
            disable_cycle: true,
            ..quiet_config()
        };
        let engine = engine_with(cfg, vec![module.clone() as Arc<dyn Updatable>], dispatch.clone());
        let token = CancellationToken::new();
        let handle = spawn_loop(&engine, &token);

        engine.trigger().await;
        engine.trigger().await;
        engine.pause(&token).await.unwrap();
        assert_eq!(engine.state(), LifecycleState::Paused);
        assert_eq!(module.calls.load(Ordering::SeqCst), 0);
        assert_eq!(dispatch.sends.load(Ordering::SeqCst), 0);

        let status = MessageStatus::new("msg-1", MessageState::Delivered);
        engine.update_message_status(&status).await.unwrap();
        assert_eq!(dispatch.statuses.load(Ordering::SeqCst), 1);

        engine.shutdown(&token).await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_only_one_loop_runs() {
        let engine = engine_with(quiet_config(), Vec::new(), Arc::new(CountingDispatch::default()));
        let token = CancellationToken::new();

        let startup = engine.next_cycle_id();
        let handle = spawn_loop(&engine, &token);
        engine.wait_cycle_id(startup, &token).await.unwrap();

        let second = engine.run(&token).await;
        assert!(matches!(second, Err(EngineError::AlreadyRunning)));

        engine.shutdown(&token).await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_requests_after_shutdown_return() {
        let engine = engine_with(quiet_config(), Vec::new(), Arc::new(CountingDispatch::default()));
        let token = CancellationToken::new();
        let handle = spawn_loop(&engine, &token);

        engine.shutdown(&token).await.unwrap();
        handle.await.unwrap().unwrap();

        tokio::time::timeout(Duration::from_secs(1), engine.trigger())
            .await
            .expect("trigger must not hang after shutdown");
        assert!(matches!(
            engine.pause(&token).await,
            Err(EngineError::ShuttingDown)
        ));
        assert!(matches!(engine.resume().await, Err(EngineError::ShuttingDown)));
    }
}
