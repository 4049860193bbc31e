use std::future::Future;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

use crate::error::{EngineError, Result};

/// Run states of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Running,
    Pausing,
    Paused,
    ShuttingDown,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Pausing => "pausing",
            Self::Paused => "paused",
            Self::ShuttingDown => "shutting_down",
        }
    }

    /// Anything other than `Running` stops new work from starting.
    pub fn is_pausing(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read side of the pause protocol, handed to long running work.
#[async_trait]
pub trait Pausable: Send + Sync {
    /// True while a pause is in progress, the engine is paused, or it is
    /// shutting down.
    fn is_pausing(&self) -> bool;

    /// Resolves as soon as `is_pausing` becomes true; immediately if it
    /// already is.
    async fn pause_wait(&self);
}

/// Pause, resume and shutdown transitions with strong ordering.
///
/// Transitions are serialized: a pause runs to completion (or fails and
/// reverts to `Running`) before a resume or another pause is looked at.
/// Shutdown is terminal and wins over everything else.
#[derive(Debug)]
pub struct LifecycleManager {
    state: watch::Sender<LifecycleState>,
    transition: Mutex<()>,
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self {
            state: watch::Sender::new(LifecycleState::Running),
            transition: Mutex::new(()),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Enter `Pausing`, run `drain`, then settle in `Paused`.
    ///
    /// If `drain` fails the manager goes back to `Running` and the error is
    /// returned. Pausing an already paused manager is a no-op.
    pub async fn pause<F, Fut>(&self, drain: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let _guard = self.transition.lock().await;
        match self.state() {
            LifecycleState::ShuttingDown => return Err(EngineError::ShuttingDown),
            LifecycleState::Paused => return Ok(()),
            LifecycleState::Running | LifecycleState::Pausing => {}
        }

        self.set(LifecycleState::Pausing);
        let res = drain().await;

        // shutdown may have started while draining
        if self.state() == LifecycleState::ShuttingDown {
            return Err(EngineError::ShuttingDown);
        }
        match res {
            Ok(()) => {
                self.set(LifecycleState::Paused);
                info!("engine paused");
                Ok(())
            }
            Err(err) => {
                self.set(LifecycleState::Running);
                Err(err)
            }
        }
    }

    /// Leave `Paused`, running `restart` first. Always ends in `Running`
    /// unless shutting down.
    pub async fn resume<F, Fut>(&self, restart: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let _guard = self.transition.lock().await;
        match self.state() {
            LifecycleState::ShuttingDown => return Err(EngineError::ShuttingDown),
            LifecycleState::Running => return Ok(()),
            LifecycleState::Pausing | LifecycleState::Paused => {}
        }

        let res = restart().await;
        self.set(LifecycleState::Running);
        info!("engine resumed");
        res
    }

    /// Move to `ShuttingDown`. Returns false if shutdown had already begun.
    pub fn begin_shutdown(&self) -> bool {
        let previous = self.state.send_replace(LifecycleState::ShuttingDown);
        if previous == LifecycleState::ShuttingDown {
            return false;
        }
        debug!(previous = %previous, "lifecycle shutting down");
        true
    }

    fn set(&self, next: LifecycleState) {
        self.state.send_if_modified(|current| {
            if *current == LifecycleState::ShuttingDown || *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

#[async_trait]
impl Pausable for LifecycleManager {
    fn is_pausing(&self) -> bool {
        self.state().is_pausing()
    }

    async fn pause_wait(&self) {
        let mut rx = self.state.subscribe();
        // the sender lives as long as `self`, so this can't observe a close
        let _ = rx.wait_for(LifecycleState::is_pausing).await;
    }
}

/// A pausable that never pauses, for running pipeline pieces standalone.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverPause;

#[async_trait]
impl Pausable for NeverPause {
    fn is_pausing(&self) -> bool {
        false
    }

    async fn pause_wait(&self) {
        std::future::pending::<()>().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_pause_and_resume() {
        let mgr = LifecycleManager::new();
        assert!(!mgr.is_pausing());

        mgr.pause(|| async {
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(mgr.state(), LifecycleState::Paused);
        assert!(mgr.is_pausing());

        mgr.resume(|| async { Ok(()) }).await.unwrap();
        assert_eq!(mgr.state(), LifecycleState::Running);
    }

    #[tokio::test]
    async fn test_pausing_is_visible_while_draining() {
        let mgr = LifecycleManager::new();
        mgr.pause(|| async {
            assert_eq!(mgr.state(), LifecycleState::Pausing);
            assert!(mgr.is_pausing());
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_failed_pause_reverts_to_running() {
        let mgr = LifecycleManager::new();
        let err = mgr
            .pause(|| async { Err(EngineError::Canceled) })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Canceled));
        assert_eq!(mgr.state(), LifecycleState::Running);
    }

    #[tokio::test]
    async fn test_shutdown_is_terminal() {
        let mgr = LifecycleManager::new();
        assert!(mgr.begin_shutdown());
        assert!(!mgr.begin_shutdown());
        assert!(mgr.is_pausing());

        assert!(matches!(
            mgr.pause(|| async { Ok(()) }).await,
            Err(EngineError::ShuttingDown)
        ));
        assert!(matches!(
            mgr.resume(|| async { Ok(()) }).await,
            Err(EngineError::ShuttingDown)
        ));
        assert_eq!(mgr.state(), LifecycleState::ShuttingDown);
    }

    #[tokio::test]
    async fn test_pause_wait_wakes_on_pause() {
        let mgr = Arc::new(LifecycleManager::new());

        let waiter = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move { mgr.pause_wait().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        mgr.pause(|| async { Ok(()) }).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("pause_wait should resolve")
            .unwrap();

        // already paused: resolves immediately
        tokio::time::timeout(Duration::from_millis(100), mgr.pause_wait())
            .await
            .unwrap();
    }
}
