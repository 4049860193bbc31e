use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::constants::engine::CYCLE_HISTORY_DEPTH;
use crate::error::{EngineError, Result};

/// Remembers the most recent engine cycle IDs so callers can wait for a
/// specific cycle to finish.
///
/// The newest entry is always the cycle that has not started yet. All state
/// sits behind one mutex; waiting happens outside of it.
///
/// ```rust
/// use paging_core::engine::CycleMonitor;
/// use tokio_util::sync::CancellationToken;
///
/// # tokio_test::block_on(async {
/// let monitor = CycleMonitor::new();
/// let id = monitor.next_cycle_id();
///
/// let finished = monitor.start_next_cycle();
/// assert_eq!(finished.id(), id);
/// assert_ne!(monitor.next_cycle_id(), id);
/// drop(finished);
///
/// monitor.wait_cycle_id(id, &CancellationToken::new()).await.unwrap();
/// # });
/// ```
#[derive(Debug)]
pub struct CycleMonitor {
    inner: Mutex<CycleRing>,
}

#[derive(Debug)]
struct CycleRing {
    depth: usize,
    order: VecDeque<Uuid>,
    done: HashMap<Uuid, CancellationToken>,
}

impl CycleRing {
    fn mint(&mut self) -> Uuid {
        let id = Uuid::new_v4();
        self.order.push_back(id);
        self.done.insert(id, CancellationToken::new());
        while self.order.len() > self.depth {
            if let Some(evicted) = self.order.pop_front() {
                self.done.remove(&evicted);
            }
        }
        id
    }

    fn head(&self) -> Uuid {
        // never empty: one ID is minted on construction and each start mints
        // the next before returning
        self.order.back().copied().unwrap_or_default()
    }
}

/// Marks a started cycle as finished when dropped.
#[derive(Debug)]
#[must_use = "the cycle is finished as soon as this is dropped"]
pub struct CycleFinished {
    id: Uuid,
    done: CancellationToken,
}

impl CycleFinished {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Drop for CycleFinished {
    fn drop(&mut self) {
        self.done.cancel();
    }
}

impl Default for CycleMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl CycleMonitor {
    pub fn new() -> Self {
        Self::with_depth(CYCLE_HISTORY_DEPTH)
    }

    pub fn with_depth(depth: usize) -> Self {
        let mut ring = CycleRing {
            depth: depth.max(1),
            order: VecDeque::with_capacity(depth + 1),
            done: HashMap::with_capacity(depth + 1),
        };
        ring.mint();
        Self {
            inner: Mutex::new(ring),
        }
    }

    /// ID of the next cycle to start.
    pub fn next_cycle_id(&self) -> Uuid {
        self.inner.lock().head()
    }

    /// Begin the pending cycle and mint the one after it, evicting the
    /// oldest remembered ID when the history is full.
    pub fn start_next_cycle(&self) -> CycleFinished {
        let mut ring = self.inner.lock();
        let id = ring.head();
        let done = ring.done.get(&id).cloned().unwrap_or_default();
        ring.mint();
        CycleFinished { id, done }
    }

    /// Wait until cycle `id` has finished.
    ///
    /// Unknown IDs, whether evicted or never issued, fail right away with
    /// [`EngineError::UnknownCycle`].
    pub async fn wait_cycle_id(&self, id: Uuid, token: &CancellationToken) -> Result<()> {
        let done = self
            .inner
            .lock()
            .done
            .get(&id)
            .cloned()
            .ok_or(EngineError::UnknownCycle(id))?;

        tokio::select! {
            _ = done.cancelled() => Ok(()),
            _ = token.cancelled() => Err(EngineError::Canceled),
        }
    }

    /// Number of cycle IDs currently remembered.
    pub fn history_len(&self) -> usize {
        self.inner.lock().order.len()
    }
}
