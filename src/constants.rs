//! # System Constants
//!
//! Operational boundaries of the dispatch engine. Values that operators tune
//! live in [`crate::config`]; these are fixed by the protocol between engine
//! instances and must match across every process sharing a database.

use std::time::Duration;

/// Advisory lock keys shared by every instance.
pub mod advisory_locks {
    use super::Duration;

    /// Held exclusively by the migration runner, shared by every processing lock.
    pub const GLOBAL_MIGRATE: i64 = 0x1337;

    /// Held by the single instance currently sending messages.
    pub const GLOBAL_MESSAGE_SENDING: i64 = 0x1338;

    /// Delay between attempts while waiting for a session advisory lock.
    pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);
}

/// Message queue constants
pub mod queue {
    use super::Duration;

    /// Minimum time between two messages to the same destination.
    pub const DESTINATION_COOLDOWN: Duration = Duration::from_secs(60);

    /// Sent messages newer than this are loaded into every queue snapshot.
    pub const SENT_HISTORY_WINDOW: Duration = Duration::from_secs(10 * 60);

    /// Concurrent sends per destination type.
    pub const WORKERS_PER_TYPE: usize = 5;
}

/// Engine loop constants
pub mod engine {
    use super::Duration;

    /// Number of cycle IDs remembered by the cycle monitor.
    pub const CYCLE_HISTORY_DEPTH: usize = 10;

    pub const DEFAULT_CYCLE_TIME: Duration = Duration::from_secs(5);

    pub const MODULE_TIMEOUT: Duration = Duration::from_secs(30);

    pub const MESSAGE_PHASE_TIMEOUT: Duration = Duration::from_secs(60);

    /// A cycle running longer than this is logged as slow.
    pub const LONG_CYCLE_WARNING: Duration = Duration::from_secs(5);

    /// A cycle running longer than this is logged as possibly stuck.
    pub const STUCK_CYCLE_WARNING: Duration = Duration::from_secs(60);
}

/// Provider interaction constants
pub mod provider {
    use super::Duration;

    /// Timeout for a single provider send or status call.
    pub const CALL_TIMEOUT: Duration = Duration::from_secs(5);

    /// Sequence value meaning "no ordering information".
    pub const NO_SEQUENCE: i32 = -1;
}
