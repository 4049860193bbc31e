//! # Outgoing Messages
//!
//! Message model, the per-cycle queue with its throttles, the dedup and
//! bundling reductions, SQL persistence, and the send pipeline that ties
//! them together.

pub mod bundle;
pub mod dedup;
pub mod queue;
pub mod send;
pub mod status;
pub mod store;
pub mod throttle;
pub mod throttle_config;
pub mod types;

pub use bundle::{bundle_alert_messages, bundle_status_messages};
pub use dedup::{dedup_alerts, dedup_on_call_notifications, dedup_status_messages, Deduped};
pub use queue::{Queue, QueueOptions};
pub use send::{
    MessageDb, MessageSender, SendOutcome, StatusFetcher, MESSAGE_MODULE_VERSION,
};
pub use status::{MessageState, MessageStatus, OutgoingStatus};
pub use store::{HousekeepingReport, MessageStore};
pub use throttle::Throttle;
pub use throttle_config::{
    ScopedThrottleBuilder, ThrottleConfig, ThrottleConfigBuilder, ThrottleRule, ThrottleRules,
};
pub use types::{Dest, DestType, Message, MessageType};
