//! Message builders shared by the integration tests.

#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use paging_core::message::{Dest, DestType, Message, MessageType};

/// Fixed reference time for deterministic scenarios.
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap()
}

pub fn at_hour(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, hour, 0, 0).unwrap()
}

/// Builder pattern for test messages
pub struct MessageBuilder {
    msg: Message,
}

impl MessageBuilder {
    pub fn new(id: &str, message_type: MessageType) -> Self {
        Self {
            msg: Message::new(
                id,
                message_type,
                Dest::new(DestType::Sms, "dest", ""),
                base_time(),
            ),
        }
    }

    pub fn alert(id: &str, alert_id: i64) -> Self {
        Self::new(id, MessageType::AlertNotification).with_alert(alert_id)
    }

    pub fn dest(mut self, dest_type: DestType, dest_id: &str) -> Self {
        self.msg.dest = Dest::new(dest_type, dest_id, format!("value-{dest_id}"));
        self
    }

    pub fn with_alert(mut self, alert_id: i64) -> Self {
        self.msg.alert_id = alert_id;
        self
    }

    pub fn with_log(mut self, alert_log_id: i64) -> Self {
        self.msg.alert_log_id = alert_log_id;
        self
    }

    pub fn user(mut self, user_id: &str) -> Self {
        self.msg.user_id = user_id.to_string();
        self
    }

    pub fn service(mut self, service_id: &str) -> Self {
        self.msg.service_id = service_id.to_string();
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.msg.created_at = at;
        self
    }

    pub fn created_secs(self, secs: i64) -> Self {
        self.created_at(base_time() + Duration::seconds(secs))
    }

    pub fn sent_at(mut self, at: DateTime<Utc>) -> Self {
        self.msg.sent_at = Some(at);
        self
    }

    pub fn build(self) -> Message {
        self.msg
    }
}

/// IDs of `msgs`, sorted, for order-insensitive comparison.
pub fn sorted_ids(msgs: &[Message]) -> Vec<String> {
    let mut ids: Vec<String> = msgs.iter().map(|m| m.id.clone()).collect();
    ids.sort();
    ids
}
