use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kinds of outgoing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    AlertNotification,
    AlertNotificationBundle,
    AlertStatusUpdate,
    AlertStatusUpdateBundle,
    TestNotification,
    VerificationMessage,
    ScheduleOnCallNotification,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AlertNotification => "alert_notification",
            Self::AlertNotificationBundle => "alert_notification_bundle",
            Self::AlertStatusUpdate => "alert_status_update",
            Self::AlertStatusUpdateBundle => "alert_status_update_bundle",
            Self::TestNotification => "test_notification",
            Self::VerificationMessage => "verification_message",
            Self::ScheduleOnCallNotification => "schedule_on_call_notification",
        }
    }

    /// Queue priority tier; lower is sent first.
    pub fn priority(&self) -> u8 {
        match self {
            Self::AlertNotification | Self::AlertNotificationBundle => 0,
            Self::VerificationMessage => 1,
            Self::TestNotification => 2,
            Self::AlertStatusUpdate | Self::AlertStatusUpdateBundle => 3,
            Self::ScheduleOnCallNotification => 4,
        }
    }

    pub fn is_alert(&self) -> bool {
        matches!(self, Self::AlertNotification | Self::AlertNotificationBundle)
    }

    pub fn is_status_update(&self) -> bool {
        matches!(
            self,
            Self::AlertStatusUpdate | Self::AlertStatusUpdateBundle
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "alert_notification" => Ok(Self::AlertNotification),
            "alert_notification_bundle" => Ok(Self::AlertNotificationBundle),
            "alert_status_update" => Ok(Self::AlertStatusUpdate),
            "alert_status_update_bundle" => Ok(Self::AlertStatusUpdateBundle),
            "test_notification" => Ok(Self::TestNotification),
            "verification_message" => Ok(Self::VerificationMessage),
            "schedule_on_call_notification" => Ok(Self::ScheduleOnCallNotification),
            _ => Err(format!("Invalid message type: {s}")),
        }
    }
}

/// Delivery channels a destination can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestType {
    Sms,
    Voice,
    Email,
    Webhook,
    SlackChannel,
    SlackDm,
    SlackUserGroup,
}

impl DestType {
    pub const ALL: [DestType; 7] = [
        Self::Sms,
        Self::Voice,
        Self::Email,
        Self::Webhook,
        Self::SlackChannel,
        Self::SlackDm,
        Self::SlackUserGroup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sms => "sms",
            Self::Voice => "voice",
            Self::Email => "email",
            Self::Webhook => "webhook",
            Self::SlackChannel => "slack_channel",
            Self::SlackDm => "slack_dm",
            Self::SlackUserGroup => "slack_user_group",
        }
    }

    /// Destinations owned by a user contact method rather than a shared channel.
    pub fn is_user_contact_method(&self) -> bool {
        matches!(
            self,
            Self::Sms | Self::Voice | Self::Email | Self::Webhook | Self::SlackDm
        )
    }
}

impl fmt::Display for DestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DestType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sms" => Ok(Self::Sms),
            "voice" => Ok(Self::Voice),
            "email" => Ok(Self::Email),
            "webhook" => Ok(Self::Webhook),
            "slack_channel" => Ok(Self::SlackChannel),
            "slack_dm" => Ok(Self::SlackDm),
            "slack_user_group" => Ok(Self::SlackUserGroup),
            _ => Err(format!("Invalid destination type: {s}")),
        }
    }
}

/// A notification target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dest {
    pub dest_type: DestType,
    /// Stable identity, e.g. a contact method or channel ID.
    pub id: String,
    /// Raw contact value such as a phone number; never used as a limiting key.
    pub value: String,
}

impl Dest {
    pub fn new(dest_type: DestType, id: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            dest_type,
            id: id.into(),
            value: value.into(),
        }
    }

    /// Key used for rate limiting: value always cleared, ID cleared on request.
    pub fn redacted(&self, ignore_id: bool) -> Dest {
        Dest {
            dest_type: self.dest_type,
            id: if ignore_id {
                String::new()
            } else {
                self.id.clone()
            },
            value: String::new(),
        }
    }
}

/// A notification awaiting (or past) delivery.
///
/// A message with `sent_at` set is history and is never modified by the
/// queue, throttles, or dedup passes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub message_type: MessageType,
    pub dest: Dest,
    pub alert_id: i64,
    pub alert_log_id: i64,
    pub verify_id: String,
    pub user_id: String,
    pub service_id: String,
    pub schedule_id: String,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    /// Alerts referenced by a status-update bundle.
    pub status_alert_ids: Vec<i64>,
    pub status_count: usize,
}

impl Message {
    pub fn new(
        id: impl Into<String>,
        message_type: MessageType,
        dest: Dest,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            message_type,
            dest,
            alert_id: 0,
            alert_log_id: 0,
            verify_id: String::new(),
            user_id: String::new(),
            service_id: String::new(),
            schedule_id: String::new(),
            created_at,
            sent_at: None,
            status_alert_ids: Vec::new(),
            status_count: 0,
        }
    }

    pub fn is_sent(&self) -> bool {
        self.sent_at.is_some()
    }

    pub fn is_pending(&self) -> bool {
        self.sent_at.is_none()
    }
}
