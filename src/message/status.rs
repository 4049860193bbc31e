use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::provider::NO_SEQUENCE;

/// Provider-reported delivery state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    /// Accepted by the provider, not yet sent onward.
    Active,
    Sent,
    Delivered,
    FailedTemp,
    FailedPerm,
}

impl MessageState {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::FailedTemp | Self::FailedPerm)
    }

    /// Row status written for a non-failure state.
    pub fn outgoing_status(&self) -> Option<OutgoingStatus> {
        match self {
            Self::Active => Some(OutgoingStatus::QueuedRemotely),
            Self::Sent => Some(OutgoingStatus::Sent),
            Self::Delivered => Some(OutgoingStatus::Delivered),
            Self::FailedTemp | Self::FailedPerm => None,
        }
    }
}

/// `last_status` of an outgoing message row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutgoingStatus {
    Pending,
    /// Leased by a sender until its deadline.
    Sending,
    QueuedRemotely,
    Sent,
    Delivered,
    Failed,
    /// Folded into another message.
    Bundled,
}

impl OutgoingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::QueuedRemotely => "queued_remotely",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Bundled => "bundled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Failed | Self::Bundled)
    }
}

impl fmt::Display for OutgoingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OutgoingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "sending" => Ok(Self::Sending),
            "queued_remotely" => Ok(Self::QueuedRemotely),
            "sent" => Ok(Self::Sent),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            "bundled" => Ok(Self::Bundled),
            _ => Err(format!("Invalid outgoing message status: {s}")),
        }
    }
}

/// Result of a send, a status lookup, or an asynchronous provider callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageStatus {
    /// Outgoing message ID; may be empty when only the provider ID is known.
    pub id: String,
    pub provider_message_id: Option<String>,
    pub state: MessageState,
    pub details: String,
    /// Provider ordering; updates with a lower sequence than stored are ignored.
    pub sequence: i32,
}

impl MessageStatus {
    pub fn new(id: impl Into<String>, state: MessageState) -> Self {
        Self {
            id: id.into(),
            provider_message_id: None,
            state,
            details: String::new(),
            sequence: 0,
        }
    }

    pub fn with_provider_id(mut self, provider_message_id: impl Into<String>) -> Self {
        self.provider_message_id = Some(provider_message_id.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }

    /// Status recorded by the stuck-message reconciler: unordered, and a
    /// temporary failure this late is final.
    pub fn into_reconciled(mut self) -> Self {
        if self.state == MessageState::FailedTemp {
            self.state = MessageState::FailedPerm;
        }
        self.sequence = NO_SEQUENCE;
        self
    }
}
