use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Stored timestamps are RFC 3339 UTC with fixed millisecond precision, so
/// string order is time order.
pub fn format_iso(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now_iso() -> String {
    format_iso(Utc::now())
}

/// Parses a provider unix timestamp (seconds, sent as a string).
pub fn iso_from_unix(raw: &str) -> Option<String> {
    let secs = raw.trim().parse::<i64>().ok()?;
    DateTime::<Utc>::from_timestamp(secs, 0).map(format_iso)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "in" => Some(Direction::In),
            "out" => Some(Direction::Out),
            _ => None,
        }
    }
}

/// Delivery state of a message as reported by the provider.
///
/// Ranked `Sent < Delivered < Read`; `Failed` sits outside the ladder and is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    #[default]
    Sent,
    Delivered,
    Read,
    Failed,
}

impl DeliveryStatus {
    pub const ALL: [DeliveryStatus; 4] = [
        DeliveryStatus::Sent,
        DeliveryStatus::Delivered,
        DeliveryStatus::Read,
        DeliveryStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
            DeliveryStatus::Failed => "failed",
        }
    }

    /// Maps a provider status string. Anything unrecognised counts as `sent`.
    pub fn normalize(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "delivered" => DeliveryStatus::Delivered,
            "read" => DeliveryStatus::Read,
            "failed" => DeliveryStatus::Failed,
            _ => DeliveryStatus::Sent,
        }
    }

    fn rank(self) -> u8 {
        match self {
            DeliveryStatus::Sent => 0,
            DeliveryStatus::Delivered => 1,
            DeliveryStatus::Read => 2,
            DeliveryStatus::Failed => 3,
        }
    }

    /// Whether a message currently in `self` may be moved to `next`.
    ///
    /// Re-applying the current status is never a transition. With
    /// `forward_only` off every other change is allowed (last writer wins).
    pub fn can_transition_to(self, next: DeliveryStatus, forward_only: bool) -> bool {
        if self == next {
            return false;
        }
        if !forward_only {
            return true;
        }
        if self == DeliveryStatus::Failed {
            return false;
        }
        next == DeliveryStatus::Failed || next.rank() > self.rank()
    }

    /// Statuses a message may currently hold for an update to `next` to apply.
    pub fn allowed_predecessors(next: DeliveryStatus, forward_only: bool) -> Vec<DeliveryStatus> {
        Self::ALL
            .into_iter()
            .filter(|current| current.can_transition_to(next, forward_only))
            .collect()
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub wa_id: String,
    pub name: String,
    pub created_at: String,
    pub last_message_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub wa_id: String,
    pub direction: Direction,
    pub text: String,
    pub at: String,
    pub status: DeliveryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_name: Option<String>,
}

/// A message about to be stored; the store assigns the local id.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub wa_id: String,
    pub direction: Direction,
    pub text: String,
    pub at: String,
    pub status: DeliveryStatus,
    pub provider_message_id: Option<String>,
    pub template_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub wa_id: String,
    pub name: String,
    pub created_at: String,
    pub last_message_at: Option<String>,
    pub last: Option<Message>,
}

/// Outcome of a status update keyed by provider message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusUpdate {
    Applied,
    /// The message exists but already holds this status, or the change
    /// would regress it.
    Unchanged,
    UnknownMessage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateRef {
    pub name: String,
    pub language: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendOutcome {
    pub used_template: bool,
    pub provider_message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<TemplateRef>,
    pub message: Message,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateOutcome {
    pub provider_message_id: String,
    pub template: TemplateRef,
    pub message: Message,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationBody {
    pub wa_id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageBody {
    pub wa_id: String,
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendTemplateBody {
    pub wa_id: String,
}
