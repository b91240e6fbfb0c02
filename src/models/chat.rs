use chrono::{ DateTime, TimeZone, Utc };
use serde::{ Serialize, Deserialize };
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

pub const CONVERSATION_ID_SEPARATOR: char = '_';

/// Milliseconds since the Unix epoch.
///
/// Server-assigned values come from the document store and are strictly
/// increasing within one store; local values come from the wall clock.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    pub fn from_millis(millis: i64) -> Self {
        Timestamp(millis)
    }

    pub fn now() -> Self {
        Timestamp(Utc::now().timestamp_millis())
    }

    pub fn as_millis(&self) -> i64 {
        self.0
    }

    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.0).single()
    }
}

/// Canonical key for an unordered pair of participants.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    /// Both call orders produce the same id: smaller id, `_`, larger id.
    pub fn for_pair(a: &str, b: &str) -> Self {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        ConversationId(format!("{}{}{}", first, CONVERSATION_ID_SEPARATOR, second))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub participants: [String; 2],
    pub last_message: String,
    pub last_message_timestamp: Timestamp,
    pub last_sender: String,
    pub unread_counts: BTreeMap<String, u64>,
}

impl ConversationSummary {
    pub fn id(&self) -> ConversationId {
        ConversationId::for_pair(&self.participants[0], &self.participants[1])
    }

    pub fn unread_for(&self, user_id: &str) -> u64 {
        self.unread_counts.get(user_id).copied().unwrap_or(0)
    }

    /// The participant that is not `user_id`. `None` for a self-chat or when
    /// `user_id` is not a participant at all.
    pub fn other_participant(&self, user_id: &str) -> Option<&str> {
        if !self.participants.iter().any(|p| p == user_id) {
            return None;
        }
        self.participants
            .iter()
            .find(|p| p.as_str() != user_id)
            .map(String::as_str)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub sender_id: String,
    pub recipient_id: String,
    pub text: String,
    pub timestamp: Timestamp,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<Uuid>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    pub name: String,
    pub username: String,
    #[serde(default, rename = "photoURL", skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
    #[serde(default)]
    pub verified: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Shown locally, not yet seen in a store snapshot.
    Pending,
    /// Delivered by the store with its server timestamp.
    Committed,
    /// `summary_written` is set when only the message write is still missing.
    Failed {
        reason: String,
        summary_written: bool,
    },
}

/// One row of a conversation view's projection.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalMessage {
    pub client_id: Option<Uuid>,
    pub sender_id: String,
    pub recipient_id: String,
    pub text: String,
    pub timestamp: Timestamp,
    pub status: DeliveryStatus,
}

impl LocalMessage {
    pub fn committed(message: Message) -> Self {
        LocalMessage {
            client_id: message.client_id,
            sender_id: message.sender_id,
            recipient_id: message.recipient_id,
            text: message.text,
            timestamp: message.timestamp,
            status: DeliveryStatus::Committed,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == DeliveryStatus::Pending
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, DeliveryStatus::Failed { .. })
    }
}
