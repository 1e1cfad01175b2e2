//! Row shapes of the hosted schema and the push gateway payloads.
//!
//! Field names match the remote columns so rows decode straight from the
//! backend's JSON representation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::domain::{ConversationId, MediaKind, MessageId, UserId};

pub const UNKNOWN_USER_NAME: &str = "Usuario Desconocido";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub participant_1_id: UserId,
    pub participant_2_id: UserId,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    /// Denormalized by the backend; never written from the client.
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_message_sender_id: Option<UserId>,
}

impl Conversation {
    /// The participant that is not `self_id`, or `None` when `self_id` is not
    /// part of the conversation.
    pub fn other_participant(&self, self_id: UserId) -> Option<UserId> {
        if self.participant_1_id == self_id {
            Some(self.participant_2_id)
        } else if self.participant_2_id == self_id {
            Some(self.participant_1_id)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NewConversation {
    pub participant_1_id: UserId,
    pub participant_2_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    /// Empty for media-only messages; a null column decodes as empty too.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub content: String,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub media_type: Option<MediaKind>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
}

fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// Insert payload for `messages`. Absent media is sent as explicit nulls.
#[derive(Debug, Clone, Serialize)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub media_url: Option<String>,
    pub media_type: Option<MediaKind>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: UserId,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

/// Display data for a conversation counterpart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSummary {
    pub user_id: Option<UserId>,
    pub name: String,
    pub avatar_url: Option<String>,
}

impl ProfileSummary {
    pub fn unknown() -> Self {
        Self {
            user_id: None,
            name: UNKNOWN_USER_NAME.to_string(),
            avatar_url: None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.user_id.is_none()
    }
}

impl From<Profile> for ProfileSummary {
    fn from(profile: Profile) -> Self {
        let name = profile
            .full_name
            .filter(|name| !name.trim().is_empty())
            .or(profile.email)
            .unwrap_or_else(|| UNKNOWN_USER_NAME.to_string());
        Self {
            user_id: Some(profile.id),
            name,
            avatar_url: profile.avatar_url,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushToken {
    pub user_id: UserId,
    pub push_token: String,
    #[serde(default)]
    pub device_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PushPriority {
    Default,
    Normal,
    #[default]
    High,
}

/// One entry of a push gateway batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    pub to: String,
    pub title: String,
    pub body: String,
    pub data: Value,
    pub priority: PushPriority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sound: Option<String>,
}

/// Per-message delivery result returned by the push gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushTicket {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl PushTicket {
    pub fn is_error(&self) -> bool {
        self.status.eq_ignore_ascii_case("error")
    }
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
