use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::{ChatType, UserId};

/// One connected device/session of a user on a presence channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PresenceMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub online_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_ref: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PresenceMeta {
    pub fn online(user_id: UserId, online_at: DateTime<Utc>) -> Self {
        Self {
            user_id: Some(user_id),
            online_at: Some(online_at),
            presence_ref: None,
            extra: Map::new(),
        }
    }
}

/// Presence key (user id) to the metadata of each of that user's live sessions.
pub type PresenceState = HashMap<UserId, Vec<PresenceMeta>>;

/// Payload tracked on the presence channel right after it subscribes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitialPresence {
    pub user_id: UserId,
    pub online_at: DateTime<Utc>,
}

pub const MESSAGE_EVENT: &str = "message";
pub const MESSAGE_UPDATE_EVENT: &str = "message_update";
pub const MESSAGE_STATUS_EVENT: &str = "message_status";
pub const TYPING_EVENT: &str = "typing";
pub const GROUP_UPDATE_EVENT: &str = "group_update";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

impl BroadcastEnvelope {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: "broadcast".to_string(),
            event: event.into(),
            payload,
        }
    }
}

fn default_typing() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypingPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<UserId>,
    #[serde(default)]
    pub chat_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_type: Option<ChatType>,
    #[serde(default = "default_typing")]
    pub typing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RowEvent {
    Insert,
    Update,
    Delete,
    #[serde(rename = "*")]
    All,
}

impl RowEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            RowEvent::Insert => "INSERT",
            RowEvent::Update => "UPDATE",
            RowEvent::Delete => "DELETE",
            RowEvent::All => "*",
        }
    }

    pub fn matches(self, actual: RowEvent) -> bool {
        self == RowEvent::All || self == actual
    }
}

/// A watched table row was inserted, updated or deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    #[serde(rename = "type")]
    pub event: RowEvent,
    #[serde(default = "default_schema")]
    pub schema: String,
    pub table: String,
    #[serde(default, rename = "record")]
    pub new: Value,
    #[serde(default, rename = "old_record")]
    pub old: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_timestamp: Option<DateTime<Utc>>,
}

fn default_schema() -> String {
    "public".to_string()
}

impl RowChange {
    pub fn new(event: RowEvent, table: impl Into<String>, new: Value) -> Self {
        Self {
            event,
            schema: default_schema(),
            table: table.into(),
            new,
            old: Value::Null,
            commit_timestamp: None,
        }
    }

    /// String value of `column` in the new record, if present.
    pub fn new_field(&self, column: &str) -> Option<&str> {
        self.new.get(column).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationEvent {
    NewMessage,
    NewGroupMessage,
    AddedToGroup,
    MessageStatusUpdated,
    GroupMessageStatusUpdated,
}

impl NotificationEvent {
    pub const ALL: [NotificationEvent; 5] = [
        NotificationEvent::NewMessage,
        NotificationEvent::NewGroupMessage,
        NotificationEvent::AddedToGroup,
        NotificationEvent::MessageStatusUpdated,
        NotificationEvent::GroupMessageStatusUpdated,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            NotificationEvent::NewMessage => "new_message_notification",
            NotificationEvent::NewGroupMessage => "new_group_message_notification",
            NotificationEvent::AddedToGroup => "new_group_added_notification",
            NotificationEvent::MessageStatusUpdated => "message_status_updated",
            NotificationEvent::GroupMessageStatusUpdated => "group_message_status_updated",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdateRequest {
    pub user_id: UserId,
    pub is_online: bool,
}
