use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::Message;

/// Commands sent FROM client TO server over a conversation socket.
///
/// Unknown fields are tolerated; an unknown `action` fails to parse and the
/// frame is dropped by the connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ChatCommand {
    /// Post a new message. `temp_id` is echoed back on `new_message`.
    Send {
        #[serde(default)]
        message: String,
        #[serde(default)]
        temp_id: Option<Value>,
    },

    /// Mark a message as delivered to this client
    Delivered { message_id: i64 },

    /// Mark a message as read by this client
    Read { message_id: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// Events sent over a conversation socket to every connection in the group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ChatEvent {
    /// A participant connected or disconnected
    Presence { user: String, status: PresenceStatus },

    /// A message was persisted
    NewMessage {
        message: MessageSnapshot,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        temp_id: Option<Value>,
    },

    /// A message transitioned to delivered
    Delivered { message: DeliveredMark },

    /// A message transitioned to read
    Read { message: ReadMark },
}

/// Full message state as broadcast on `new_message`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSnapshot {
    pub id: i64,
    pub sender: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
}

impl From<&Message> for MessageSnapshot {
    fn from(m: &Message) -> Self {
        Self {
            id: m.id,
            sender: m.sender.clone(),
            content: m.content.clone(),
            created_at: m.created_at,
            delivered_at: m.delivered_at,
            read_at: m.read_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveredMark {
    pub id: i64,
    pub delivered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadMark {
    pub id: i64,
    pub read_at: DateTime<Utc>,
}
