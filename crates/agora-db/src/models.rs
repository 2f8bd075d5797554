//! Database row types — these map directly to SQLite rows.
//! Distinct from agora-types API models to keep the DB layer independent.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};

use agora_types::models::{Message, Participant, User};

pub struct UserRow {
    pub id: i64,
    pub username: String,
    pub created_at: String,
}

pub struct ProfileRow {
    pub user_id: i64,
    pub bio: String,
    pub created_at: String,
}

pub struct ConversationRow {
    pub id: i64,
    pub created_at: String,
    pub participants: Vec<Participant>,
    pub last_message: Option<MessageRow>,
}

pub struct MessageRow {
    pub id: i64,
    pub conversation_id: i64,
    pub sender_id: i64,
    pub sender_username: String,
    pub content: String,
    pub created_at: String,
    pub delivered_at: Option<String>,
    pub read_at: Option<String>,
}

/// Result of a conditional delivery/read transition.
pub enum MarkOutcome {
    /// The timestamp was null and is now set.
    Marked(MessageRow),
    /// The timestamp was already set; the row is unchanged.
    AlreadyMarked(MessageRow),
    NotFound,
}

/// Fixed-width RFC 3339 so that stored timestamps sort lexically.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>()
        .or_else(|_| {
            // Rows written by hand through the sqlite shell use datetime('now')
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .with_context(|| format!("Corrupt timestamp '{}'", raw))
}

impl TryFrom<UserRow> for User {
    type Error = anyhow::Error;

    fn try_from(row: UserRow) -> Result<Self> {
        Ok(User {
            created_at: parse_timestamp(&row.created_at)?,
            id: row.id,
            username: row.username,
        })
    }
}

impl TryFrom<MessageRow> for Message {
    type Error = anyhow::Error;

    fn try_from(row: MessageRow) -> Result<Self> {
        Ok(Message {
            id: row.id,
            conversation_id: row.conversation_id,
            sender_id: row.sender_id,
            sender: row.sender_username,
            content: row.content,
            created_at: parse_timestamp(&row.created_at)?,
            delivered_at: row.delivered_at.as_deref().map(parse_timestamp).transpose()?,
            read_at: row.read_at.as_deref().map(parse_timestamp).transpose()?,
        })
    }
}
