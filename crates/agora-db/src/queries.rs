use crate::Database;
use crate::models::{ConversationRow, MarkOutcome, MessageRow, ProfileRow, UserRow, format_timestamp};
use agora_types::models::Participant;
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};

const MESSAGE_SELECT: &str = "SELECT m.id, m.conversation_id, m.sender_id, u.username, m.content,
                                     m.created_at, m.delivered_at, m.read_at
                              FROM messages m
                              JOIN users u ON u.id = m.sender_id";

/// Which lifecycle timestamp a mark operation targets.
#[derive(Debug, Clone, Copy)]
enum MarkColumn {
    Delivered,
    Read,
}

impl MarkColumn {
    fn name(self) -> &'static str {
        match self {
            Self::Delivered => "delivered_at",
            Self::Read => "read_at",
        }
    }
}

impl Database {
    // -- Users --

    /// Insert a user and its profile in one transaction.
    ///
    /// The profile is created here, explicitly, rather than by any trigger.
    pub fn create_user(&self, username: &str) -> Result<UserRow> {
        self.create_user_if_absent(username)?
            .ok_or_else(|| anyhow::anyhow!("Username '{}' already taken", username))
    }

    /// Like [`Database::create_user`], but a taken username yields `None`.
    /// The lookup and the insert share one transaction.
    pub fn create_user_if_absent(&self, username: &str) -> Result<Option<UserRow>> {
        let created_at = format_timestamp(Utc::now());
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            if query_user(&tx, "username", username)?.is_some() {
                return Ok(None);
            }
            tx.execute(
                "INSERT INTO users (username, created_at) VALUES (?1, ?2)",
                (username, &created_at),
            )?;
            let id = tx.last_insert_rowid();
            create_profile(&tx, id, &created_at)?;
            tx.commit()?;

            Ok(Some(UserRow {
                id,
                username: username.to_string(),
                created_at,
            }))
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "username", username))
    }

    pub fn get_profile(&self, user_id: i64) -> Result<Option<ProfileRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT user_id, bio, created_at FROM profiles WHERE user_id = ?1",
                    [user_id],
                    |row| {
                        Ok(ProfileRow {
                            user_id: row.get(0)?,
                            bio: row.get(1)?,
                            created_at: row.get(2)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
    }

    // -- Conversations --

    pub fn create_conversation(&self, participant_ids: &[i64]) -> Result<i64> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let id = insert_conversation(&tx, participant_ids)?;
            tx.commit()?;
            Ok(id)
        })
    }

    pub fn add_participant(&self, conversation_id: i64, user_id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO conversation_participants (conversation_id, user_id) VALUES (?1, ?2)",
                [conversation_id, user_id],
            )?;
            Ok(())
        })
    }

    /// Find the two-person conversation between `a` and `b`, creating it on
    /// first use. Returns `(conversation_id, created)`.
    pub fn get_or_create_direct_conversation(&self, a: i64, b: i64) -> Result<(i64, bool)> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            if let Some(id) = query_direct_conversation(&tx, a, b)? {
                return Ok((id, false));
            }
            let id = insert_conversation(&tx, &[a, b])?;
            tx.commit()?;
            Ok((id, true))
        })
    }

    pub fn conversation_exists(&self, conversation_id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let found = conn
                .query_row("SELECT 1 FROM conversations WHERE id = ?1", [conversation_id], |_| Ok(()))
                .optional()?;
            Ok(found.is_some())
        })
    }

    pub fn is_participant(&self, conversation_id: i64, user_id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let found = conn
                .query_row(
                    "SELECT 1 FROM conversation_participants WHERE conversation_id = ?1 AND user_id = ?2",
                    [conversation_id, user_id],
                    |_| Ok(()),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    /// Conversations `user_id` takes part in, most recent activity first.
    pub fn list_conversations(&self, user_id: i64) -> Result<Vec<ConversationRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.created_at,
                        COALESCE((SELECT m.created_at FROM messages m WHERE m.conversation_id = c.id
                                  ORDER BY m.id DESC LIMIT 1),
                                 c.created_at) AS activity
                 FROM conversations c
                 JOIN conversation_participants p ON p.conversation_id = c.id
                 WHERE p.user_id = ?1
                 ORDER BY activity DESC, c.id DESC",
            )?;

            let heads = stmt
                .query_map([user_id], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut rows = Vec::with_capacity(heads.len());
            for (id, created_at) in heads {
                rows.push(ConversationRow {
                    id,
                    created_at,
                    participants: query_participants(conn, id)?,
                    last_message: query_last_message(conn, id)?,
                });
            }
            Ok(rows)
        })
    }

    // -- Messages --

    pub fn insert_message(
        &self,
        conversation_id: i64,
        sender_id: i64,
        content: &str,
        created_at: DateTime<Utc>,
    ) -> Result<MessageRow> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (conversation_id, sender_id, content, created_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![conversation_id, sender_id, content, format_timestamp(created_at)],
            )?;
            let id = conn.last_insert_rowid();
            query_message(conn, id, conversation_id)?
                .ok_or_else(|| anyhow::anyhow!("Message {} vanished after insert", id))
        })
    }

    pub fn get_message(&self, id: i64, conversation_id: i64) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| query_message(conn, id, conversation_id))
    }

    /// Set `delivered_at` if it is still null. First setter wins.
    pub fn mark_delivered(&self, id: i64, conversation_id: i64, at: DateTime<Utc>) -> Result<MarkOutcome> {
        self.with_conn(|conn| mark(conn, MarkColumn::Delivered, id, conversation_id, at))
    }

    /// Set `read_at` if it is still null. Does not require a prior delivery mark.
    pub fn mark_read(&self, id: i64, conversation_id: i64, at: DateTime<Utc>) -> Result<MarkOutcome> {
        self.with_conn(|conn| mark(conn, MarkColumn::Read, id, conversation_id, at))
    }

    /// Page of history, returned oldest first. `before` is an exclusive message id cursor.
    ///
    /// Ordered by id, the same key as the cursor: `created_at` is taken before
    /// the connection lock, so two concurrent sends may store it out of id order.
    pub fn get_messages(&self, conversation_id: i64, limit: u32, before: Option<i64>) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "{MESSAGE_SELECT}
                 WHERE m.conversation_id = ?1 AND (?2 IS NULL OR m.id < ?2)
                 ORDER BY m.id DESC
                 LIMIT ?3"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt
                .query_map(rusqlite::params![conversation_id, before, limit], map_message)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.reverse();
            Ok(rows)
        })
    }
}

fn create_profile(conn: &Connection, user_id: i64, created_at: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO profiles (user_id, created_at) VALUES (?1, ?2)",
        rusqlite::params![user_id, created_at],
    )?;
    Ok(())
}

fn query_user<P: rusqlite::ToSql>(conn: &Connection, column: &str, value: P) -> Result<Option<UserRow>> {
    let sql = format!("SELECT id, username, created_at FROM users WHERE {} = ?1", column);
    let row = conn
        .query_row(&sql, [value], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                username: row.get(1)?,
                created_at: row.get(2)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn insert_conversation(conn: &Connection, participant_ids: &[i64]) -> Result<i64> {
    conn.execute(
        "INSERT INTO conversations (created_at) VALUES (?1)",
        [format_timestamp(Utc::now())],
    )?;
    let id = conn.last_insert_rowid();
    for user_id in participant_ids {
        conn.execute(
            "INSERT OR IGNORE INTO conversation_participants (conversation_id, user_id) VALUES (?1, ?2)",
            [id, *user_id],
        )?;
    }
    Ok(id)
}

fn query_direct_conversation(conn: &Connection, a: i64, b: i64) -> Result<Option<i64>> {
    let id = conn
        .query_row(
            "SELECT c.id FROM conversations c
             WHERE (SELECT COUNT(*) FROM conversation_participants p WHERE p.conversation_id = c.id) = 2
               AND EXISTS (SELECT 1 FROM conversation_participants p WHERE p.conversation_id = c.id AND p.user_id = ?1)
               AND EXISTS (SELECT 1 FROM conversation_participants p WHERE p.conversation_id = c.id AND p.user_id = ?2)
             ORDER BY c.id
             LIMIT 1",
            [a, b],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

fn query_participants(conn: &Connection, conversation_id: i64) -> Result<Vec<Participant>> {
    let mut stmt = conn.prepare(
        "SELECT u.id, u.username
         FROM conversation_participants p
         JOIN users u ON u.id = p.user_id
         WHERE p.conversation_id = ?1
         ORDER BY u.username",
    )?;
    let participants = stmt
        .query_map([conversation_id], |row| {
            Ok(Participant {
                id: row.get(0)?,
                username: row.get(1)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(participants)
}

fn query_last_message(conn: &Connection, conversation_id: i64) -> Result<Option<MessageRow>> {
    let sql = format!(
        "{MESSAGE_SELECT} WHERE m.conversation_id = ?1 ORDER BY m.id DESC LIMIT 1"
    );
    Ok(conn.query_row(&sql, [conversation_id], map_message).optional()?)
}

fn query_message(conn: &Connection, id: i64, conversation_id: i64) -> Result<Option<MessageRow>> {
    let sql = format!("{MESSAGE_SELECT} WHERE m.id = ?1 AND m.conversation_id = ?2");
    Ok(conn.query_row(&sql, [id, conversation_id], map_message).optional()?)
}

fn mark(conn: &Connection, column: MarkColumn, id: i64, conversation_id: i64, at: DateTime<Utc>) -> Result<MarkOutcome> {
    // Row-atomic conditional update: only a null column is ever written.
    let sql = format!(
        "UPDATE messages SET {col} = ?1 WHERE id = ?2 AND conversation_id = ?3 AND {col} IS NULL",
        col = column.name()
    );
    let changed = conn.execute(&sql, rusqlite::params![format_timestamp(at), id, conversation_id])?;

    let outcome = match query_message(conn, id, conversation_id)? {
        None => MarkOutcome::NotFound,
        Some(row) if changed == 1 => MarkOutcome::Marked(row),
        Some(row) => MarkOutcome::AlreadyMarked(row),
    };
    Ok(outcome)
}

fn map_message(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        sender_username: row.get(3)?,
        content: row.get(4)?,
        created_at: row.get(5)?,
        delivered_at: row.get(6)?,
        read_at: row.get(7)?,
    })
}
