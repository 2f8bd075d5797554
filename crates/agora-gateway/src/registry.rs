use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use agora_types::events::ChatEvent;

/// Receiving half handed to a connection when it joins a group.
pub type GroupReceiver = mpsc::UnboundedReceiver<ChatEvent>;

/// Routes events to the live connections of each conversation.
///
/// Owned by the server state and cloned into every connection. `join` and
/// `leave` are the only operations that change group membership.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    /// conversation_id -> (conn_id -> sender)
    groups: RwLock<HashMap<i64, HashMap<Uuid, mpsc::UnboundedSender<ChatEvent>>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a conversation's group. Returns (conn_id, receiver).
    pub async fn join(&self, conversation_id: i64) -> (Uuid, GroupReceiver) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .groups
            .write()
            .await
            .entry(conversation_id)
            .or_default()
            .insert(conn_id, tx);
        (conn_id, rx)
    }

    /// Remove a connection from its group, dropping the group once empty.
    pub async fn leave(&self, conversation_id: i64, conn_id: Uuid) {
        let mut groups = self.inner.groups.write().await;
        if let Some(members) = groups.get_mut(&conversation_id) {
            members.remove(&conn_id);
            if members.is_empty() {
                groups.remove(&conversation_id);
            }
        }
    }

    /// Send an event to every connection in the group, the originator included.
    /// Returns how many connections it was handed to.
    pub async fn broadcast(&self, conversation_id: i64, event: ChatEvent) -> usize {
        let groups = self.inner.groups.read().await;
        let Some(members) = groups.get(&conversation_id) else {
            return 0;
        };

        members
            .values()
            .filter(|tx| tx.send(event.clone()).is_ok())
            .count()
    }

    /// Number of live connections in a conversation's group.
    pub async fn member_count(&self, conversation_id: i64) -> usize {
        self.inner
            .groups
            .read()
            .await
            .get(&conversation_id)
            .map_or(0, HashMap::len)
    }
}
