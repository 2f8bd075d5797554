use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use agora_db::{Database, MarkOutcome};
use agora_types::events::{ChatCommand, ChatEvent, DeliveredMark, MessageSnapshot, PresenceStatus, ReadMark};
use agora_types::models::Message;

use crate::error::Rejection;
use crate::registry::{ChannelRegistry, GroupReceiver};

/// Identity of an authenticated caller, resolved before the upgrade.
#[derive(Debug, Clone)]
pub struct Caller {
    pub user_id: i64,
    pub username: String,
}

/// Per-connection state for one conversation socket.
///
/// Turns inbound commands into persisted state plus a group broadcast.
/// Transport-agnostic so it can be driven without a real socket.
#[derive(Clone)]
pub struct ChatSession {
    db: Arc<Database>,
    registry: ChannelRegistry,
    conversation_id: i64,
    caller: Option<Caller>,
}

impl ChatSession {
    pub fn new(
        db: Arc<Database>,
        registry: ChannelRegistry,
        conversation_id: i64,
        caller: Option<Caller>,
    ) -> Self {
        Self {
            db,
            registry,
            conversation_id,
            caller,
        }
    }

    pub fn conversation_id(&self) -> i64 {
        self.conversation_id
    }

    pub fn caller(&self) -> Option<&Caller> {
        self.caller.as_ref()
    }

    /// Join the conversation group and announce the caller as online.
    pub async fn connect(&self) -> (Uuid, GroupReceiver) {
        let joined = self.registry.join(self.conversation_id).await;

        if let Some(caller) = &self.caller {
            self.announce(caller, PresenceStatus::Online).await;
        }

        joined
    }

    /// Leave the group, then announce the caller as offline to whoever remains.
    pub async fn disconnect(&self, conn_id: Uuid) {
        self.registry.leave(self.conversation_id, conn_id).await;

        if let Some(caller) = &self.caller {
            self.announce(caller, PresenceStatus::Offline).await;
        }
    }

    /// Handle one raw text frame. Rejected frames are logged and dropped.
    pub async fn handle_text(&self, text: &str) {
        let result = match serde_json::from_str::<ChatCommand>(text) {
            Ok(cmd) => self.handle(cmd).await.map(|_| ()),
            Err(e) => Err(Rejection::from(e)),
        };

        if let Err(rejection) = result {
            let who = self.caller.as_ref().map_or("anonymous", |c| c.username.as_str());
            if rejection.is_fault() {
                error!(
                    "conversation {}: frame from {} failed: {}",
                    self.conversation_id, who, rejection
                );
            } else {
                debug!(
                    "conversation {}: dropped frame from {}: {} -- raw: {}",
                    self.conversation_id,
                    who,
                    rejection,
                    text.chars().take(200).collect::<String>()
                );
            }
        }
    }

    /// Apply a command and broadcast its event. Returns the broadcast event.
    pub async fn handle(&self, cmd: ChatCommand) -> Result<ChatEvent, Rejection> {
        let caller = self.caller.as_ref().ok_or(Rejection::Unauthenticated)?;

        let event = match cmd {
            ChatCommand::Send { message, temp_id } => {
                let content = message.trim();
                if content.is_empty() {
                    return Err(Rejection::EmptyMessage);
                }
                let saved = self.save_message(caller, content.to_string()).await?;
                ChatEvent::NewMessage {
                    message: MessageSnapshot::from(&saved),
                    temp_id: temp_id.filter(|t| !t.is_null()),
                }
            }

            ChatCommand::Delivered { message_id } => {
                let msg = self.mark(message_id, Mark::Delivered).await?;
                let delivered_at = msg
                    .delivered_at
                    .ok_or_else(|| anyhow::anyhow!("message {} marked without delivered_at", msg.id))?;
                ChatEvent::Delivered {
                    message: DeliveredMark { id: msg.id, delivered_at },
                }
            }

            ChatCommand::Read { message_id } => {
                let msg = self.mark(message_id, Mark::Read).await?;
                let read_at = msg
                    .read_at
                    .ok_or_else(|| anyhow::anyhow!("message {} marked without read_at", msg.id))?;
                ChatEvent::Read {
                    message: ReadMark { id: msg.id, read_at },
                }
            }
        };

        self.registry.broadcast(self.conversation_id, event.clone()).await;
        Ok(event)
    }

    async fn announce(&self, caller: &Caller, status: PresenceStatus) {
        let reached = self
            .registry
            .broadcast(
                self.conversation_id,
                ChatEvent::Presence {
                    user: caller.username.clone(),
                    status,
                },
            )
            .await;
        info!(
            "{} ({}) is {:?} in conversation {} ({} connections notified)",
            caller.username, caller.user_id, status, self.conversation_id, reached
        );
    }

    async fn save_message(&self, caller: &Caller, content: String) -> Result<Message, Rejection> {
        let db = self.db.clone();
        let conversation_id = self.conversation_id;
        let sender_id = caller.user_id;

        let row = run_blocking(move || db.insert_message(conversation_id, sender_id, &content, Utc::now())).await?;
        let saved = Message::try_from(row)?;
        debug!("conversation {}: stored message {}", conversation_id, saved.id);
        Ok(saved)
    }

    /// Run the conditional transition. Only a fresh transition yields a message.
    async fn mark(&self, message_id: i64, mark: Mark) -> Result<Message, Rejection> {
        let db = self.db.clone();
        let conversation_id = self.conversation_id;

        let outcome = run_blocking(move || match mark {
            Mark::Delivered => db.mark_delivered(message_id, conversation_id, Utc::now()),
            Mark::Read => db.mark_read(message_id, conversation_id, Utc::now()),
        })
        .await?;

        match outcome {
            MarkOutcome::Marked(row) => Ok(Message::try_from(row)?),
            MarkOutcome::AlreadyMarked(_) => Err(Rejection::AlreadyMarked(message_id, mark.label())),
            MarkOutcome::NotFound => Err(Rejection::UnknownMessage(message_id)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Mark {
    Delivered,
    Read,
}

impl Mark {
    fn label(self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Read => "read",
        }
    }
}

/// Run a blocking DB call off the async runtime.
async fn run_blocking<F, T>(f: F) -> Result<T, Rejection>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        warn!("spawn_blocking join error: {}", e);
        Rejection::Storage(anyhow::anyhow!("blocking task failed: {}", e))
    })?
    .map_err(Rejection::Storage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Fixture {
        db: Arc<Database>,
        registry: ChannelRegistry,
        conversation_id: i64,
        alice: Caller,
        bob: Caller,
    }

    fn fixture() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let alice = db.create_user("alice").unwrap();
        let bob = db.create_user("bob").unwrap();
        let (conversation_id, _) = db.get_or_create_direct_conversation(alice.id, bob.id).unwrap();
        Fixture {
            db: Arc::new(db),
            registry: ChannelRegistry::new(),
            conversation_id,
            alice: Caller { user_id: alice.id, username: alice.username },
            bob: Caller { user_id: bob.id, username: bob.username },
        }
    }

    impl Fixture {
        fn session(&self, caller: Option<&Caller>) -> ChatSession {
            ChatSession::new(self.db.clone(), self.registry.clone(), self.conversation_id, caller.cloned())
        }
    }

    fn drain(rx: &mut GroupReceiver) -> Vec<ChatEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    fn send(text: &str, temp_id: Option<serde_json::Value>) -> ChatCommand {
        ChatCommand::Send { message: text.into(), temp_id }
    }

    #[tokio::test]
    async fn presence_online_then_offline() {
        let fx = fixture();
        let a = fx.session(Some(&fx.alice));
        let b = fx.session(Some(&fx.bob));

        let (_, mut a_rx) = a.connect().await;
        let (b_conn, mut b_rx) = b.connect().await;

        let seen = drain(&mut a_rx);
        assert_eq!(seen.len(), 2);
        assert!(matches!(&seen[1], ChatEvent::Presence { user, status: PresenceStatus::Online } if user == "bob"));
        // The joining connection hears its own announcement.
        assert!(matches!(&drain(&mut b_rx)[..], [ChatEvent::Presence { .. }]));

        b.disconnect(b_conn).await;
        assert!(matches!(
            &drain(&mut a_rx)[..],
            [ChatEvent::Presence { user, status: PresenceStatus::Offline }] if user == "bob"
        ));
        assert_eq!(fx.registry.member_count(fx.conversation_id).await, 1);
    }

    #[tokio::test]
    async fn anonymous_connection_is_silent() {
        let fx = fixture();
        let a = fx.session(Some(&fx.alice));
        let anon = fx.session(None);
        let (_, mut a_rx) = a.connect().await;
        drain(&mut a_rx);

        let (anon_conn, _anon_rx) = anon.connect().await;
        assert!(matches!(anon.handle(send("hi", None)).await, Err(Rejection::Unauthenticated)));
        anon.disconnect(anon_conn).await;

        assert!(drain(&mut a_rx).is_empty());
        assert!(fx.db.get_messages(fx.conversation_id, 10, None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn send_reaches_both_participants_with_temp_id() {
        let fx = fixture();
        let a = fx.session(Some(&fx.alice));
        let b = fx.session(Some(&fx.bob));
        let (_, mut a_rx) = a.connect().await;
        let (_, mut b_rx) = b.connect().await;
        drain(&mut a_rx);
        drain(&mut b_rx);

        a.handle(send("  hi  ", Some(json!("t1")))).await.unwrap();

        let a_seen = drain(&mut a_rx);
        let b_seen = drain(&mut b_rx);
        let (ChatEvent::NewMessage { message: ma, temp_id: ta }, ChatEvent::NewMessage { message: mb, temp_id: tb }) =
            (&a_seen[0], &b_seen[0])
        else {
            panic!("expected new_message on both sides");
        };
        assert_eq!(ma, mb);
        assert_eq!(ma.content, "hi");
        assert_eq!(ma.sender, "alice");
        assert!(ma.delivered_at.is_none() && ma.read_at.is_none());
        assert_eq!(ta.as_ref(), Some(&json!("t1")));
        assert_eq!(tb.as_ref(), Some(&json!("t1")));
    }

    #[tokio::test]
    async fn blank_send_is_dropped() {
        let fx = fixture();
        let a = fx.session(Some(&fx.alice));
        let (_, mut a_rx) = a.connect().await;
        drain(&mut a_rx);

        assert!(matches!(a.handle(send(" \n\t ", None)).await, Err(Rejection::EmptyMessage)));
        a.handle_text(r#"{"action":"send"}"#).await;

        assert!(drain(&mut a_rx).is_empty());
        assert!(fx.db.get_messages(fx.conversation_id, 10, None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn delivered_twice_broadcasts_once() {
        let fx = fixture();
        let a = fx.session(Some(&fx.alice));
        let b = fx.session(Some(&fx.bob));
        let (_, mut a_rx) = a.connect().await;

        let ChatEvent::NewMessage { message, .. } = a.handle(send("hi", None)).await.unwrap() else {
            panic!("expected new_message");
        };
        drain(&mut a_rx);

        let first = b.handle(ChatCommand::Delivered { message_id: message.id }).await.unwrap();
        let ChatEvent::Delivered { message: mark } = first else {
            panic!("expected delivered");
        };
        assert_eq!(mark.id, message.id);

        assert!(matches!(
            b.handle(ChatCommand::Delivered { message_id: message.id }).await,
            Err(Rejection::AlreadyMarked(_, "delivered"))
        ));

        assert_eq!(drain(&mut a_rx).len(), 1);
        let stored = fx.db.get_message(message.id, fx.conversation_id).unwrap().unwrap();
        let stored = Message::try_from(stored).unwrap();
        assert_eq!(stored.delivered_at, Some(mark.delivered_at));
    }

    #[tokio::test]
    async fn read_before_delivered_transitions_once() {
        let fx = fixture();
        let a = fx.session(Some(&fx.alice));
        let b = fx.session(Some(&fx.bob));

        let ChatEvent::NewMessage { message, .. } = a.handle(send("hi", None)).await.unwrap() else {
            panic!("expected new_message");
        };

        assert!(matches!(
            b.handle(ChatCommand::Read { message_id: message.id }).await,
            Ok(ChatEvent::Read { message: ReadMark { id, .. } }) if id == message.id
        ));
        assert!(b.handle(ChatCommand::Read { message_id: message.id }).await.is_err());

        // Delivery can still be recorded afterwards.
        assert!(b.handle(ChatCommand::Delivered { message_id: message.id }).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_message_and_bad_frames_are_ignored() {
        let fx = fixture();
        let a = fx.session(Some(&fx.alice));
        let (_, mut a_rx) = a.connect().await;
        drain(&mut a_rx);

        assert!(matches!(
            a.handle(ChatCommand::Delivered { message_id: 424242 }).await,
            Err(Rejection::UnknownMessage(424242))
        ));
        a.handle_text("not json").await;
        a.handle_text(r#"{"action":"typing"}"#).await;
        a.handle_text(r#"{"action":"read"}"#).await;

        assert!(drain(&mut a_rx).is_empty());
    }

    #[tokio::test]
    async fn remaining_participant_keeps_talking() {
        let fx = fixture();
        let a = fx.session(Some(&fx.alice));
        let b = fx.session(Some(&fx.bob));
        let (a_conn, _a_rx) = a.connect().await;
        let (_, mut b_rx) = b.connect().await;

        a.disconnect(a_conn).await;
        drain(&mut b_rx);

        b.handle_text(r#"{"action":"send","message":"still here"}"#).await;
        assert!(matches!(
            &drain(&mut b_rx)[..],
            [ChatEvent::NewMessage { message, temp_id: None }] if message.content == "still here"
        ));
    }
}
