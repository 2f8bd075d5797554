use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tracing::{info, trace, warn};

use crate::session::ChatSession;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Drive one conversation socket until either side goes away.
///
/// Identity and conversation were resolved at the HTTP upgrade layer, so the
/// session is ready to join its group immediately.
pub async fn handle_connection(socket: WebSocket, session: ChatSession) {
    let (mut sender, mut receiver) = socket.split();
    let conversation_id = session.conversation_id();
    let who = session
        .caller()
        .map_or_else(|| "anonymous".to_string(), |c| format!("{} ({})", c.username, c.user_id));

    let (conn_id, mut group_rx) = session.connect().await;
    info!("{} connected to conversation {} as {}", who, conversation_id, conn_id);

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward group events -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = group_rx.recv() => {
                    let Some(event) = event else { break };
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Failed to encode {:?}: {}", event, e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read frames from client, strictly one at a time
    let recv_session = session.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    // The frame runs on its own task: if this loop is aborted on
                    // disconnect, a frame already in flight still persists and broadcasts.
                    let session = recv_session.clone();
                    let frame = text.as_str().to_owned();
                    if let Err(e) = tokio::spawn(async move { session.handle_text(&frame).await }).await {
                        warn!("Frame task failed in conversation {}: {}", conversation_id, e);
                    }
                }
                Message::Binary(data) => {
                    trace!("Ignoring {} byte binary frame in conversation {}", data.len(), conversation_id);
                }
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    session.disconnect(conn_id).await;
    info!("{} disconnected from conversation {}", who, conversation_id);
}
