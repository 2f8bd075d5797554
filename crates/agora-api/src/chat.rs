use axum::{
    Extension,
    extract::{Path, State, WebSocketUpgrade},
    response::Response,
};
use tracing::warn;

use agora_gateway::{Caller, ChatSession, connection};

use crate::auth::AppState;
use crate::error::{ApiError, run_blocking};
use crate::middleware::Identity;

/// Upgrade to a conversation socket.
///
/// Anonymous callers are let in but can only listen; their frames are
/// ignored. Authenticated callers must be participants of the conversation.
///
/// The participant check decides whose frames are acted on, not who hears
/// the broadcasts: anyone who knows a conversation id can listen anonymously.
pub async fn upgrade(
    State(state): State<AppState>,
    Path(conversation_id): Path<i64>,
    Extension(identity): Extension<Identity>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let caller = identity.0.map(|claims| Caller {
        user_id: claims.sub,
        username: claims.username,
    });

    let db = state.db.clone();
    let user_id = caller.as_ref().map(|c| c.user_id);
    let (exists, allowed) = run_blocking(move || {
        if !db.conversation_exists(conversation_id)? {
            return Ok((false, false));
        }
        let allowed = match user_id {
            Some(user_id) => db.is_participant(conversation_id, user_id)?,
            None => true,
        };
        Ok((true, allowed))
    })
    .await?;

    if !exists {
        return Err(ApiError::NotFound(format!("no conversation {}", conversation_id)));
    }
    if !allowed {
        if let Some(caller) = &caller {
            warn!(
                "{} ({}) tried to join conversation {} without being a participant",
                caller.username, caller.user_id, conversation_id
            );
        }
        return Err(ApiError::Forbidden);
    }

    let session = ChatSession::new(state.db.clone(), state.registry.clone(), conversation_id, caller);
    Ok(ws.on_upgrade(move |socket| connection::handle_connection(socket, session)))
}
