use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::info;

use agora_db::models::parse_timestamp;
use agora_types::api::{Claims, ConversationSummary, StartConversationRequest};
use agora_types::models::{Conversation, Message};

use crate::auth::AppState;
use crate::error::{ApiError, run_blocking};

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Cursor: return only messages with an id lower than this one.
    pub before: Option<i64>,
}

fn default_limit() -> u32 {
    50
}

/// Open (or reopen) the two-person conversation with `username`.
/// Responds 201 when the conversation was created by this call, 200 otherwise.
pub async fn start_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<StartConversationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let me = claims.sub;
    let target = req.username.clone();
    let (conversation, created) = run_blocking(move || {
        let Some(other) = db.get_user_by_username(&target)? else {
            return Ok(Err(ApiError::NotFound(format!("no user named '{}'", target))));
        };
        if other.id == me {
            return Ok(Err(ApiError::BadRequest("cannot start a conversation with yourself".into())));
        }
        let (id, created) = db.get_or_create_direct_conversation(me, other.id)?;
        let row = db
            .list_conversations(me)?
            .into_iter()
            .find(|c| c.id == id)
            .ok_or_else(|| anyhow::anyhow!("Conversation {} missing after create", id))?;
        Ok(Ok((row, created)))
    })
    .await??;

    if created {
        info!("{} started conversation {} with {}", claims.username, conversation.id, req.username);
    }

    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    let body = Conversation {
        id: conversation.id,
        participants: conversation.participants,
        created_at: parse_timestamp(&conversation.created_at)?,
    };
    Ok((status, Json(body)))
}

pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let rows = run_blocking(move || db.list_conversations(claims.sub)).await?;

    let summaries = rows
        .into_iter()
        .map(|row| {
            Ok(ConversationSummary {
                id: row.id,
                participants: row.participants,
                created_at: parse_timestamp(&row.created_at)?,
                last_message: row.last_message.map(Message::try_from).transpose()?,
            })
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok(Json(summaries))
}

/// History for the initial page load; live updates arrive over the socket.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<i64>,
    Query(query): Query<MessageQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let limit = query.limit.clamp(1, 200);

    let rows = run_blocking(move || {
        if !db.conversation_exists(conversation_id)? {
            return Ok(Err(ApiError::NotFound(format!("no conversation {}", conversation_id))));
        }
        if !db.is_participant(conversation_id, claims.sub)? {
            return Ok(Err(ApiError::Forbidden));
        }
        Ok(Ok(db.get_messages(conversation_id, limit, query.before)?))
    })
    .await??;

    let messages = rows
        .into_iter()
        .map(Message::try_from)
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok(Json(messages))
}
