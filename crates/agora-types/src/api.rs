use serde::{Deserialize, Serialize};

use crate::models::{Message, Participant, User};

// -- JWT Claims --

/// Bearer token claims. Tokens are verified by the HTTP layer before any
/// handler (REST or WebSocket upgrade) runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: i64,
    pub username: String,
    pub exp: usize,
}

// -- Users --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateUserRequest {
    pub username: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateUserResponse {
    pub user: User,
    pub token: String,
}

// -- Conversations --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StartConversationRequest {
    pub username: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: i64,
    pub participants: Vec<Participant>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub last_message: Option<Message>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
