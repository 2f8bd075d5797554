use axum::{
    extract::{Query, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::headers::{Authorization, HeaderMapExt, authorization::Bearer};
use serde::Deserialize;
use tracing::debug;

use agora_types::api::Claims;

use crate::auth::{AppState, verify_token};
use crate::error::ApiError;

/// Caller identity attached to every request. `None` means no valid token.
#[derive(Debug, Clone)]
pub struct Identity(pub Option<Claims>);

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Resolve the caller from `Authorization: Bearer` or, for WebSocket
/// upgrades where browsers cannot set headers, a `token` query parameter.
/// Never rejects; downstream handlers decide what an anonymous caller may do.
pub async fn resolve_identity(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let token = req
        .headers()
        .typed_get::<Authorization<Bearer>>()
        .map(|auth| auth.0.token().to_owned())
        .or_else(|| {
            Query::<TokenQuery>::try_from_uri(req.uri())
                .ok()
                .and_then(|Query(q)| q.token)
        });

    let claims = token.and_then(|token| match verify_token(&state.jwt_secret, &token) {
        Ok(claims) => Some(claims),
        Err(e) => {
            debug!("Rejected bearer token: {}", e);
            None
        }
    });

    req.extensions_mut().insert(Identity(claims));
    next.run(req).await
}

/// Require an authenticated caller and expose its claims to handlers.
pub async fn require_auth(mut req: Request, next: Next) -> Response {
    let claims = req
        .extensions()
        .get::<Identity>()
        .and_then(|identity| identity.0.clone());

    match claims {
        Some(claims) => {
            req.extensions_mut().insert(claims);
            next.run(req).await
        }
        None => ApiError::Unauthorized.into_response(),
    }
}
