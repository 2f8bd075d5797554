use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use tracing::info;

use agora_types::api::{CreateUserRequest, CreateUserResponse};
use agora_types::models::User;

use crate::auth::{AppState, create_token};
use crate::error::{ApiError, run_blocking};

/// Provision a user (and its profile) and hand back a bearer token.
///
/// No credentials are involved: this stands in for whatever identity
/// provider issues tokens in a real deployment.
pub async fn create_user(
    State(state): State<AppState>,
    Json(req): Json<CreateUserRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let username = req.username.trim().to_string();
    validate_username(&username)?;

    let db = state.db.clone();
    let row = run_blocking(move || db.create_user_if_absent(&username))
        .await?
        .ok_or_else(|| ApiError::Conflict("username already taken".into()))?;

    let user = User::try_from(row)?;
    let token = create_token(&state.jwt_secret, user.id, &user.username)?;
    info!("Provisioned user {} ({})", user.username, user.id);

    Ok((StatusCode::CREATED, Json(CreateUserResponse { user, token })))
}

fn validate_username(username: &str) -> Result<(), ApiError> {
    if username.len() < 3 || username.len() > 32 {
        return Err(ApiError::BadRequest("username must be 3-32 characters".into()));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        return Err(ApiError::BadRequest(
            "username may only contain letters, digits, '_', '.' and '-'".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_rules() {
        assert!(validate_username("alice").is_ok());
        assert!(validate_username("a.b-c_d").is_ok());
        assert!(validate_username("ab").is_err());
        assert!(validate_username(&"x".repeat(33)).is_err());
        assert!(validate_username("bad name").is_err());
        assert!(validate_username("émile").is_err());
    }
}
