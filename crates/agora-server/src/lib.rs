pub mod config;

use axum::{
    Router, middleware,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use agora_api::middleware::{require_auth, resolve_identity};
use agora_api::{AppState, chat, conversations, users};

/// Assemble the full HTTP + WebSocket router.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new().route("/users", post(users::create_user));

    let protected_routes = Router::new()
        .route(
            "/conversations",
            get(conversations::list_conversations).post(conversations::start_conversation),
        )
        .route("/conversations/{conversation_id}/messages", get(conversations::get_messages))
        .layer(middleware::from_fn(require_auth));

    let ws_route = Router::new().route("/ws/chat/{conversation_id}", get(chat::upgrade));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_route)
        .layer(middleware::from_fn_with_state(state.clone(), resolve_identity))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode, header};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use agora_api::AppStateInner;
    use agora_api::auth::create_token;
    use agora_db::Database;
    use agora_gateway::ChannelRegistry;

    use super::*;

    const SECRET: &str = "test-secret";

    fn state() -> AppState {
        Arc::new(AppStateInner {
            db: Arc::new(Database::open_in_memory().unwrap()),
            jwt_secret: SECRET.into(),
            registry: ChannelRegistry::new(),
        })
    }

    async fn call(app: &Router, method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            req = req.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let req = match body {
            Some(body) => req
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => req.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn provision(app: &Router, username: &str) -> String {
        let (status, body) = call(app, "POST", "/users", None, Some(json!({ "username": username }))).await;
        assert_eq!(status, StatusCode::CREATED);
        body["token"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn provisioning_rejects_duplicates_and_bad_names() {
        let app = router(state());
        provision(&app, "alice").await;

        let (status, body) = call(&app, "POST", "/users", None, Some(json!({ "username": "alice" }))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "username already taken");

        let (status, _) = call(&app, "POST", "/users", None, Some(json!({ "username": "a b" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn racing_registrations_get_one_winner() {
        let app = router(state());
        let attempts = (0..8).map(|_| {
            let app = app.clone();
            tokio::spawn(async move {
                call(&app, "POST", "/users", None, Some(json!({ "username": "zoe" }))).await.0
            })
        });

        let mut statuses = Vec::new();
        for attempt in attempts.collect::<Vec<_>>() {
            statuses.push(attempt.await.unwrap());
        }
        assert_eq!(statuses.iter().filter(|s| **s == StatusCode::CREATED).count(), 1);
        assert!(statuses.iter().all(|s| *s == StatusCode::CREATED || *s == StatusCode::CONFLICT));
    }

    #[tokio::test]
    async fn conversations_require_a_valid_token() {
        let app = router(state());
        let (status, _) = call(&app, "GET", "/conversations", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let forged = create_token("other-secret", 1, "alice").unwrap();
        let (status, _) = call(&app, "GET", "/conversations", Some(&forged), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn start_chat_is_lazy_and_idempotent() {
        let app = router(state());
        let alice = provision(&app, "alice").await;
        provision(&app, "bob").await;

        let (status, first) =
            call(&app, "POST", "/conversations", Some(&alice), Some(json!({ "username": "bob" }))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(first["participants"].as_array().unwrap().len(), 2);

        let (status, again) =
            call(&app, "POST", "/conversations", Some(&alice), Some(json!({ "username": "bob" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(again["id"], first["id"]);

        let (status, _) =
            call(&app, "POST", "/conversations", Some(&alice), Some(json!({ "username": "alice" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) =
            call(&app, "POST", "/conversations", Some(&alice), Some(json!({ "username": "nobody" }))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, list) = call(&app, "GET", "/conversations", Some(&alice), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list.as_array().unwrap().len(), 1);
        assert!(list[0]["last_message"].is_null());
    }

    #[tokio::test]
    async fn history_is_participants_only() {
        let state = state();
        let app = router(state.clone());
        let alice = provision(&app, "alice").await;
        provision(&app, "bob").await;
        let mallory = provision(&app, "mallory").await;

        let (_, conv) =
            call(&app, "POST", "/conversations", Some(&alice), Some(json!({ "username": "bob" }))).await;
        let id = conv["id"].as_i64().unwrap();
        let sender = state.db.get_user_by_username("alice").unwrap().unwrap().id;
        state.db.insert_message(id, sender, "hello", chrono::Utc::now()).unwrap();

        let uri = format!("/conversations/{}/messages", id);
        let (status, messages) = call(&app, "GET", &uri, Some(&alice), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(messages[0]["content"], "hello");
        assert!(messages[0]["delivered_at"].is_null());

        let (status, _) = call(&app, "GET", &uri, Some(&mallory), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = call(&app, "GET", "/conversations/999/messages", Some(&alice), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
