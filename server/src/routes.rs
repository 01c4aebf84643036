use axum::{
    middleware,
    routing::{delete, get, post},
    Json, Router,
};

use crate::auth::middleware::JwtSecret;
use crate::chat::{membership, messages, presence, unread};
use crate::push::subscriptions;
use crate::state::AppState;
use crate::ws::handler as ws_handler;

/// Inject the JWT secret into request extensions so the Claims extractor can find it.
async fn inject_jwt_secret(
    axum::extract::State(state): axum::extract::State<AppState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> axum::response::Response {
    req.extensions_mut()
        .insert(JwtSecret(state.jwt_secret.clone()));
    next.run(req).await
}

/// Build the full axum Router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let room_routes = Router::new()
        .route("/api/rooms", post(membership::create_room))
        .route("/api/rooms/unread", get(unread::get_unread))
        .route("/api/rooms/{room_id}/messages", post(messages::create_message))
        .route("/api/rooms/{room_id}/read", post(unread::mark_read))
        .route("/api/rooms/{room_id}/members", post(membership::add_member))
        .route(
            "/api/rooms/{room_id}/members/{user_id}",
            delete(membership::remove_member),
        );

    let presence_routes =
        Router::new().route("/api/presence/{user_id}", get(presence::get_presence));

    let push_routes = Router::new()
        .route(
            "/api/push/subscriptions",
            post(subscriptions::subscribe).get(subscriptions::list),
        )
        .route(
            "/api/push/subscriptions/{id}",
            delete(subscriptions::unsubscribe),
        );

    // WebSocket endpoint (auth via query param, not JWT header)
    let ws_routes = Router::new().route("/ws", get(ws_handler::ws_upgrade));

    let health = Router::new().route("/api/health", get(health_check));

    Router::new()
        .merge(room_routes)
        .merge(presence_routes)
        .merge(push_routes)
        .merge(ws_routes)
        .merge(health)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            inject_jwt_secret,
        ))
        .with_state(state)
}

/// Liveness plus a count of users currently connected.
async fn health_check(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Json<serde_json::Value> {
    let online = state.registry.online_users().await.len();
    Json(serde_json::json!({ "status": "ok", "online_users": online }))
}
