//! REST endpoints for registering push endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use crate::auth::middleware::Claims;
use crate::db::models::PushSubscription;
use crate::db::{self, run_blocking};
use crate::error::CoreError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SubscriptionKeys {
    pub p256dh: Option<String>,
    pub auth: Option<String>,
}

/// Mirrors the browser `PushSubscription.toJSON()` shape.
#[derive(Debug, Deserialize)]
pub struct SubscribeRequest {
    pub endpoint: String,
    pub keys: Option<SubscriptionKeys>,
}

/// POST /api/push/subscriptions
pub async fn subscribe(
    State(state): State<AppState>,
    claims: Claims,
    Json(body): Json<SubscribeRequest>,
) -> Result<(StatusCode, Json<PushSubscription>), CoreError> {
    let endpoint = body.endpoint.trim().to_string();
    if !(endpoint.starts_with("https://") || endpoint.starts_with("http://")) {
        return Err(CoreError::InvalidInput("endpoint must be an http(s) URL".to_string()));
    }

    let user_id = claims.sub.clone();
    let (p256dh, auth) = body
        .keys
        .map(|k| (k.p256dh, k.auth))
        .unwrap_or((None, None));

    let subscription = run_blocking(&state.db, move |conn| {
        db::presence::ensure_user(conn, &user_id, &user_id)?;
        db::subscriptions::upsert_subscription(
            conn,
            &user_id,
            &endpoint,
            p256dh.as_deref(),
            auth.as_deref(),
        )
    })
    .await?;

    tracing::info!(
        user_id = %claims.sub,
        subscription_id = %subscription.id,
        "Push subscription registered"
    );
    Ok((StatusCode::CREATED, Json(subscription)))
}

/// GET /api/push/subscriptions
pub async fn list(
    State(state): State<AppState>,
    claims: Claims,
) -> Result<Json<Vec<PushSubscription>>, CoreError> {
    let user_id = claims.sub;
    let subscriptions =
        run_blocking(&state.db, move |conn| db::subscriptions::list_for_user(conn, &user_id))
            .await?;
    Ok(Json(subscriptions))
}

/// DELETE /api/push/subscriptions/{id}
pub async fn unsubscribe(
    State(state): State<AppState>,
    claims: Claims,
    Path(subscription_id): Path<String>,
) -> Result<StatusCode, CoreError> {
    let (sid, uid) = (subscription_id.clone(), claims.sub.clone());
    let removed = run_blocking(&state.db, move |conn| {
        db::subscriptions::delete_owned_subscription(conn, &sid, &uid)
    })
    .await?;

    if removed == 0 {
        return Err(CoreError::NotFound(format!("subscription {}", subscription_id)));
    }
    Ok(StatusCode::NO_CONTENT)
}
