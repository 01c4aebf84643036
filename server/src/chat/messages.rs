//! REST entry point for posting messages into a room.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use crate::auth::middleware::Claims;
use crate::db::models::Message;
use crate::error::CoreError;
use crate::state::AppState;

/// Maximum message content length (chars).
const MAX_CONTENT_LENGTH: usize = 4000;

#[derive(Debug, Deserialize)]
pub struct CreateMessageRequest {
    pub content: String,
    pub reply_to_id: Option<String>,
}

/// POST /api/rooms/{room_id}/messages
/// Persists the message, then fans it out before responding.
pub async fn create_message(
    State(state): State<AppState>,
    claims: Claims,
    Path(room_id): Path<String>,
    Json(body): Json<CreateMessageRequest>,
) -> Result<(StatusCode, Json<Message>), CoreError> {
    let content = body.content.trim();
    if content.is_empty() {
        return Err(CoreError::InvalidInput("content must not be empty".to_string()));
    }
    if content.chars().count() > MAX_CONTENT_LENGTH {
        return Err(CoreError::InvalidInput(format!(
            "content exceeds {} characters",
            MAX_CONTENT_LENGTH
        )));
    }

    if !state.membership.is_member(&room_id, &claims.sub).await? {
        return Err(CoreError::not_a_member(&room_id, &claims.sub));
    }

    let (message, result) = state
        .fanout
        .publish(&room_id, &claims.sub, content, body.reply_to_id.as_deref())
        .await?;

    tracing::debug!(
        message_id = %message.id,
        room_id = %room_id,
        room_deliveries = result.room_deliveries,
        "Message created"
    );
    Ok((StatusCode::CREATED, Json(message)))
}
