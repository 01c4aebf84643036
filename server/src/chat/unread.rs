//! Per-member unread counters.
//!
//! A counter moves only through single-statement updates, and the decision
//! to increment is taken under the member's registry lock so it cannot
//! interleave with that member joining the room on another connection.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::auth::middleware::Claims;
use crate::chat::membership::MembershipRouter;
use crate::db::models::RoomMembership;
use crate::db::{self, run_blocking, DbPool};
use crate::error::{CoreError, CoreResult};
use crate::state::AppState;
use crate::ws::broadcast;
use crate::ws::protocol::ServerEvent;
use crate::ws::registry::ConnectionRegistry;

/// Members whose counters are evaluated at once during fanout.
const INCREMENT_CONCURRENCY: usize = 16;

pub struct UnreadLedger {
    db: DbPool,
    registry: Arc<ConnectionRegistry>,
    membership: Arc<MembershipRouter>,
}

impl UnreadLedger {
    pub fn new(db: DbPool, registry: Arc<ConnectionRegistry>, membership: Arc<MembershipRouter>) -> Self {
        Self {
            db,
            registry,
            membership,
        }
    }

    /// Add one unread to every active member of `room_id` other than the
    /// sender who has no connection listening to the room. Returns the
    /// members whose counter moved.
    pub async fn record_message(
        &self,
        room_id: &str,
        message_id: &str,
        sender_id: &str,
    ) -> CoreResult<Vec<String>> {
        let members = self.membership.active_members(room_id).await?;

        let recipients: Vec<String> = members.into_iter().filter(|m| m != sender_id).collect();

        let results: Vec<CoreResult<Option<String>>> = stream::iter(recipients)
            .map(|member| self.increment_if_away(room_id, member))
            .buffer_unordered(INCREMENT_CONCURRENCY)
            .collect()
            .await;

        let mut incremented = Vec::new();
        let mut first_error = None;
        for result in results {
            match result {
                Ok(Some(member)) => incremented.push(member),
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(room_id = %room_id, message_id = %message_id, error = %e, "Unread increment failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }

        tracing::debug!(
            room_id = %room_id,
            message_id = %message_id,
            incremented = incremented.len(),
            "Unread counters updated"
        );
        Ok(incremented)
    }

    async fn increment_if_away(&self, room_id: &str, member: String) -> CoreResult<Option<String>> {
        let guard = self.registry.lock_user(&member).await;
        if guard.is_listening(room_id) {
            return Ok(None);
        }

        let (rid, uid) = (room_id.to_string(), member.clone());
        let changed =
            run_blocking(&self.db, move |conn| db::membership::increment_unread(conn, &rid, &uid))
                .await?;
        drop(guard);

        Ok((changed > 0).then_some(member))
    }

    /// Reset a member's counter to zero and stamp the read marker. Safe to
    /// repeat. Every connection of the user receives `unread_reset`; other
    /// users listening to the room receive a `messages_read` receipt.
    pub async fn acknowledge_read(
        &self,
        room_id: &str,
        user_id: &str,
        up_to_message_id: Option<&str>,
    ) -> CoreResult<()> {
        let read_at = Utc::now().to_rfc3339();
        let (rid, uid, at) = (room_id.to_string(), user_id.to_string(), read_at.clone());
        let up_to = up_to_message_id.map(str::to_string);
        let changed = run_blocking(&self.db, move |conn| {
            db::membership::reset_unread(conn, &rid, &uid, up_to.as_deref(), &at)
        })
        .await?;

        if changed == 0 {
            return Err(CoreError::not_a_member(room_id, user_id));
        }

        broadcast::send_to_user(
            &self.registry,
            user_id,
            ServerEvent::UnreadReset {
                room_id: room_id.to_string(),
                user_id: user_id.to_string(),
            },
        )
        .await;

        broadcast::send_to_room_except_user(
            &self.registry,
            room_id,
            ServerEvent::MessagesRead {
                room_id: room_id.to_string(),
                user_id: user_id.to_string(),
                last_read_message_id: up_to_message_id.map(str::to_string),
                read_at,
            },
            user_id,
        )
        .await;

        tracing::debug!(room_id = %room_id, user_id = %user_id, "Unread reset");
        Ok(())
    }

    pub async fn unread_count(&self, room_id: &str, user_id: &str) -> CoreResult<i64> {
        let (rid, uid) = (room_id.to_string(), user_id.to_string());
        let membership =
            run_blocking(&self.db, move |conn| db::membership::get_membership(conn, &rid, &uid))
                .await?;
        match membership {
            Some(m) if m.is_active => Ok(m.unread_count),
            _ => Err(CoreError::not_a_member(room_id, user_id)),
        }
    }

    pub async fn memberships(&self, user_id: &str) -> CoreResult<Vec<RoomMembership>> {
        let uid = user_id.to_string();
        run_blocking(&self.db, move |conn| db::membership::active_memberships_for_user(conn, &uid))
            .await
    }
}

// --- Handlers ---

#[derive(Debug, Serialize, Deserialize)]
pub struct UnreadEntry {
    pub room_id: String,
    pub unread_count: i64,
    pub last_read_at: Option<String>,
    pub last_read_message_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct MarkReadRequest {
    pub up_to_message_id: Option<String>,
}

/// GET /api/rooms/unread
pub async fn get_unread(
    State(state): State<AppState>,
    claims: Claims,
) -> Result<Json<Vec<UnreadEntry>>, CoreError> {
    let entries = state
        .ledger
        .memberships(&claims.sub)
        .await?
        .into_iter()
        .map(|m| UnreadEntry {
            room_id: m.room_id,
            unread_count: m.unread_count,
            last_read_at: m.last_read_at,
            last_read_message_id: m.last_read_message_id,
        })
        .collect();
    Ok(Json(entries))
}

/// POST /api/rooms/{room_id}/read
pub async fn mark_read(
    State(state): State<AppState>,
    claims: Claims,
    Path(room_id): Path<String>,
    body: Bytes,
) -> Result<StatusCode, CoreError> {
    let body: MarkReadRequest = if body.is_empty() {
        MarkReadRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| CoreError::InvalidInput(e.to_string()))?
    };
    state
        .ledger
        .acknowledge_read(&room_id, &claims.sub, body.up_to_message_id.as_deref())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
