//! Room membership: who belongs to which room, with a read-through cache
//! in front of the room_members table. Only confirmed memberships are
//! cached, so the cache is bounded by the table and lookups for unknown
//! rooms always go to the store.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::auth::middleware::Claims;
use crate::db::{self, run_blocking, DbPool};
use crate::error::{CoreError, CoreResult};
use crate::state::AppState;
use crate::ws::registry::{ConnectionRegistry, MembershipCheck};

const MAX_ROOM_NAME_LENGTH: usize = 100;

pub struct MembershipRouter {
    db: DbPool,
    registry: Arc<ConnectionRegistry>,
    cache: DashSet<(String, String)>,
    // Bumped on every invalidation. A lookup only fills the cache if no
    // invalidation happened while it was reading the store.
    epoch: AtomicU64,
}

impl MembershipRouter {
    pub fn new(db: DbPool, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            db,
            registry,
            cache: DashSet::new(),
            epoch: AtomicU64::new(0),
        }
    }

    pub async fn is_member(&self, room_id: &str, user_id: &str) -> CoreResult<bool> {
        let key = (room_id.to_string(), user_id.to_string());
        if self.cache.contains(&key) {
            return Ok(true);
        }

        let epoch = self.epoch.load(Ordering::Acquire);
        let (rid, uid) = key.clone();
        let member =
            run_blocking(&self.db, move |conn| db::membership::is_active_member(conn, &rid, &uid))
                .await?;

        if member && self.epoch.load(Ordering::Acquire) == epoch {
            self.cache.insert(key);
        }
        Ok(member)
    }

    /// Active members of a room, always read from the store.
    pub async fn active_members(&self, room_id: &str) -> CoreResult<Vec<String>> {
        let rid = room_id.to_string();
        run_blocking(&self.db, move |conn| db::membership::active_member_ids(conn, &rid)).await
    }

    pub async fn create_room(&self, room_id: &str, name: &str) -> CoreResult<()> {
        let (rid, name) = (room_id.to_string(), name.to_string());
        run_blocking(&self.db, move |conn| db::membership::create_room(conn, &rid, &name)).await
    }

    /// Add (or reactivate) a membership. The user row is created if needed.
    pub async fn add_member(&self, room_id: &str, user_id: &str) -> CoreResult<()> {
        let (rid, uid) = (room_id.to_string(), user_id.to_string());
        run_blocking(&self.db, move |conn| {
            if db::membership::room_name(conn, &rid)?.is_none() {
                return Err(CoreError::NotFound(format!("room {}", rid)));
            }
            db::presence::ensure_user(conn, &uid, &uid)?;
            db::membership::upsert_member(conn, &rid, &uid)
        })
        .await?;
        self.invalidate(room_id, user_id);

        tracing::info!(room_id = %room_id, user_id = %user_id, "Member added");
        Ok(())
    }

    /// Soft-remove a membership and stop the user's connections from
    /// listening to the room. Returns false if there was nothing to remove.
    pub async fn remove_member(&self, room_id: &str, user_id: &str) -> CoreResult<bool> {
        let (rid, uid) = (room_id.to_string(), user_id.to_string());
        let changed =
            run_blocking(&self.db, move |conn| db::membership::deactivate_member(conn, &rid, &uid))
                .await?;
        self.invalidate(room_id, user_id);
        let evicted = self.registry.evict_room(user_id, room_id).await;

        tracing::info!(
            room_id = %room_id,
            user_id = %user_id,
            evicted_connections = evicted,
            "Member removed"
        );
        Ok(changed > 0)
    }

    /// Drop any cached answer for (room, user).
    pub fn invalidate(&self, room_id: &str, user_id: &str) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.cache.remove(&(room_id.to_string(), user_id.to_string()));
    }
}

impl MembershipCheck for MembershipRouter {
    async fn is_member(&self, room_id: &str, user_id: &str) -> CoreResult<bool> {
        MembershipRouter::is_member(self, room_id, user_id).await
    }
}

// --- Handlers ---

#[derive(Debug, Deserialize)]
pub struct CreateRoomRequest {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RoomResponse {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct AddMemberRequest {
    pub user_id: String,
}

/// POST /api/rooms
/// Create a room with the caller as its first member.
pub async fn create_room(
    State(state): State<AppState>,
    claims: Claims,
    Json(body): Json<CreateRoomRequest>,
) -> Result<(StatusCode, Json<RoomResponse>), CoreError> {
    let name = body.name.trim().to_string();
    if name.is_empty() || name.chars().count() > MAX_ROOM_NAME_LENGTH {
        return Err(CoreError::InvalidInput(format!(
            "room name must be 1-{} characters",
            MAX_ROOM_NAME_LENGTH
        )));
    }

    let room_id = uuid::Uuid::now_v7().to_string();
    state.membership.create_room(&room_id, &name).await?;
    state.membership.add_member(&room_id, &claims.sub).await?;

    Ok((StatusCode::CREATED, Json(RoomResponse { id: room_id, name })))
}

/// POST /api/rooms/{room_id}/members
/// Only existing members may add others.
pub async fn add_member(
    State(state): State<AppState>,
    claims: Claims,
    Path(room_id): Path<String>,
    Json(body): Json<AddMemberRequest>,
) -> Result<StatusCode, CoreError> {
    if !state.membership.is_member(&room_id, &claims.sub).await? {
        return Err(CoreError::not_a_member(&room_id, &claims.sub));
    }
    state.membership.add_member(&room_id, &body.user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /api/rooms/{room_id}/members/{user_id}
pub async fn remove_member(
    State(state): State<AppState>,
    claims: Claims,
    Path((room_id, user_id)): Path<(String, String)>,
) -> Result<StatusCode, CoreError> {
    if !state.membership.is_member(&room_id, &claims.sub).await? {
        return Err(CoreError::not_a_member(&room_id, &claims.sub));
    }
    if state.membership.remove_member(&room_id, &user_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(CoreError::not_a_member(&room_id, &user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> (MembershipRouter, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = db::init_db(dir.path().to_str().unwrap()).unwrap();
        let router = MembershipRouter::new(db, Arc::new(ConnectionRegistry::new()));
        (router, dir)
    }

    #[tokio::test]
    async fn unknown_rooms_leave_no_cache_entries() {
        let (router, _dir) = router();
        for i in 0..200 {
            let room_id = format!("bogus-{}", i);
            assert!(!router.is_member(&room_id, "x").await.unwrap());
        }
        assert!(router.cache.is_empty());
    }

    #[tokio::test]
    async fn confirmed_membership_is_cached_until_removed() {
        let (router, _dir) = router();
        router.create_room("r1", "general").await.unwrap();
        router.add_member("r1", "x").await.unwrap();

        assert!(router.is_member("r1", "x").await.unwrap());
        assert_eq!(router.cache.len(), 1);

        router.remove_member("r1", "x").await.unwrap();
        assert!(router.cache.is_empty());
        assert!(!router.is_member("r1", "x").await.unwrap());
        assert!(router.cache.is_empty());
    }
}
