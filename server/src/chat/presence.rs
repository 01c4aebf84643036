//! Presence tracking.
//!
//! The connection registry is the live source of truth; the users table
//! carries a durable copy of the online flag. Each user's transitions run
//! under a per-user presence lock that spans the registry change, the
//! store write and the broadcast, so they land in one order everywhere.
//! The registry's own user lock is only held for the registry change, so
//! a slow or failing store write never holds up message delivery.

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::middleware::Claims;
use crate::config::PresenceConfig;
use crate::db::models::PresenceRecord;
use crate::db::{self, run_blocking, DbPool};
use crate::error::{CoreError, CoreResult};
use crate::keyed_lock::KeyedLocks;
use crate::state::AppState;
use crate::ws::broadcast;
use crate::ws::protocol::ServerEvent;
use crate::ws::registry::{ConnectionId, ConnectionRegistry, ConnectionSender, Registration, Unregistration};

pub struct PresenceTracker {
    db: DbPool,
    registry: Arc<ConnectionRegistry>,
    transitions: KeyedLocks,
    persist_attempts: u32,
    persist_backoff: Duration,
}

impl PresenceTracker {
    pub fn new(db: DbPool, registry: Arc<ConnectionRegistry>, config: &PresenceConfig) -> Self {
        Self {
            db,
            registry,
            transitions: KeyedLocks::new(),
            persist_attempts: config.persist_attempts.max(1),
            persist_backoff: Duration::from_millis(config.persist_backoff_ms),
        }
    }

    /// Register a connection. On the user's first connection the online
    /// flag is persisted and a `presence_changed` event is broadcast.
    pub async fn connect(&self, user_id: &str, sender: ConnectionSender) -> Registration {
        let _ordered = self.transitions.lock(user_id).await;
        let registration = self.registry.register(user_id, sender).await;

        if registration.came_online {
            if let Some(event) = self.persist(user_id, None).await {
                broadcast::broadcast_to_all(&self.registry, event).await;
            }
        }
        registration
    }

    /// Remove a connection. When it was the user's last one the offline
    /// flag and last_seen_at are persisted and broadcast.
    pub async fn disconnect(&self, connection_id: ConnectionId) -> Option<Unregistration> {
        let user_id = self.registry.owner_of(connection_id)?;
        let _ordered = self.transitions.lock(&user_id).await;
        let unregistration = self.registry.unregister(connection_id).await?;

        if unregistration.went_offline {
            let seen_at = Utc::now().to_rfc3339();
            if let Some(event) = self.persist(&user_id, Some(seen_at)).await {
                broadcast::broadcast_to_all(&self.registry, event).await;
            }
        }
        Some(unregistration)
    }

    /// Write the durable flag, retrying with a fixed backoff. `seen_at` is
    /// `None` for an online transition. Returns the event to broadcast, or
    /// `None` if every attempt failed.
    async fn persist(&self, user_id: &str, seen_at: Option<String>) -> Option<ServerEvent> {
        let is_online = seen_at.is_none();

        for attempt in 1..=self.persist_attempts {
            let uid = user_id.to_string();
            let seen = seen_at.clone();
            let result = run_blocking(&self.db, move |conn| match seen {
                None => db::presence::set_online(conn, &uid),
                Some(at) => db::presence::set_offline(conn, &uid, &at),
            })
            .await;

            match result {
                Ok(()) => {
                    tracing::info!(user_id = %user_id, is_online, "Presence changed");
                    return Some(ServerEvent::PresenceChanged {
                        user_id: user_id.to_string(),
                        is_online,
                        last_seen_at: seen_at,
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        user_id = %user_id,
                        attempt,
                        error = %e,
                        "Failed to persist presence"
                    );
                    if attempt < self.persist_attempts {
                        tokio::time::sleep(self.persist_backoff).await;
                    }
                }
            }
        }

        tracing::error!(
            user_id = %user_id,
            is_online,
            attempts = self.persist_attempts,
            "Presence not persisted; live state kept"
        );
        None
    }

    pub async fn is_online(&self, user_id: &str) -> bool {
        self.registry.is_online(user_id).await
    }

    /// `presence_changed` events for every user currently online.
    pub async fn snapshot(&self) -> Vec<ServerEvent> {
        self.registry
            .online_users()
            .await
            .into_iter()
            .map(|user_id| ServerEvent::PresenceChanged {
                user_id,
                is_online: true,
                last_seen_at: None,
            })
            .collect()
    }

    pub async fn record(&self, user_id: &str) -> CoreResult<Option<PresenceRecord>> {
        let uid = user_id.to_string();
        run_blocking(&self.db, move |conn| db::presence::get_presence(conn, &uid)).await
    }

    /// Clear online flags left behind by a previous process.
    pub async fn reset_stale(&self) -> CoreResult<usize> {
        let cleared = run_blocking(&self.db, db::presence::clear_all_online).await?;
        if cleared > 0 {
            tracing::info!(cleared, "Cleared stale online flags");
        }
        Ok(cleared)
    }
}

/// GET /api/presence/{user_id}
/// The online flag comes from the live registry; last_seen_at from the store.
pub async fn get_presence(
    State(state): State<AppState>,
    _claims: Claims,
    Path(user_id): Path<String>,
) -> Result<Json<PresenceRecord>, CoreError> {
    let stored = state.presence.record(&user_id).await?;
    let is_online = state.presence.is_online(&user_id).await;

    match stored {
        Some(record) => Ok(Json(PresenceRecord { is_online, ..record })),
        None if is_online => Ok(Json(PresenceRecord {
            user_id,
            is_online,
            last_seen_at: None,
        })),
        None => Err(CoreError::NotFound(format!("user {}", user_id))),
    }
}
