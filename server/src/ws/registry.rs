//! Connection registry: tracks every live WebSocket connection per user and
//! the rooms each connection is listening to.
//!
//! Each user owns one async mutex ("slot"). Every mutation of a user's
//! connection set goes through that mutex, so online/offline transitions for
//! a single user are linearizable. Different users never contend with each
//! other beyond the DashMap shard lookup.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};

use super::protocol::ServerEvent;
use crate::error::{CoreError, CoreResult};

/// Opaque connection token, unique per process.
pub type ConnectionId = u64;

/// Frames queued for a connection's writer task.
#[derive(Debug, Clone)]
pub enum Outbound {
    Event(Arc<ServerEvent>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close { code: u16, reason: String },
}

/// Sender half of a connection's outbound queue.
/// Other parts of the system clone this to push events to one client.
pub type ConnectionSender = mpsc::UnboundedSender<Outbound>;

/// Membership check consulted before a connection may join or leave a room.
pub trait MembershipCheck {
    fn is_member(
        &self,
        room_id: &str,
        user_id: &str,
    ) -> impl Future<Output = CoreResult<bool>> + Send;
}

/// One live connection.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub user_id: String,
    pub rooms: HashSet<String>,
    pub created_at: DateTime<Utc>,
    sender: ConnectionSender,
}

#[derive(Debug, Default)]
pub struct UserSlot {
    connections: HashMap<ConnectionId, Connection>,
}

/// Exclusive access to one user's connections. Dropping the guard releases
/// the user and discards the slot if it is empty and unused.
pub struct UserGuard<'a> {
    registry: &'a ConnectionRegistry,
    user_id: String,
    slot: Option<OwnedMutexGuard<UserSlot>>,
}

impl UserGuard<'_> {
    fn slot(&self) -> &UserSlot {
        self.slot.as_ref().expect("slot held until drop")
    }

    fn slot_mut(&mut self) -> &mut UserSlot {
        self.slot.as_mut().expect("slot held until drop")
    }

    pub fn is_online(&self) -> bool {
        !self.slot().connections.is_empty()
    }

    pub fn connection_count(&self) -> usize {
        self.slot().connections.len()
    }

    /// True if at least one of the user's connections has joined `room_id`.
    pub fn is_listening(&self, room_id: &str) -> bool {
        self.slot()
            .connections
            .values()
            .any(|c| c.rooms.contains(room_id))
    }

    fn connection_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.slot_mut().connections.get_mut(&id)
    }
}

impl Drop for UserGuard<'_> {
    fn drop(&mut self) {
        drop(self.slot.take());
        self.registry.release(&self.user_id);
    }
}

/// Result of adding a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub connection_id: ConnectionId,
    /// The user went from zero to one connection.
    pub came_online: bool,
}

/// Result of removing a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unregistration {
    pub user_id: String,
    /// The user's last connection closed.
    pub went_offline: bool,
}

/// Snapshot of a connection taken for delivery outside the user lock.
#[derive(Debug, Clone)]
pub struct ConnectionTarget {
    pub connection_id: ConnectionId,
    pub user_id: String,
    pub sender: ConnectionSender,
}

impl ConnectionTarget {
    pub fn send(&self, event: Arc<ServerEvent>) -> bool {
        self.sender.send(Outbound::Event(event)).is_ok()
    }
}

pub struct ConnectionRegistry {
    users: DashMap<String, Arc<Mutex<UserSlot>>>,
    owners: DashMap<ConnectionId, String>,
    next_id: AtomicU64,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            users: DashMap::new(),
            owners: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Serialize against every other mutation of `user_id`'s connections.
    pub async fn lock_user(&self, user_id: &str) -> UserGuard<'_> {
        // Clone the Arc so the shard lock is released before awaiting.
        let slot = self
            .users
            .entry(user_id.to_string())
            .or_default()
            .value()
            .clone();
        UserGuard {
            registry: self,
            user_id: user_id.to_string(),
            slot: Some(slot.lock_owned().await),
        }
    }

    /// Drop the user's slot if nobody holds it and it has no connections.
    fn release(&self, user_id: &str) {
        self.users.remove_if(user_id, |_, slot| {
            Arc::strong_count(slot) == 1
                && slot
                    .try_lock()
                    .map(|s| s.connections.is_empty())
                    .unwrap_or(false)
        });
    }

    /// Add a connection under an already-held user lock.
    fn attach(&self, guard: &mut UserGuard<'_>, sender: ConnectionSender) -> Registration {
        let connection_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let came_online = !guard.is_online();
        let user_id = guard.user_id.clone();
        guard.slot_mut().connections.insert(
            connection_id,
            Connection {
                id: connection_id,
                user_id: user_id.clone(),
                rooms: HashSet::new(),
                created_at: Utc::now(),
                sender,
            },
        );
        self.owners.insert(connection_id, user_id);

        tracing::debug!(
            user_id = %guard.user_id,
            connection_id,
            connections = guard.connection_count(),
            "Connection registered"
        );

        Registration {
            connection_id,
            came_online,
        }
    }

    /// Remove a connection under an already-held user lock.
    /// Returns `Some(went_offline)` if the connection existed.
    fn detach(&self, guard: &mut UserGuard<'_>, connection_id: ConnectionId) -> Option<bool> {
        guard.slot_mut().connections.remove(&connection_id)?;
        self.owners.remove(&connection_id);

        tracing::debug!(
            user_id = %guard.user_id,
            connection_id,
            connections = guard.connection_count(),
            "Connection unregistered"
        );

        Some(!guard.is_online())
    }

    pub async fn register(&self, user_id: &str, sender: ConnectionSender) -> Registration {
        let mut guard = self.lock_user(user_id).await;
        self.attach(&mut guard, sender)
    }

    pub async fn unregister(&self, connection_id: ConnectionId) -> Option<Unregistration> {
        let user_id = self.owner_of(connection_id)?;
        let mut guard = self.lock_user(&user_id).await;
        let went_offline = self.detach(&mut guard, connection_id)?;
        Some(Unregistration {
            user_id,
            went_offline,
        })
    }

    pub fn owner_of(&self, connection_id: ConnectionId) -> Option<String> {
        self.owners.get(&connection_id).map(|e| e.value().clone())
    }

    fn existing_slot(&self, user_id: &str) -> Option<Arc<Mutex<UserSlot>>> {
        self.users.get(user_id).map(|e| e.value().clone())
    }

    pub async fn is_online(&self, user_id: &str) -> bool {
        match self.existing_slot(user_id) {
            Some(slot) => !slot.lock().await.connections.is_empty(),
            None => false,
        }
    }

    pub async fn connection_count(&self, user_id: &str) -> usize {
        match self.existing_slot(user_id) {
            Some(slot) => slot.lock().await.connections.len(),
            None => 0,
        }
    }

    /// Rooms the connection currently listens to.
    pub async fn rooms_of(&self, connection_id: ConnectionId) -> Option<HashSet<String>> {
        let user_id = self.owner_of(connection_id)?;
        let slot = self.existing_slot(&user_id)?;
        let slot = slot.lock().await;
        slot.connections.get(&connection_id).map(|c| c.rooms.clone())
    }

    fn slots(&self) -> Vec<(String, Arc<Mutex<UserSlot>>)> {
        self.users
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub async fn online_users(&self) -> Vec<String> {
        let mut online = Vec::new();
        for (user_id, slot) in self.slots() {
            if !slot.lock().await.connections.is_empty() {
                online.push(user_id);
            }
        }
        online
    }

    /// Users with at least one connection joined to `room_id`.
    pub async fn live_users_in_room(&self, room_id: &str) -> HashSet<String> {
        let mut live = HashSet::new();
        for (user_id, slot) in self.slots() {
            let slot = slot.lock().await;
            if slot.connections.values().any(|c| c.rooms.contains(room_id)) {
                live.insert(user_id);
            }
        }
        live
    }

    /// Snapshot every connection matching `filter`.
    pub async fn targets<F>(&self, filter: F) -> Vec<ConnectionTarget>
    where
        F: Fn(&Connection) -> bool,
    {
        let mut targets = Vec::new();
        for (_, slot) in self.slots() {
            let slot = slot.lock().await;
            targets.extend(slot.connections.values().filter(|c| filter(c)).map(|c| {
                ConnectionTarget {
                    connection_id: c.id,
                    user_id: c.user_id.clone(),
                    sender: c.sender.clone(),
                }
            }));
        }
        targets
    }

    pub async fn user_targets(&self, user_id: &str) -> Vec<ConnectionTarget> {
        let Some(slot) = self.existing_slot(user_id) else {
            return Vec::new();
        };
        let slot = slot.lock().await;
        slot.connections
            .values()
            .map(|c| ConnectionTarget {
                connection_id: c.id,
                user_id: c.user_id.clone(),
                sender: c.sender.clone(),
            })
            .collect()
    }

    /// Start listening to a room on one connection.
    ///
    /// The membership check runs while the user's lock is held, so a
    /// concurrent membership removal (which evicts under the same lock)
    /// cannot be overtaken. Returns true if the room was newly joined.
    pub async fn join_room<M: MembershipCheck + Sync>(
        &self,
        connection_id: ConnectionId,
        room_id: &str,
        membership: &M,
    ) -> CoreResult<bool> {
        let user_id = self
            .owner_of(connection_id)
            .ok_or_else(|| CoreError::NotFound(format!("connection {}", connection_id)))?;
        let mut guard = self.lock_user(&user_id).await;

        if !membership.is_member(room_id, &user_id).await? {
            return Err(CoreError::not_a_member(room_id, &user_id));
        }

        let connection = guard
            .connection_mut(connection_id)
            .ok_or_else(|| CoreError::NotFound(format!("connection {}", connection_id)))?;
        let newly_joined = connection.rooms.insert(room_id.to_string());

        tracing::debug!(user_id = %user_id, connection_id, room_id = %room_id, "Joined room");
        Ok(newly_joined)
    }

    /// Stop listening to a room on one connection.
    /// Returns true if the connection had joined the room.
    pub async fn leave_room<M: MembershipCheck + Sync>(
        &self,
        connection_id: ConnectionId,
        room_id: &str,
        membership: &M,
    ) -> CoreResult<bool> {
        let user_id = self
            .owner_of(connection_id)
            .ok_or_else(|| CoreError::NotFound(format!("connection {}", connection_id)))?;
        let mut guard = self.lock_user(&user_id).await;

        if !membership.is_member(room_id, &user_id).await? {
            return Err(CoreError::not_a_member(room_id, &user_id));
        }

        let connection = guard
            .connection_mut(connection_id)
            .ok_or_else(|| CoreError::NotFound(format!("connection {}", connection_id)))?;
        let was_joined = connection.rooms.remove(room_id);

        tracing::debug!(user_id = %user_id, connection_id, room_id = %room_id, "Left room");
        Ok(was_joined)
    }

    /// Remove `room_id` from every connection of `user_id`.
    /// Called when the user's membership is revoked.
    pub async fn evict_room(&self, user_id: &str, room_id: &str) -> usize {
        if self.existing_slot(user_id).is_none() {
            return 0;
        }
        let mut guard = self.lock_user(user_id).await;
        let mut evicted = 0;
        for connection in guard.slot_mut().connections.values_mut() {
            if connection.rooms.remove(room_id) {
                evicted += 1;
            }
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AllowAll;

    impl MembershipCheck for AllowAll {
        async fn is_member(&self, _room_id: &str, _user_id: &str) -> CoreResult<bool> {
            Ok(true)
        }
    }

    #[tokio::test]
    async fn empty_slots_are_released() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let reg = registry.register("u1", tx).await;
        assert!(reg.came_online);
        assert_eq!(registry.users.len(), 1);

        let gone = registry.unregister(reg.connection_id).await.unwrap();
        assert!(gone.went_offline);
        assert_eq!(registry.users.len(), 0);
        assert!(registry.owner_of(reg.connection_id).is_none());
    }

    #[tokio::test]
    async fn locking_an_offline_user_leaves_no_residue() {
        let registry = ConnectionRegistry::new();
        {
            let guard = registry.lock_user("ghost").await;
            assert!(!guard.is_online());
        }
        assert_eq!(registry.users.len(), 0);
    }

    #[tokio::test]
    async fn evict_room_clears_every_connection() {
        let registry = ConnectionRegistry::new();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let a = registry.register("u1", tx1).await.connection_id;
        let b = registry.register("u1", tx2).await.connection_id;
        registry.join_room(a, "r1", &AllowAll).await.unwrap();
        registry.join_room(b, "r1", &AllowAll).await.unwrap();

        assert_eq!(registry.evict_room("u1", "r1").await, 2);
        assert!(registry.live_users_in_room("r1").await.is_empty());
    }
}
