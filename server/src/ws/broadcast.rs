use std::sync::Arc;

use super::protocol::ServerEvent;
use super::registry::{ConnectionId, ConnectionRegistry};

/// Send an event to every live connection. Returns the number queued.
pub async fn broadcast_to_all(registry: &ConnectionRegistry, event: ServerEvent) -> usize {
    let event = Arc::new(event);
    registry
        .targets(|_| true)
        .await
        .iter()
        .filter(|t| t.send(event.clone()))
        .count()
}

/// Send an event to all connections of one user.
pub async fn send_to_user(registry: &ConnectionRegistry, user_id: &str, event: ServerEvent) -> usize {
    let event = Arc::new(event);
    registry
        .user_targets(user_id)
        .await
        .iter()
        .filter(|t| t.send(event.clone()))
        .count()
}

/// Send an event to every connection listening to `room_id`, optionally
/// skipping the connection that triggered it.
pub async fn send_to_room(
    registry: &ConnectionRegistry,
    room_id: &str,
    event: ServerEvent,
    skip: Option<ConnectionId>,
) -> usize {
    let event = Arc::new(event);
    registry
        .targets(|c| c.rooms.contains(room_id) && Some(c.id) != skip)
        .await
        .iter()
        .filter(|t| t.send(event.clone()))
        .count()
}

/// Send an event to every connection listening to `room_id` that belongs
/// to someone other than `user_id`.
pub async fn send_to_room_except_user(
    registry: &ConnectionRegistry,
    room_id: &str,
    event: ServerEvent,
    user_id: &str,
) -> usize {
    let event = Arc::new(event);
    registry
        .targets(|c| c.rooms.contains(room_id) && c.user_id != user_id)
        .await
        .iter()
        .filter(|t| t.send(event.clone()))
        .count()
}
