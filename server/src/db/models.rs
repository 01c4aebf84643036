/// Database row types.
/// These correspond 1:1 to the SQLite schema defined in migrations.rs.
use serde::{Deserialize, Serialize};

/// Durable online flag for a user (stored on the users row).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: String,
    pub is_online: bool,
    pub last_seen_at: Option<String>,
}

/// A user's membership in a room, including the unread counter.
#[derive(Debug, Clone, Serialize)]
pub struct RoomMembership {
    pub room_id: String,
    pub user_id: String,
    pub joined_at: String,
    pub last_read_at: Option<String>,
    pub last_read_message_id: Option<String>,
    pub unread_count: i64,
    pub is_active: bool,
}

/// Registered push endpoint (one per device).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushSubscription {
    pub id: String,
    pub user_id: String,
    pub endpoint: String,
    pub p256dh: Option<String>,
    pub auth: Option<String>,
    pub created_at: String,
}

/// A persisted chat message. Only read by the core as a fanout trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub room_id: String,
    pub sender_id: String,
    pub content: String,
    pub created_at: String,
    pub reply_to_id: Option<String>,
    pub edited: bool,
    pub deleted: bool,
}
