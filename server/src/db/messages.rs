//! Message rows and fanout claims.

use chrono::Utc;
use rusqlite::Connection;
use uuid::Uuid;

use super::models::Message;
use crate::error::CoreResult;

pub fn insert_message(
    conn: &Connection,
    room_id: &str,
    sender_id: &str,
    content: &str,
    reply_to_id: Option<&str>,
) -> CoreResult<Message> {
    let message = Message {
        id: Uuid::now_v7().to_string(),
        room_id: room_id.to_string(),
        sender_id: sender_id.to_string(),
        content: content.to_string(),
        created_at: Utc::now().to_rfc3339(),
        reply_to_id: reply_to_id.map(str::to_string),
        edited: false,
        deleted: false,
    };

    conn.execute(
        "INSERT INTO messages (id, room_id, sender_id, content, reply_to_id, edited, deleted, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 0, 0, ?6)",
        rusqlite::params![
            message.id,
            message.room_id,
            message.sender_id,
            message.content,
            message.reply_to_id,
            message.created_at,
        ],
    )?;

    Ok(message)
}

/// Claim a message for fanout. Returns false if another trigger (in this
/// or any other process) already claimed it.
pub fn claim_fanout(conn: &Connection, message_id: &str) -> CoreResult<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO fanout_claims (message_id, claimed_at) VALUES (?1, ?2)",
        rusqlite::params![message_id, Utc::now().to_rfc3339()],
    )?;
    Ok(inserted == 1)
}
