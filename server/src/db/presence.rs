//! Presence flag persistence on the users table.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};

use super::models::PresenceRecord;
use crate::error::CoreResult;

/// Create the user row if it does not exist yet.
pub fn ensure_user(conn: &Connection, user_id: &str, display_name: &str) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO users (id, display_name, is_online, last_seen_at, created_at)
         VALUES (?1, ?2, 0, NULL, ?3)
         ON CONFLICT(id) DO NOTHING",
        rusqlite::params![user_id, display_name, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

/// Mark a user online, creating the record lazily on first connect.
/// last_seen_at is left untouched.
pub fn set_online(conn: &Connection, user_id: &str) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO users (id, display_name, is_online, last_seen_at, created_at)
         VALUES (?1, ?1, 1, NULL, ?2)
         ON CONFLICT(id) DO UPDATE SET is_online = 1",
        rusqlite::params![user_id, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

/// Mark a user offline and stamp last_seen_at.
pub fn set_offline(conn: &Connection, user_id: &str, seen_at: &str) -> CoreResult<()> {
    conn.execute(
        "UPDATE users SET is_online = 0, last_seen_at = ?2 WHERE id = ?1",
        rusqlite::params![user_id, seen_at],
    )?;
    Ok(())
}

pub fn get_presence(conn: &Connection, user_id: &str) -> CoreResult<Option<PresenceRecord>> {
    let record = conn
        .query_row(
            "SELECT id, is_online, last_seen_at FROM users WHERE id = ?1",
            rusqlite::params![user_id],
            |row| {
                Ok(PresenceRecord {
                    user_id: row.get(0)?,
                    is_online: row.get::<_, i64>(1)? != 0,
                    last_seen_at: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(record)
}

pub fn display_name(conn: &Connection, user_id: &str) -> CoreResult<Option<String>> {
    let name = conn
        .query_row(
            "SELECT display_name FROM users WHERE id = ?1",
            rusqlite::params![user_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(name)
}

/// Clear every online flag. The connection registry is empty after a
/// restart, so no stored flag can be true.
pub fn clear_all_online(conn: &Connection) -> CoreResult<usize> {
    let count = conn.execute(
        "UPDATE users SET is_online = 0, last_seen_at = COALESCE(last_seen_at, ?1)
         WHERE is_online = 1",
        rusqlite::params![Utc::now().to_rfc3339()],
    )?;
    Ok(count)
}
