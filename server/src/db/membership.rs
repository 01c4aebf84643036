//! Room and room-membership statements, including the atomic unread counter.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};

use super::models::RoomMembership;
use crate::error::CoreResult;

pub fn create_room(conn: &Connection, room_id: &str, name: &str) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO rooms (id, name, created_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET name = excluded.name",
        rusqlite::params![room_id, name, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

pub fn room_name(conn: &Connection, room_id: &str) -> CoreResult<Option<String>> {
    let name = conn
        .query_row(
            "SELECT name FROM rooms WHERE id = ?1",
            rusqlite::params![room_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(name)
}

/// Add or reactivate a membership. An existing unread_count is preserved.
pub fn upsert_member(conn: &Connection, room_id: &str, user_id: &str) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO room_members (room_id, user_id, joined_at, unread_count, is_active)
         VALUES (?1, ?2, ?3, 0, 1)
         ON CONFLICT(room_id, user_id) DO UPDATE SET is_active = 1",
        rusqlite::params![room_id, user_id, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

/// Soft-remove a membership. Returns the number of rows changed.
pub fn deactivate_member(conn: &Connection, room_id: &str, user_id: &str) -> CoreResult<usize> {
    let changed = conn.execute(
        "UPDATE room_members SET is_active = 0
         WHERE room_id = ?1 AND user_id = ?2 AND is_active = 1",
        rusqlite::params![room_id, user_id],
    )?;
    Ok(changed)
}

pub fn is_active_member(conn: &Connection, room_id: &str, user_id: &str) -> CoreResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM room_members
         WHERE room_id = ?1 AND user_id = ?2 AND is_active = 1",
        rusqlite::params![room_id, user_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn active_member_ids(conn: &Connection, room_id: &str) -> CoreResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT user_id FROM room_members
         WHERE room_id = ?1 AND is_active = 1
         ORDER BY joined_at ASC",
    )?;
    let ids = stmt
        .query_map(rusqlite::params![room_id], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// Add exactly one to the counter in a single statement.
/// Returns 0 when the membership is missing or inactive.
pub fn increment_unread(conn: &Connection, room_id: &str, user_id: &str) -> CoreResult<usize> {
    let changed = conn.execute(
        "UPDATE room_members SET unread_count = unread_count + 1
         WHERE room_id = ?1 AND user_id = ?2 AND is_active = 1",
        rusqlite::params![room_id, user_id],
    )?;
    Ok(changed)
}

/// Reset the counter and stamp the read marker.
/// Returns 0 when the membership is missing or inactive.
pub fn reset_unread(
    conn: &Connection,
    room_id: &str,
    user_id: &str,
    up_to_message_id: Option<&str>,
    read_at: &str,
) -> CoreResult<usize> {
    let changed = conn.execute(
        "UPDATE room_members
         SET unread_count = 0,
             last_read_at = ?3,
             last_read_message_id = COALESCE(?4, last_read_message_id)
         WHERE room_id = ?1 AND user_id = ?2 AND is_active = 1",
        rusqlite::params![room_id, user_id, read_at, up_to_message_id],
    )?;
    Ok(changed)
}

fn membership_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RoomMembership> {
    Ok(RoomMembership {
        room_id: row.get(0)?,
        user_id: row.get(1)?,
        joined_at: row.get(2)?,
        last_read_at: row.get(3)?,
        last_read_message_id: row.get(4)?,
        unread_count: row.get(5)?,
        is_active: row.get::<_, i64>(6)? != 0,
    })
}

pub fn get_membership(
    conn: &Connection,
    room_id: &str,
    user_id: &str,
) -> CoreResult<Option<RoomMembership>> {
    let membership = conn
        .query_row(
            "SELECT room_id, user_id, joined_at, last_read_at, last_read_message_id,
                    unread_count, is_active
             FROM room_members WHERE room_id = ?1 AND user_id = ?2",
            rusqlite::params![room_id, user_id],
            membership_from_row,
        )
        .optional()?;
    Ok(membership)
}

/// All active memberships of a user, for badge rendering.
pub fn active_memberships_for_user(
    conn: &Connection,
    user_id: &str,
) -> CoreResult<Vec<RoomMembership>> {
    let mut stmt = conn.prepare(
        "SELECT room_id, user_id, joined_at, last_read_at, last_read_message_id,
                unread_count, is_active
         FROM room_members WHERE user_id = ?1 AND is_active = 1
         ORDER BY room_id ASC",
    )?;
    let rows = stmt
        .query_map(rusqlite::params![user_id], membership_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
