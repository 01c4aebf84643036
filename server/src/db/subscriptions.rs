//! Push subscription rows.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use uuid::Uuid;

use super::models::PushSubscription;
use crate::error::{CoreError, CoreResult};

fn subscription_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PushSubscription> {
    Ok(PushSubscription {
        id: row.get(0)?,
        user_id: row.get(1)?,
        endpoint: row.get(2)?,
        p256dh: row.get(3)?,
        auth: row.get(4)?,
        created_at: row.get(5)?,
    })
}

/// Register an endpoint for a user. Re-registering the same endpoint
/// refreshes its keys and keeps the original id.
pub fn upsert_subscription(
    conn: &Connection,
    user_id: &str,
    endpoint: &str,
    p256dh: Option<&str>,
    auth: Option<&str>,
) -> CoreResult<PushSubscription> {
    conn.execute(
        "INSERT INTO push_subscriptions (id, user_id, endpoint, p256dh, auth, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(user_id, endpoint) DO UPDATE SET
            p256dh = excluded.p256dh,
            auth = excluded.auth",
        rusqlite::params![
            Uuid::now_v7().to_string(),
            user_id,
            endpoint,
            p256dh,
            auth,
            Utc::now().to_rfc3339(),
        ],
    )?;

    conn.query_row(
        "SELECT id, user_id, endpoint, p256dh, auth, created_at
         FROM push_subscriptions WHERE user_id = ?1 AND endpoint = ?2",
        rusqlite::params![user_id, endpoint],
        subscription_from_row,
    )
    .optional()?
    .ok_or_else(|| CoreError::Persistence("subscription vanished after upsert".to_string()))
}

pub fn list_for_user(conn: &Connection, user_id: &str) -> CoreResult<Vec<PushSubscription>> {
    let mut stmt = conn.prepare(
        "SELECT id, user_id, endpoint, p256dh, auth, created_at
         FROM push_subscriptions WHERE user_id = ?1
         ORDER BY created_at ASC",
    )?;
    let rows = stmt
        .query_map(rusqlite::params![user_id], subscription_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Delete by id. Used when the push channel reports the endpoint is gone.
pub fn delete_subscription(conn: &Connection, subscription_id: &str) -> CoreResult<usize> {
    let changed = conn.execute(
        "DELETE FROM push_subscriptions WHERE id = ?1",
        rusqlite::params![subscription_id],
    )?;
    Ok(changed)
}

/// Delete by id, only if owned by `user_id`.
pub fn delete_owned_subscription(
    conn: &Connection,
    subscription_id: &str,
    user_id: &str,
) -> CoreResult<usize> {
    let changed = conn.execute(
        "DELETE FROM push_subscriptions WHERE id = ?1 AND user_id = ?2",
        rusqlite::params![subscription_id, user_id],
    )?;
    Ok(changed)
}
