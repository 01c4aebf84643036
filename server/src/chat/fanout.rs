//! Message fanout: live delivery, global alerts, unread accounting and
//! push notification enqueueing for one persisted message.
//!
//! Messages in the same room are processed one at a time, in trigger order.
//! Different rooms proceed in parallel.

use std::collections::HashSet;
use std::sync::Arc;

use crate::chat::unread::UnreadLedger;
use crate::config::FanoutConfig;
use crate::db::models::Message;
use crate::db::{self, run_blocking, DbPool};
use crate::error::CoreResult;
use crate::keyed_lock::KeyedLocks;
use crate::push::transport::{preview, PushPayload};
use crate::push::NotificationDispatcher;
use crate::ws::protocol::ServerEvent;
use crate::ws::registry::ConnectionRegistry;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanoutResult {
    pub message_id: String,
    /// The message had already been fanned out; nothing was sent.
    pub duplicate: bool,
    /// Connections that received `room_message`.
    pub room_deliveries: usize,
    /// Connections that received `global_alert`.
    pub alert_deliveries: usize,
    /// Users (other than the sender) listening to the room at delivery time.
    pub live_users: HashSet<String>,
    /// Members whose unread counter was incremented.
    pub unread_incremented: Vec<String>,
}

pub struct FanoutPipeline {
    db: DbPool,
    registry: Arc<ConnectionRegistry>,
    ledger: Arc<UnreadLedger>,
    dispatcher: Arc<NotificationDispatcher>,
    room_locks: KeyedLocks,
    preview_chars: usize,
}

impl FanoutPipeline {
    pub fn new(
        db: DbPool,
        registry: Arc<ConnectionRegistry>,
        ledger: Arc<UnreadLedger>,
        dispatcher: Arc<NotificationDispatcher>,
        config: &FanoutConfig,
    ) -> Self {
        Self {
            db,
            registry,
            ledger,
            dispatcher,
            room_locks: KeyedLocks::new(),
            preview_chars: config.preview_chars,
        }
    }

    /// Persist a new message and fan it out under the room's ordering lock,
    /// so delivery order always matches storage order.
    pub async fn publish(
        &self,
        room_id: &str,
        sender_id: &str,
        content: &str,
        reply_to_id: Option<&str>,
    ) -> CoreResult<(Message, FanoutResult)> {
        let _ordered = self.room_locks.lock(room_id).await;

        let (rid, sid, body) = (room_id.to_string(), sender_id.to_string(), content.to_string());
        let reply_to = reply_to_id.map(str::to_string);
        let message = run_blocking(&self.db, move |conn| {
            db::messages::insert_message(conn, &rid, &sid, &body, reply_to.as_deref())
        })
        .await?;

        let result = self.fanout_locked(&message).await?;
        Ok((message, result))
    }

    /// Fan out an already-persisted message. Triggering the same message
    /// twice has no additional effect.
    pub async fn fanout(&self, message: &Message) -> CoreResult<FanoutResult> {
        let _ordered = self.room_locks.lock(&message.room_id).await;
        self.fanout_locked(message).await
    }

    async fn fanout_locked(&self, message: &Message) -> CoreResult<FanoutResult> {
        let mid = message.id.clone();
        let claimed = run_blocking(&self.db, move |conn| db::messages::claim_fanout(conn, &mid)).await?;
        if !claimed {
            tracing::debug!(message_id = %message.id, "Fanout already claimed, skipping");
            return Ok(FanoutResult {
                message_id: message.id.clone(),
                duplicate: true,
                ..FanoutResult::default()
            });
        }

        let room_id = message.room_id.as_str();
        let sender_id = message.sender_id.as_str();

        let mut live_users = self.registry.live_users_in_room(room_id).await;
        live_users.remove(sender_id);

        // Live delivery. The sender's other devices listening to the room
        // receive it too.
        let room_event = Arc::new(ServerEvent::RoomMessage {
            room_id: room_id.to_string(),
            message: message.clone(),
        });
        let room_deliveries = self
            .registry
            .targets(|c| c.rooms.contains(room_id))
            .await
            .iter()
            .filter(|t| t.send(room_event.clone()))
            .count();

        // Everyone connected except the sender learns that something arrived.
        let alert_event = Arc::new(ServerEvent::GlobalAlert {
            room_id: room_id.to_string(),
            message_id: message.id.clone(),
            sender_id: sender_id.to_string(),
            preview: preview(&message.content, self.preview_chars),
        });
        let alert_deliveries = self
            .registry
            .targets(|c| c.user_id != sender_id)
            .await
            .iter()
            .filter(|t| t.send(alert_event.clone()))
            .count();

        let unread_incremented = self
            .ledger
            .record_message(room_id, &message.id, sender_id)
            .await?;

        // Push is queued, never awaited.
        if !unread_incremented.is_empty() {
            let payload = self.push_payload(message).await?;
            for user_id in &unread_incremented {
                self.dispatcher.dispatch(user_id.clone(), payload.clone());
            }
        }

        tracing::info!(
            message_id = %message.id,
            room_id = %room_id,
            room_deliveries,
            alert_deliveries,
            live_users = live_users.len(),
            unread_incremented = unread_incremented.len(),
            "Message fanned out"
        );

        Ok(FanoutResult {
            message_id: message.id.clone(),
            duplicate: false,
            room_deliveries,
            alert_deliveries,
            live_users,
            unread_incremented,
        })
    }

    async fn push_payload(&self, message: &Message) -> CoreResult<PushPayload> {
        let (sid, rid) = (message.sender_id.clone(), message.room_id.clone());
        let (sender_name, room_name) = run_blocking(&self.db, move |conn| {
            let sender_name = db::presence::display_name(conn, &sid)?.unwrap_or(sid);
            let room_name = db::membership::room_name(conn, &rid)?.unwrap_or(rid);
            Ok((sender_name, room_name))
        })
        .await?;
        Ok(PushPayload::new_message(
            message,
            &sender_name,
            &room_name,
            self.preview_chars,
        ))
    }
}
