use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::db::models::Message;
use crate::error::{CoreError, CoreResult};
use crate::state::AppState;
use crate::ws::broadcast;
use crate::ws::registry::{ConnectionId, ConnectionSender, Outbound};

/// Events pushed from the server to clients.
///
/// Serialized as `{"event": "<name>", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    Connected {
        user_id: String,
        connection_id: ConnectionId,
    },
    PresenceChanged {
        user_id: String,
        is_online: bool,
        last_seen_at: Option<String>,
    },
    RoomMessage {
        room_id: String,
        message: Message,
    },
    GlobalAlert {
        room_id: String,
        message_id: String,
        sender_id: String,
        preview: String,
    },
    UnreadReset {
        room_id: String,
        user_id: String,
    },
    /// Read receipt for the room's other listeners.
    MessagesRead {
        room_id: String,
        user_id: String,
        last_read_message_id: Option<String>,
        read_at: String,
    },
    RoomJoined {
        room_id: String,
    },
    RoomLeft {
        room_id: String,
    },
    UserJoined {
        room_id: String,
        user_id: String,
    },
    UserLeft {
        room_id: String,
        user_id: String,
    },
    UserTyping {
        room_id: String,
        user_id: String,
        is_typing: bool,
    },
    Error {
        code: String,
        message: String,
    },
}

/// Commands sent by clients, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    JoinRoom {
        room_id: String,
    },
    LeaveRoom {
        room_id: String,
    },
    MarkAsRead {
        room_id: String,
        #[serde(default)]
        up_to_message_id: Option<String>,
    },
    Typing {
        room_id: String,
        #[serde(default = "default_typing")]
        is_typing: bool,
    },
}

fn default_typing() -> bool {
    true
}

/// Handle an incoming text frame: parse the command, run it, and report
/// failures back to the sending connection as an `error` event.
pub async fn handle_text_message(
    text: &str,
    connection_id: ConnectionId,
    tx: &ConnectionSender,
    state: &AppState,
    user_id: &str,
) {
    let command = match serde_json::from_str::<ClientCommand>(text) {
        Ok(command) => command,
        Err(e) => {
            tracing::debug!(
                user_id = %user_id,
                connection_id,
                error = %e,
                "Failed to parse client command"
            );
            send_error(tx, &CoreError::InvalidInput(e.to_string()));
            return;
        }
    };

    if let Err(err) = dispatch_command(command, connection_id, tx, state, user_id).await {
        match &err {
            CoreError::NotAMember { .. } | CoreError::InvalidInput(_) => {
                tracing::debug!(user_id = %user_id, connection_id, error = %err, "Command rejected");
            }
            _ => {
                tracing::warn!(user_id = %user_id, connection_id, error = %err, "Command failed");
            }
        }
        send_error(tx, &err);
    }
}

async fn dispatch_command(
    command: ClientCommand,
    connection_id: ConnectionId,
    tx: &ConnectionSender,
    state: &AppState,
    user_id: &str,
) -> CoreResult<()> {
    match command {
        ClientCommand::JoinRoom { room_id } => {
            let newly_joined = state
                .registry
                .join_room(connection_id, &room_id, state.membership.as_ref())
                .await?;
            send_event(tx, ServerEvent::RoomJoined { room_id: room_id.clone() });
            if newly_joined {
                broadcast::send_to_room(
                    &state.registry,
                    &room_id,
                    ServerEvent::UserJoined {
                        room_id: room_id.clone(),
                        user_id: user_id.to_string(),
                    },
                    Some(connection_id),
                )
                .await;
            }
        }
        ClientCommand::LeaveRoom { room_id } => {
            let was_joined = state
                .registry
                .leave_room(connection_id, &room_id, state.membership.as_ref())
                .await?;
            send_event(tx, ServerEvent::RoomLeft { room_id: room_id.clone() });
            if was_joined {
                broadcast::send_to_room(
                    &state.registry,
                    &room_id,
                    ServerEvent::UserLeft {
                        room_id: room_id.clone(),
                        user_id: user_id.to_string(),
                    },
                    None,
                )
                .await;
            }
        }
        ClientCommand::MarkAsRead {
            room_id,
            up_to_message_id,
        } => {
            state
                .ledger
                .acknowledge_read(&room_id, user_id, up_to_message_id.as_deref())
                .await?;
        }
        ClientCommand::Typing { room_id, is_typing } => {
            if !state.membership.is_member(&room_id, user_id).await? {
                return Err(CoreError::not_a_member(&room_id, user_id));
            }
            broadcast::send_to_room(
                &state.registry,
                &room_id,
                ServerEvent::UserTyping {
                    room_id: room_id.clone(),
                    user_id: user_id.to_string(),
                    is_typing,
                },
                Some(connection_id),
            )
            .await;
        }
    }
    Ok(())
}

/// Queue an event on one connection.
pub fn send_event(tx: &ConnectionSender, event: ServerEvent) {
    let _ = tx.send(Outbound::Event(Arc::new(event)));
}

/// Queue an `error` event on one connection.
pub fn send_error(tx: &ConnectionSender, err: &CoreError) {
    send_event(
        tx,
        ServerEvent::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        },
    );
}
