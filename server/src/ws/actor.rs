use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};

use crate::state::AppState;
use crate::ws::protocol::{self, ServerEvent};
use crate::ws::registry::Outbound;

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Run the actor-per-connection pattern for an authenticated WebSocket.
///
/// The socket is split: a writer task owns the sink and drains the
/// connection's outbound queue, while this task reads client frames and
/// dispatches them. The queue's sender lives in the connection registry so
/// fanout, presence and unread updates can reach the client from anywhere.
pub async fn run_connection(socket: WebSocket, state: AppState, user_id: String) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Outbound>();

    let registration = state.presence.connect(&user_id, tx.clone()).await;
    let connection_id = registration.connection_id;

    protocol::send_event(
        &tx,
        ServerEvent::Connected {
            user_id: user_id.clone(),
            connection_id,
        },
    );
    for event in state.presence.snapshot().await {
        protocol::send_event(&tx, event);
    }

    tracing::info!(
        user_id = %user_id,
        connection_id,
        came_online = registration.came_online,
        "WebSocket actor started"
    );

    let mut writer_handle = tokio::spawn(writer_task(ws_sender, rx));

    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel::<()>();

    let ping_tx = tx.clone();
    let ping_interval = state.ws.ping_interval;
    let pong_timeout = state.ws.pong_timeout;
    // Ends on pong timeout or once the writer is gone; either way the
    // connection is torn down.
    let mut ping_handle = tokio::spawn(async move {
        let mut ping_timer = interval(ping_interval);
        // First tick fires immediately.
        ping_timer.tick().await;

        loop {
            ping_timer.tick().await;

            if ping_tx.send(Outbound::Ping(vec![1, 2, 3, 4])).is_err() {
                break;
            }

            match timeout(pong_timeout, pong_rx.recv()).await {
                Ok(Some(())) => {}
                _ => {
                    tracing::warn!(connection_id, "Pong timeout, closing connection");
                    let _ = ping_tx.send(Outbound::Close {
                        code: 1001,
                        reason: "Pong timeout".to_string(),
                    });
                    break;
                }
            }
        }
    });

    loop {
        let frame = tokio::select! {
            frame = ws_receiver.next() => frame,
            _ = &mut ping_handle => {
                tracing::info!(user_id = %user_id, connection_id, "Keepalive ended, dropping connection");
                break;
            }
        };

        match frame {
            Some(Ok(msg)) => match msg {
                Message::Text(text) => {
                    protocol::handle_text_message(
                        text.as_str(),
                        connection_id,
                        &tx,
                        &state,
                        &user_id,
                    )
                    .await;
                }
                Message::Binary(_) => {
                    tracing::debug!(user_id = %user_id, "Ignoring binary frame");
                }
                Message::Pong(_) => {
                    let _ = pong_tx.send(());
                }
                Message::Ping(data) => {
                    let _ = tx.send(Outbound::Pong(data.to_vec()));
                }
                Message::Close(frame) => {
                    tracing::info!(user_id = %user_id, reason = ?frame, "Client initiated close");
                    break;
                }
            },
            Some(Err(e)) => {
                tracing::warn!(user_id = %user_id, error = %e, "WebSocket receive error");
                break;
            }
            None => {
                tracing::info!(user_id = %user_id, "WebSocket stream ended");
                break;
            }
        }
    }

    ping_handle.abort();

    let went_offline = state
        .presence
        .disconnect(connection_id)
        .await
        .map(|u| u.went_offline)
        .unwrap_or(false);

    // The registry no longer holds a sender, so the writer stops once the
    // queue (possibly a close frame) is flushed. A stalled peer gets cut off.
    drop(tx);
    if timeout(WRITER_DRAIN_TIMEOUT, &mut writer_handle).await.is_err() {
        writer_handle.abort();
    }

    tracing::info!(
        user_id = %user_id,
        connection_id,
        went_offline,
        "WebSocket actor stopped"
    );
}

/// Drain the outbound queue into the socket until either side goes away.
async fn writer_task(
    mut ws_sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(outbound) = rx.recv().await {
        let msg = match outbound {
            Outbound::Event(event) => match serde_json::to_string(event.as_ref()) {
                Ok(text) => Message::Text(text.into()),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to serialize event");
                    continue;
                }
            },
            Outbound::Ping(data) => Message::Ping(data.into()),
            Outbound::Pong(data) => Message::Pong(data.into()),
            Outbound::Close { code, reason } => Message::Close(Some(CloseFrame {
                code,
                reason: reason.into(),
            })),
        };
        if ws_sender.send(msg).await.is_err() {
            break;
        }
    }
}
