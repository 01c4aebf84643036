//! End-to-end tests over a real socket: WebSocket auth, commands and
//! events, plus the REST surface that drives them.

mod common;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;

use common::{seed_room, start_server, test_env, test_env_with, token_for};
use huddle_server::auth::jwt;
use huddle_server::config::{Config, WsConfig};
use huddle_server::db::models::PresenceRecord;
use huddle_server::state::AppState;

type WsRead = futures_util::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
>;
type WsWrite = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

async fn open_ws(addr: SocketAddr, token: &str) -> (WsWrite, WsRead) {
    let ws_url = format!("ws://{}/ws?token={}", addr, token);
    let (ws_stream, _) = tokio_tungstenite::connect_async(ws_url)
        .await
        .expect("Failed to connect to WebSocket");
    ws_stream.split()
}

/// Read frames until an event named `name` arrives, skipping others.
async fn next_event(read: &mut WsRead, name: &str) -> Value {
    let deadline = Duration::from_secs(3);
    tokio::time::timeout(deadline, async {
        loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => {
                    let value: Value = serde_json::from_str(text.as_str()).unwrap();
                    if value["event"] == name {
                        return value["data"].clone();
                    }
                }
                Some(Ok(_)) => continue,
                other => panic!("Socket ended while waiting for {}: {:?}", name, other),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("Timed out waiting for {}", name))
}

async fn send_command(write: &mut WsWrite, command: Value) {
    write
        .send(Message::Text(command.to_string().into()))
        .await
        .expect("Failed to send command");
}

async fn setup() -> (AppState, SocketAddr, common::TestEnv) {
    let env = test_env();
    let state = env.state.clone();
    let addr = start_server(state.clone()).await;
    (state, addr, env)
}

#[tokio::test]
async fn valid_token_receives_connected_event() {
    let (state, addr, _env) = setup().await;
    let (_write, mut read) = open_ws(addr, &token_for(&state, "alice")).await;

    let data = next_event(&mut read, "connected").await;
    assert_eq!(data["user_id"], "alice");

    let presence = next_event(&mut read, "presence_changed").await;
    assert_eq!(presence["user_id"], "alice");
    assert_eq!(presence["is_online"], true);
    assert!(state.presence.is_online("alice").await);
}

async fn expect_close_code(addr: SocketAddr, token: &str, expected: u16) {
    let (_write, mut read) = open_ws(addr, token).await;
    let msg = tokio::time::timeout(Duration::from_secs(2), read.next())
        .await
        .expect("Expected close message within timeout");

    match msg {
        Some(Ok(Message::Close(Some(frame)))) => {
            assert_eq!(u16::from(frame.code), expected);
        }
        other => panic!("Expected close frame, got: {:?}", other),
    }
}

#[tokio::test]
async fn invalid_token_is_closed_with_4002() {
    let (_state, addr, _env) = setup().await;
    expect_close_code(addr, "invalid_jwt_token", 4002).await;
}

#[tokio::test]
async fn expired_token_is_closed_with_4001() {
    let (state, addr, _env) = setup().await;
    let expired = jwt::issue_access_token(&state.jwt_secret, "alice", -3600).unwrap();
    expect_close_code(addr, &expired, 4001).await;
}

#[tokio::test]
async fn joining_a_foreign_room_returns_error_event() {
    let (state, addr, _env) = setup().await;
    seed_room(&state, "r1", &["alice"]).await;

    let (mut write, mut read) = open_ws(addr, &token_for(&state, "mallory")).await;
    next_event(&mut read, "connected").await;

    send_command(&mut write, json!({"type": "join_room", "room_id": "r1"})).await;
    let error = next_event(&mut read, "error").await;
    assert_eq!(error["code"], "not_a_member");
    assert!(state.registry.live_users_in_room("r1").await.is_empty());
}

#[tokio::test]
async fn malformed_command_returns_invalid_input() {
    let (state, addr, _env) = setup().await;
    let (mut write, mut read) = open_ws(addr, &token_for(&state, "alice")).await;
    next_event(&mut read, "connected").await;

    send_command(&mut write, json!({"type": "shout"})).await;
    let error = next_event(&mut read, "error").await;
    assert_eq!(error["code"], "invalid_input");
}

#[tokio::test]
async fn posted_message_reaches_room_and_unread_counts_offline_member() {
    let (state, addr, _env) = setup().await;
    seed_room(&state, "r1", &["alice", "bob", "carol"]).await;

    let (mut write, mut read) = open_ws(addr, &token_for(&state, "bob")).await;
    next_event(&mut read, "connected").await;
    send_command(&mut write, json!({"type": "join_room", "room_id": "r1"})).await;
    next_event(&mut read, "room_joined").await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{}/api/rooms/r1/messages", addr))
        .bearer_auth(token_for(&state, "alice"))
        .json(&json!({"content": "hello room"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let created: Value = resp.json().await.unwrap();

    let delivered = next_event(&mut read, "room_message").await;
    assert_eq!(delivered["message"]["id"], created["id"]);
    assert_eq!(delivered["message"]["content"], "hello room");

    let resp = client
        .get(format!("http://{}/api/rooms/unread", addr))
        .bearer_auth(token_for(&state, "carol"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let unread: Value = resp.json().await.unwrap();
    assert_eq!(unread[0]["room_id"], "r1");
    assert_eq!(unread[0]["unread_count"], 1);

    assert_eq!(state.ledger.unread_count("r1", "bob").await.unwrap(), 0);
}

#[tokio::test]
async fn mark_as_read_resets_and_notifies() {
    let (state, addr, _env) = setup().await;
    seed_room(&state, "r1", &["alice", "bob"]).await;
    state.ledger.record_message("r1", "m1", "alice").await.unwrap();

    let (mut write, mut read) = open_ws(addr, &token_for(&state, "bob")).await;
    next_event(&mut read, "connected").await;

    send_command(
        &mut write,
        json!({"type": "mark_as_read", "room_id": "r1", "up_to_message_id": "m1"}),
    )
    .await;
    let reset = next_event(&mut read, "unread_reset").await;
    assert_eq!(reset["room_id"], "r1");
    assert_eq!(state.ledger.unread_count("r1", "bob").await.unwrap(), 0);
}

#[tokio::test]
async fn typing_is_relayed_to_other_listeners() {
    let (state, addr, _env) = setup().await;
    seed_room(&state, "r1", &["alice", "bob"]).await;

    let (mut alice_write, mut alice_read) = open_ws(addr, &token_for(&state, "alice")).await;
    let (mut bob_write, mut bob_read) = open_ws(addr, &token_for(&state, "bob")).await;
    next_event(&mut alice_read, "connected").await;
    next_event(&mut bob_read, "connected").await;

    send_command(&mut alice_write, json!({"type": "join_room", "room_id": "r1"})).await;
    next_event(&mut alice_read, "room_joined").await;
    send_command(&mut bob_write, json!({"type": "join_room", "room_id": "r1"})).await;
    next_event(&mut bob_read, "room_joined").await;

    send_command(&mut alice_write, json!({"type": "typing", "room_id": "r1"})).await;
    let typing = next_event(&mut bob_read, "user_typing").await;
    assert_eq!(typing["user_id"], "alice");
    assert_eq!(typing["is_typing"], true);
}

#[tokio::test]
async fn client_ping_gets_pong() {
    let (state, addr, _env) = setup().await;
    let (mut write, mut read) = open_ws(addr, &token_for(&state, "alice")).await;
    next_event(&mut read, "connected").await;

    write
        .send(Message::Ping(vec![42, 43, 44].into()))
        .await
        .expect("Failed to send ping");

    let pong = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match read.next().await {
                Some(Ok(Message::Pong(data))) => return data,
                Some(Ok(_)) => continue,
                other => panic!("Expected Pong message, got: {:?}", other),
            }
        }
    })
    .await
    .expect("Expected pong within timeout");
    assert_eq!(&pong[..], &[42u8, 43, 44]);
}

#[tokio::test]
async fn closing_the_socket_marks_user_offline() {
    let (state, addr, _env) = setup().await;
    let (mut write, mut read) = open_ws(addr, &token_for(&state, "alice")).await;
    next_event(&mut read, "connected").await;
    assert!(state.presence.is_online("alice").await);

    write.send(Message::Close(None)).await.unwrap();
    drop(write);
    drop(read);

    for _ in 0..50 {
        if !state.presence.is_online("alice").await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!state.presence.is_online("alice").await);
    let record = stored_offline_record(&state, "alice").await;
    assert!(record.last_seen_at.is_some());
}

async fn wait_for_presence(state: &AppState, user_id: &str, online: bool, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if state.presence.is_online(user_id).await == online {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// The offline write lands just after the registry change; wait for it.
async fn stored_offline_record(state: &AppState, user_id: &str) -> PresenceRecord {
    for _ in 0..40 {
        let record = state.presence.record(user_id).await.unwrap().unwrap();
        if !record.is_online {
            return record;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("{} still stored as online", user_id);
}

#[tokio::test]
async fn silent_client_is_dropped_after_pong_timeout() {
    let env = test_env_with(Config {
        ws: Some(WsConfig {
            ping_interval_secs: 1,
            pong_timeout_secs: 1,
        }),
        ..Config::default()
    });
    let state = env.state.clone();
    let addr = start_server(state.clone()).await;

    // Never polled, so the client answers no pings.
    let ws_url = format!("ws://{}/ws?token={}", addr, token_for(&state, "alice"));
    let (_frozen, _) = tokio_tungstenite::connect_async(ws_url)
        .await
        .expect("Failed to connect to WebSocket");

    assert!(wait_for_presence(&state, "alice", true, Duration::from_secs(2)).await);
    assert!(wait_for_presence(&state, "alice", false, Duration::from_secs(6)).await);
    assert_eq!(state.registry.connection_count("alice").await, 0);

    let record = stored_offline_record(&state, "alice").await;
    assert!(record.last_seen_at.is_some());
}

#[tokio::test]
async fn rest_rejects_non_members_and_bad_content() {
    let (state, addr, _env) = setup().await;
    seed_room(&state, "r1", &["alice"]).await;
    let client = reqwest::Client::new();
    let url = format!("http://{}/api/rooms/r1/messages", addr);

    let resp = client
        .post(&url)
        .bearer_auth(token_for(&state, "mallory"))
        .json(&json!({"content": "let me in"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "not_a_member");

    let resp = client
        .post(&url)
        .bearer_auth(token_for(&state, "alice"))
        .json(&json!({"content": "   "}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client.post(&url).json(&json!({"content": "hi"})).send().await.unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn push_subscription_lifecycle() {
    let (state, addr, _env) = setup().await;
    let client = reqwest::Client::new();
    let token = token_for(&state, "alice");
    let base = format!("http://{}/api/push/subscriptions", addr);

    let body = json!({
        "endpoint": "https://push.example/alice",
        "keys": {"p256dh": "key", "auth": "secret"}
    });
    let first: Value = client
        .post(&base)
        .bearer_auth(&token)
        .json(&body)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    // Re-registering the same endpoint keeps the same subscription.
    let second: Value = client
        .post(&base)
        .bearer_auth(&token)
        .json(&body)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(first["id"], second["id"]);

    let listed: Value = client
        .get(&base)
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let id = first["id"].as_str().unwrap();
    let other = client
        .delete(format!("{}/{}", base, id))
        .bearer_auth(token_for(&state, "mallory"))
        .send()
        .await
        .unwrap();
    assert_eq!(other.status(), 404);

    let resp = client
        .delete(format!("{}/{}", base, id))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);
}

#[tokio::test]
async fn rooms_can_be_created_and_shared_over_rest() {
    let (state, addr, _env) = setup().await;
    let client = reqwest::Client::new();

    let room: Value = client
        .post(format!("http://{}/api/rooms", addr))
        .bearer_auth(token_for(&state, "alice"))
        .json(&json!({"name": "general"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let room_id = room["id"].as_str().unwrap().to_string();

    let resp = client
        .post(format!("http://{}/api/rooms/{}/members", addr, room_id))
        .bearer_auth(token_for(&state, "alice"))
        .json(&json!({"user_id": "bob"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);
    assert!(state.membership.is_member(&room_id, "bob").await.unwrap());

    let resp = client
        .delete(format!("http://{}/api/rooms/{}/members/bob", addr, room_id))
        .bearer_auth(token_for(&state, "alice"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);
    assert!(!state.membership.is_member(&room_id, "bob").await.unwrap());
}

#[tokio::test]
async fn health_reports_online_users() {
    let (state, addr, _env) = setup().await;
    let (_write, mut read) = open_ws(addr, &token_for(&state, "alice")).await;
    next_event(&mut read, "connected").await;

    let body: Value = reqwest::get(format!("http://{}/api/health", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["online_users"], 1);
}
