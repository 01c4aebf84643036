//! Shared fixtures for integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use huddle_server::config::Config;
use huddle_server::db::models::{Message, PushSubscription};
use huddle_server::db::{self, run_blocking};
use huddle_server::push::{DeliveryOutcome, PushPayload, PushTransport};
use huddle_server::state::AppState;
use huddle_server::ws::protocol::ServerEvent;
use huddle_server::ws::{ConnectionId, Outbound};

/// Push transport double: records every delivery and answers with a
/// scripted outcome per endpoint (default: delivered). An optional delay
/// simulates a slow push service.
#[derive(Default)]
pub struct RecordingTransport {
    outcomes: DashMap<String, DeliveryOutcome>,
    deliveries: Mutex<Vec<(String, PushPayload)>>,
    delay: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl RecordingTransport {
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Highest number of deliveries that were running at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn script(&self, endpoint: &str, outcome: DeliveryOutcome) {
        self.outcomes.insert(endpoint.to_string(), outcome);
    }

    pub fn deliveries(&self) -> Vec<(String, PushPayload)> {
        self.deliveries.lock().unwrap().clone()
    }

    pub fn endpoints_for_message(&self, message_id: &str) -> Vec<String> {
        let mut endpoints: Vec<String> = self
            .deliveries()
            .into_iter()
            .filter(|(_, p)| p.message_id == message_id)
            .map(|(e, _)| e)
            .collect();
        endpoints.sort();
        endpoints
    }
}

#[async_trait]
impl PushTransport for RecordingTransport {
    async fn deliver(&self, subscription: &PushSubscription, payload: &PushPayload) -> DeliveryOutcome {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.deliveries
            .lock()
            .unwrap()
            .push((subscription.endpoint.clone(), payload.clone()));
        self.outcomes
            .get(&subscription.endpoint)
            .map(|o| o.value().clone())
            .unwrap_or(DeliveryOutcome::Delivered)
    }
}

pub struct TestEnv {
    pub state: AppState,
    pub transport: Arc<RecordingTransport>,
    _dir: tempfile::TempDir,
}

pub fn test_env() -> TestEnv {
    test_env_with(Config::default())
}

pub fn test_env_with(config: Config) -> TestEnv {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let data_dir = dir.path().to_str().unwrap().to_string();
    let db = db::init_db(&data_dir).expect("Failed to init DB");
    let jwt_secret = huddle_server::auth::jwt::load_or_generate_jwt_secret(&data_dir)
        .expect("Failed to generate JWT secret");
    let transport = Arc::new(RecordingTransport::default());
    let state = AppState::new(db, jwt_secret, &config, transport.clone());
    TestEnv {
        state,
        transport,
        _dir: dir,
    }
}

/// Create a room and add `members` to it.
pub async fn seed_room(state: &AppState, room_id: &str, members: &[&str]) {
    state.membership.create_room(room_id, room_id).await.unwrap();
    for member in members {
        state.membership.add_member(room_id, member).await.unwrap();
    }
}

pub async fn set_display_name(state: &AppState, user_id: &str, name: &str) {
    let (uid, name) = (user_id.to_string(), name.to_string());
    run_blocking(&state.db, move |conn| {
        conn.execute(
            "UPDATE users SET display_name = ?2 WHERE id = ?1",
            rusqlite::params![uid, name],
        )?;
        Ok(())
    })
    .await
    .unwrap();
}

pub async fn subscribe(state: &AppState, user_id: &str, endpoint: &str) -> PushSubscription {
    let (uid, endpoint) = (user_id.to_string(), endpoint.to_string());
    run_blocking(&state.db, move |conn| {
        db::presence::ensure_user(conn, &uid, &uid)?;
        db::subscriptions::upsert_subscription(conn, &uid, &endpoint, None, None)
    })
    .await
    .unwrap()
}

pub async fn subscriptions_of(state: &AppState, user_id: &str) -> Vec<PushSubscription> {
    let uid = user_id.to_string();
    run_blocking(&state.db, move |conn| db::subscriptions::list_for_user(conn, &uid))
        .await
        .unwrap()
}

pub async fn insert_message(state: &AppState, room_id: &str, sender_id: &str, content: &str) -> Message {
    let (rid, sid, body) = (room_id.to_string(), sender_id.to_string(), content.to_string());
    run_blocking(&state.db, move |conn| {
        db::messages::insert_message(conn, &rid, &sid, &body, None)
    })
    .await
    .unwrap()
}

/// A registered in-process client: its connection id and outbound queue.
pub struct Client {
    pub connection_id: ConnectionId,
    pub rx: mpsc::UnboundedReceiver<Outbound>,
}

impl Client {
    /// Every event queued so far.
    pub fn drain(&mut self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(outbound) = self.rx.try_recv() {
            if let Outbound::Event(event) = outbound {
                events.push((*event).clone());
            }
        }
        events
    }

    pub fn room_messages(&mut self) -> Vec<Message> {
        self.drain()
            .into_iter()
            .filter_map(|e| match e {
                ServerEvent::RoomMessage { message, .. } => Some(message),
                _ => None,
            })
            .collect()
    }
}

pub async fn connect(state: &AppState, user_id: &str) -> Client {
    let (tx, rx) = mpsc::unbounded_channel();
    let registration = state.presence.connect(user_id, tx).await;
    Client {
        connection_id: registration.connection_id,
        rx,
    }
}

pub async fn connect_in(state: &AppState, user_id: &str, room_id: &str) -> Client {
    let mut client = connect(state, user_id).await;
    state
        .registry
        .join_room(client.connection_id, room_id, state.membership.as_ref())
        .await
        .unwrap();
    client.drain();
    client
}

/// Serve the router on an ephemeral port.
pub async fn start_server(state: AppState) -> SocketAddr {
    let app = huddle_server::routes::build_router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    addr
}

pub fn token_for(state: &AppState, user_id: &str) -> String {
    huddle_server::auth::jwt::issue_access_token(&state.jwt_secret, user_id, 900).unwrap()
}
