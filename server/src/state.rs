use std::sync::Arc;
use std::time::Duration;

use crate::chat::fanout::FanoutPipeline;
use crate::chat::membership::MembershipRouter;
use crate::chat::presence::PresenceTracker;
use crate::chat::unread::UnreadLedger;
use crate::config::Config;
use crate::db::DbPool;
use crate::push::{NotificationDispatcher, PushTransport};
use crate::ws::ConnectionRegistry;

/// WebSocket keepalive timings.
#[derive(Debug, Clone, Copy)]
pub struct WsTimings {
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
}

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// SQLite connection wrapped in Arc<Mutex>
    pub db: DbPool,
    /// JWT signing secret (256-bit random key)
    pub jwt_secret: Vec<u8>,
    /// Live connections per user and the rooms each one listens to
    pub registry: Arc<ConnectionRegistry>,
    pub presence: Arc<PresenceTracker>,
    pub membership: Arc<MembershipRouter>,
    pub ledger: Arc<UnreadLedger>,
    pub fanout: Arc<FanoutPipeline>,
    pub dispatcher: Arc<NotificationDispatcher>,
    pub ws: WsTimings,
}

impl AppState {
    /// Wire every component onto one registry and database.
    pub fn new(
        db: DbPool,
        jwt_secret: Vec<u8>,
        config: &Config,
        transport: Arc<dyn PushTransport>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let presence = Arc::new(PresenceTracker::new(
            db.clone(),
            registry.clone(),
            &config.presence(),
        ));
        let membership = Arc::new(MembershipRouter::new(db.clone(), registry.clone()));
        let ledger = Arc::new(UnreadLedger::new(
            db.clone(),
            registry.clone(),
            membership.clone(),
        ));
        let dispatcher = Arc::new(NotificationDispatcher::new(
            db.clone(),
            transport,
            &config.push(),
        ));
        let fanout = Arc::new(FanoutPipeline::new(
            db.clone(),
            registry.clone(),
            ledger.clone(),
            dispatcher.clone(),
            &config.fanout(),
        ));
        let ws_config = config.ws();

        Self {
            db,
            jwt_secret,
            registry,
            presence,
            membership,
            ledger,
            fanout,
            dispatcher,
            ws: WsTimings {
                ping_interval: ws_config.ping_interval(),
                pong_timeout: ws_config.pong_timeout(),
            },
        }
    }
}
