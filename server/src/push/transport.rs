use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::db::models::{Message, PushSubscription};

/// Notification body handed to the push channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushPayload {
    pub kind: String,
    pub title: String,
    pub body: String,
    pub room_id: String,
    pub message_id: String,
    pub sender_id: String,
}

impl PushPayload {
    pub fn new_message(message: &Message, sender_name: &str, room_name: &str, preview_chars: usize) -> Self {
        Self {
            kind: "new_message".to_string(),
            title: format!("New message from {}", sender_name),
            body: format!("{}: {}", room_name, preview(&message.content, preview_chars)),
            room_id: message.room_id.clone(),
            message_id: message.id.clone(),
            sender_id: message.sender_id.clone(),
        }
    }
}

/// First `max_chars` characters of `content`. Counts chars, not bytes, so
/// multi-byte text is never split mid-character.
pub fn preview(content: &str, max_chars: usize) -> String {
    content.chars().take(max_chars).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Worth retrying later; the subscription is kept.
    TransientFailure(String),
    /// The endpoint is gone; the subscription should be deleted.
    PermanentFailure(String),
}

/// A channel capable of delivering a payload to one subscription.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn deliver(&self, subscription: &PushSubscription, payload: &PushPayload) -> DeliveryOutcome;
}

/// How long the push service may hold an undelivered notification.
const PUSH_TTL_SECS: &str = "86400";

/// Posts the payload as JSON to the subscription endpoint.
pub struct HttpPushTransport {
    client: reqwest::Client,
}

impl HttpPushTransport {
    pub fn new(request_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self { client })
    }
}

/// 404 and 410 mean the endpoint no longer exists.
pub fn classify_status(status: StatusCode) -> DeliveryOutcome {
    if status.is_success() {
        DeliveryOutcome::Delivered
    } else if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
        DeliveryOutcome::PermanentFailure(format!("endpoint returned {}", status))
    } else {
        DeliveryOutcome::TransientFailure(format!("endpoint returned {}", status))
    }
}

#[async_trait]
impl PushTransport for HttpPushTransport {
    async fn deliver(&self, subscription: &PushSubscription, payload: &PushPayload) -> DeliveryOutcome {
        let request = self
            .client
            .post(&subscription.endpoint)
            .header("TTL", PUSH_TTL_SECS)
            .json(payload);
        match request.send().await {
            Ok(response) => classify_status(response.status()),
            Err(e) if e.is_builder() => {
                DeliveryOutcome::PermanentFailure(format!("invalid endpoint: {}", e))
            }
            Err(e) => DeliveryOutcome::TransientFailure(e.to_string()),
        }
    }
}
