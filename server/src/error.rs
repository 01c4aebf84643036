//! Error taxonomy shared by the registry, ledger, fanout and push layers.

use axum::http::StatusCode;

/// Errors surfaced by the realtime core.
///
/// Delivery failures are normally logged and swallowed at the fanout
/// boundary; `NotAMember` and `Persistence` are the two kinds callers
/// are expected to see.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("user {user_id} is not a member of room {room_id}")]
    NotAMember { room_id: String, user_id: String },

    #[error("transient delivery failure: {0}")]
    TransientDeliveryFailure(String),

    #[error("permanent delivery failure: {0}")]
    PermanentDeliveryFailure(String),

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl CoreError {
    pub fn not_a_member(room_id: &str, user_id: &str) -> Self {
        Self::NotAMember {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
        }
    }

    /// Stable code carried by the `error` WS event.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotAMember { .. } => "not_a_member",
            Self::TransientDeliveryFailure(_) => "transient_delivery_failure",
            Self::PermanentDeliveryFailure(_) => "permanent_delivery_failure",
            Self::Persistence(_) => "persistence_failure",
            Self::NotFound(_) => "not_found",
            Self::InvalidInput(_) => "invalid_input",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotAMember { .. } => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::TransientDeliveryFailure(_) | Self::PermanentDeliveryFailure(_) => {
                StatusCode::BAD_GATEWAY
            }
            Self::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

impl From<tokio::task::JoinError> for CoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Persistence(format!("blocking task failed: {}", err))
    }
}

impl axum::response::IntoResponse for CoreError {
    fn into_response(self) -> axum::response::Response {
        let body = axum::Json(serde_json::json!({
            "code": self.code(),
            "message": self.to_string(),
        }));
        (self.status_code(), body).into_response()
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_a_member_maps_to_forbidden() {
        let err = CoreError::not_a_member("room-1", "user-1");
        assert_eq!(err.code(), "not_a_member");
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);
        assert!(err.to_string().contains("room-1"));
    }

    #[test]
    fn sqlite_errors_become_persistence_failures() {
        let err: CoreError = rusqlite::Error::QueryReturnedNoRows.into();
        assert_eq!(err.code(), "persistence_failure");
    }
}
