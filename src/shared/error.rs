use axum::response::IntoResponse;
use axum::Json;

/// Failures raised by the ticket and notification engine.
///
/// Anything in the notification path is logged and swallowed before it can
/// reach the ticket mutation that triggered it; only the ticket-side variants
/// surface to HTTP callers.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Invalid status: {0}")]
    InvalidStatus(String),
    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("Ticket not found: {0}")]
    TicketNotFound(uuid::Uuid),
    #[error("Notification not found: {0}")]
    NotificationNotFound(uuid::Uuid),
    #[error("Database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("Connection pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),
    #[error("Relay error: {0}")]
    Relay(String),
}

impl IntoResponse for EngineError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;
        let status = match &self {
            Self::InvalidStatus(_) | Self::InvalidTransition { .. } => StatusCode::BAD_REQUEST,
            Self::TicketNotFound(_) | Self::NotificationNotFound(_) => StatusCode::NOT_FOUND,
            Self::Database(_) | Self::Pool(_) | Self::Relay(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let message = self.to_string();
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
