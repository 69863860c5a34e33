//! Shared HTTP error type and the informational endpoints.

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use thiserror::Error;

/// Name reported by the informational endpoints.
pub const SERVICE_NAME: &str = "Exotel Voice AI Bot";

/// API error type mapping to HTTP status codes.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid input: {0}")]
    BadRequest(String),
    #[error("internal server error: {0}")]
    InternalServerError(String),
    /// The request body could not be read as the expected JSON.
    #[error("invalid request body: {message}")]
    InvalidBody { status: StatusCode, message: String },
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::InvalidBody {
            status: rejection.status(),
            message: rejection.body_text(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            ApiError::InvalidBody { status, message } => (status, message),
        };

        let body = Json(json!({
            "detail": message
        }));

        (status, body).into_response()
    }
}

/// Handler for `GET /health`.
pub async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "outbound_type": "existing_call_flow",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Service description returned by `GET /` when no websocket upgrade is
/// requested.
pub fn service_info() -> Value {
    json!({
        "service": format!("{} - Simple Outbound", SERVICE_NAME),
        "approach": "Outbound calls reuse the existing Exotel call flow",
        "how_it_works": [
            "1. POST /outbound/call with the customer's number",
            "2. Exotel calls the customer",
            "3. The answered call is connected to the existing voice app",
            "4. The voice app streams the call to this server over a websocket"
        ],
        "endpoints": {
            "media_stream": "GET / (websocket) or GET /ws",
            "outbound_call": "POST /outbound/call",
            "active_calls": "GET /calls",
            "health": "GET /health"
        },
        "example": {
            "url": "POST /outbound/call",
            "payload": {
                "customer_number": "+91XXXXXXXXXX",
                "custom_field": "customer_support"
            }
        }
    })
}
