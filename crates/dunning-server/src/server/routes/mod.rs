// Route modules for the Dunning server API
pub mod connections; // Connect, status, status stream, disconnect
pub mod health;
pub mod reminders; // Manual dispatch

use axum::http::StatusCode;
use axum::Json;
use dunning_channel::ChannelError;
use dunning_core::GatewayError;
use serde::Serialize;

/// Error body shared by every route.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);

pub fn api_error(status: StatusCode, error: &str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            message: message.into(),
        }),
    )
}

pub fn gateway_error(err: &GatewayError) -> ApiError {
    match err {
        GatewayError::NotFound(_) => api_error(StatusCode::NOT_FOUND, "not_found", err.to_string()),
        GatewayError::Unavailable(_) => {
            api_error(StatusCode::SERVICE_UNAVAILABLE, "storage_unavailable", err.to_string())
        }
        GatewayError::QueryFailed(_) | GatewayError::Malformed(_) => {
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", err.to_string())
        }
    }
}

pub fn channel_error(err: &ChannelError) -> ApiError {
    match err {
        ChannelError::Gateway(inner) => gateway_error(inner),
        ChannelError::InvalidSessionId(_) => {
            api_error(StatusCode::BAD_REQUEST, "invalid_session_id", err.to_string())
        }
        ChannelError::InvalidDestination(_) => {
            api_error(StatusCode::BAD_REQUEST, "invalid_destination", err.to_string())
        }
        ChannelError::SessionTerminated(_) => {
            api_error(StatusCode::CONFLICT, "session_terminated", err.to_string())
        }
        ChannelError::NotConnected(_) => {
            api_error(StatusCode::CONFLICT, "not_connected", err.to_string())
        }
        ChannelError::Timeout => api_error(StatusCode::GATEWAY_TIMEOUT, "timeout", err.to_string()),
        ChannelError::Transport(_) => {
            api_error(StatusCode::BAD_GATEWAY, "transport_error", err.to_string())
        }
        ChannelError::Credentials(_) | ChannelError::Pairing(_) => {
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", err.to_string())
        }
    }
}
