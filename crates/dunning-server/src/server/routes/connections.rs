//! Connection API Routes
//!
//! - POST /v1/connections - Create-or-get the tenant's connection and start it
//! - GET /v1/connections/:id - Reconciled connection record
//! - GET /v1/connections/:id/events - Server-sent status stream
//! - DELETE /v1/connections/:id - Disconnect the session

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use dunning_channel::{ConnectOutcome, Destination};
use dunning_core::{Connection, StatusEvent};
use futures::{future, stream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::{api_error, channel_error, gateway_error, ApiError};
use crate::server::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/connections", post(connect_handler))
        .route(
            "/v1/connections/:id",
            get(status_handler).delete(disconnect_handler),
        )
        .route("/v1/connections/:id/events", get(events_handler))
}

// === Request/Response Types ===

#[derive(Debug, Deserialize)]
pub struct ConnectRequest {
    pub user_id: String,
    pub phone_number: String,
}

/// Body of a connect answer. Exactly one of the `status`/`qr` pair or the
/// `is_connected`/`sessionId` pair is present.
#[derive(Debug, Serialize)]
pub struct ConnectResponse {
    pub connection: Connection,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_connected: Option<bool>,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl ConnectResponse {
    fn pairing(connection: Connection, qr: String) -> Self {
        Self {
            connection,
            status: Some("qr"),
            qr: Some(qr),
            is_connected: None,
            session_id: None,
        }
    }

    fn ready(connection: Connection, session_id: String) -> Self {
        Self {
            connection,
            status: None,
            qr: None,
            is_connected: Some(true),
            session_id: Some(session_id),
        }
    }

    fn pending(connection: Connection) -> Self {
        Self {
            connection,
            status: Some("pending"),
            qr: None,
            is_connected: None,
            session_id: None,
        }
    }
}

// === Handlers ===

#[instrument(skip(state))]
async fn connect_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ConnectRequest>,
) -> Result<(StatusCode, Json<ConnectResponse>), ApiError> {
    let user_id = request.user_id.trim();
    if user_id.is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "user_id must not be empty",
        ));
    }
    let phone = Destination::from_phone(&request.phone_number).map_err(|e| channel_error(&e))?;

    let connection = state
        .gateway
        .create_or_get_connection(user_id, phone.digits())
        .await
        .map_err(|e| gateway_error(&e))?;

    let waiter = state
        .manager
        .start(&connection.id)
        .await
        .map_err(|e| channel_error(&e))?;

    match waiter
        .wait_timeout(state.connect_wait)
        .await
        .map_err(|e| channel_error(&e))?
    {
        Some(ConnectOutcome::Pairing { qr }) => {
            debug!(session_id = %connection.id, "Pairing code issued");
            let connection = state.manager.reconcile(connection);
            Ok((StatusCode::OK, Json(ConnectResponse::pairing(connection, qr))))
        }
        Some(ConnectOutcome::Ready { session_id }) => {
            info!(session_id = %session_id, "Connection ready");
            let connection = match state.gateway.find_connection(&connection.id).await {
                Ok(Some(fresh)) => fresh,
                Ok(None) => connection,
                Err(e) => {
                    warn!(error = %e, "Failed to reload connection after open");
                    connection
                }
            };
            let connection = state.manager.reconcile(connection);
            Ok((
                StatusCode::OK,
                Json(ConnectResponse::ready(connection, session_id)),
            ))
        }
        None => {
            debug!(session_id = %connection.id, "Connect still pending, retries continue in background");
            let connection = state.manager.reconcile(connection);
            Ok((StatusCode::ACCEPTED, Json(ConnectResponse::pending(connection))))
        }
    }
}

#[instrument(skip(state))]
async fn status_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Connection>, ApiError> {
    match state.manager.status(&id).await.map_err(|e| channel_error(&e))? {
        Some(connection) => Ok(Json(connection)),
        None => Err(not_found(&id)),
    }
}

/// Stream status events for one session: the reconciled snapshot first,
/// then live updates until the session is torn down or the client leaves.
#[instrument(skip(state))]
async fn events_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let connection = state
        .manager
        .status(&id)
        .await
        .map_err(|e| channel_error(&e))?
        .ok_or_else(|| not_found(&id))?;

    let subscription = state
        .events
        .subscribe(&connection.id)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, "invalid_session_id", e.to_string()))?;

    let snapshot = if connection.is_connected {
        StatusEvent::connected(connection.id.as_str())
    } else {
        StatusEvent::disconnected()
    };

    // Forward the teardown event itself, then stop.
    let live = subscription
        .into_stream()
        .scan(false, |ended, event| {
            if *ended {
                return future::ready(None);
            }
            *ended = !event.is_connected && !event.is_pairing();
            future::ready(Some(event))
        });

    let events = stream::once(future::ready(snapshot))
        .chain(live)
        .map(|event| Event::default().json_data(event));

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

#[instrument(skip(state))]
async fn disconnect_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .manager
        .disconnect(&id)
        .await
        .map_err(|e| channel_error(&e))?;
    Ok(StatusCode::NO_CONTENT)
}

fn not_found(id: &str) -> ApiError {
    api_error(
        StatusCode::NOT_FOUND,
        "not_found",
        format!("Connection {id} not found"),
    )
}
