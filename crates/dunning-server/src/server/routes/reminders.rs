//! POST /v1/reminders/dispatch - run the reminder dispatcher once, now.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use dunning_reminders::{DispatchReport, ReminderError};
use tracing::{error, instrument};

use super::{api_error, channel_error, gateway_error, ApiError};
use crate::server::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/v1/reminders/dispatch", post(dispatch_handler))
}

#[instrument(skip(state))]
async fn dispatch_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<DispatchReport>, ApiError> {
    match state.dispatcher.run_now().await {
        Ok(report) => Ok(Json(report)),
        Err(e) => {
            error!(error = %e, "Manual reminder dispatch failed");
            Err(match &e {
                ReminderError::Gateway(inner) => gateway_error(inner),
                ReminderError::Channel(inner) => channel_error(inner),
                ReminderError::MissingDueDate(_) | ReminderError::InvalidSchedule(_) => {
                    api_error(StatusCode::INTERNAL_SERVER_ERROR, "dispatch_failed", e.to_string())
                }
            })
        }
    }
}
