use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;
use tracing::warn;

use crate::server::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(health_handler))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub database: &'static str,
    /// Sessions with a live handle right now.
    pub sessions: usize,
}

/// Database health plus the live session count (for load balancers)
async fn health_handler(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    let healthy = state.db.health_check().await;
    if !healthy {
        warn!("Health check: database unhealthy");
    }

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthResponse {
            status: if healthy { "healthy" } else { "unhealthy" },
            service: "dunning-server",
            version: env!("CARGO_PKG_VERSION"),
            database: if healthy { "healthy" } else { "unhealthy" },
            sessions: state.manager.registry().len(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};

    use crate::server::test_app::TestApp;

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = TestApp::new().await;

        let (status, json) = app.call(Method::GET, "/health", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["service"], "dunning-server");
        assert_eq!(json["database"], "healthy");
        assert_eq!(json["sessions"], 0);
    }
}
