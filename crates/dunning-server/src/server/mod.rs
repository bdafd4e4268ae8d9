use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::Router;
use dunning_channel::ConnectionLifecycleManager;
use dunning_core::{EventBus, PersistenceGateway};
use dunning_reminders::ReminderDispatcher;
use tokio_util::sync::CancellationToken;
use tower_http::{
    compression::CompressionLayer,
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

use crate::db::Database;

mod routes;

/// Server application state
pub struct AppState {
    pub db: Database,
    pub gateway: Arc<dyn PersistenceGateway>,
    pub manager: Arc<ConnectionLifecycleManager>,
    pub events: Arc<dyn EventBus>,
    pub dispatcher: Arc<ReminderDispatcher>,
    /// Upper bound on how long a connect request waits for its outcome.
    pub connect_wait: Duration,
}

/// Serve until `shutdown` is cancelled, then drain in-flight requests.
pub async fn start(state: Arc<AppState>, addr: SocketAddr, shutdown: CancellationToken) -> Result<()> {
    let app = create_router(state);

    info!("Starting Axum HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("HTTP server stopped");
    Ok(())
}

/// Create the Axum router with all routes and middleware
fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(routes::health::router())
        .merge(routes::connections::router())
        .merge(routes::reminders::router())
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
}

#[cfg(test)]
pub(crate) mod test_app {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use axum::Router;
    use dunning_channel::{ConnectionLifecycleManager, InMemoryCredentialStore, SessionRegistry};
    use dunning_core::BroadcastEventBus;
    use dunning_reminders::{MessageRenderer, ReminderDispatcher};
    use dunning_test_support::FakeConnector;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::{create_router, AppState};
    use crate::db::{Database, LibSqlGateway, MigrationRunner};

    /// Full router over an in-memory database and a scripted network.
    pub struct TestApp {
        pub db: Database,
        pub connector: Arc<FakeConnector>,
        pub registry: Arc<SessionRegistry>,
        pub state: Arc<AppState>,
    }

    impl TestApp {
        pub async fn new() -> Self {
            Self::with_connect_wait(Duration::from_secs(5)).await
        }

        pub async fn with_connect_wait(connect_wait: Duration) -> Self {
            let db = Database::in_memory("test").await.unwrap();
            MigrationRunner::default().run(&db).await.unwrap();

            let gateway = Arc::new(LibSqlGateway::new(db.clone()));
            let connector = Arc::new(FakeConnector::new());
            let registry = Arc::new(SessionRegistry::new());
            let events = Arc::new(BroadcastEventBus::default());
            let manager = Arc::new(ConnectionLifecycleManager::new(
                connector.clone(),
                Arc::new(InMemoryCredentialStore::new()),
                gateway.clone(),
                Arc::clone(&registry),
                events.clone(),
            ));
            let dispatcher = Arc::new(ReminderDispatcher::new(
                gateway.clone(),
                Arc::clone(&registry),
                MessageRenderer::new("R$", "Olá, {nome}!"),
            ));

            let state = Arc::new(AppState {
                db: db.clone(),
                gateway,
                manager,
                events,
                dispatcher,
                connect_wait,
            });

            Self {
                db,
                connector,
                registry,
                state,
            }
        }

        pub fn router(&self) -> Router {
            create_router(Arc::clone(&self.state))
        }

        pub async fn seed(&self, sql: &str) {
            self.db.connection().await.execute_batch(sql).await.unwrap();
        }

        /// Send one request and return the status plus the parsed JSON body
        /// (`Null` for an empty body).
        pub async fn call(
            &self,
            method: Method,
            uri: &str,
            body: Option<serde_json::Value>,
        ) -> (StatusCode, serde_json::Value) {
            let mut request = Request::builder().method(method).uri(uri);
            let body = match body {
                Some(json) => {
                    request = request.header("content-type", "application/json");
                    Body::from(serde_json::to_vec(&json).unwrap())
                }
                None => Body::empty(),
            };

            let response = self
                .router()
                .oneshot(request.body(body).unwrap())
                .await
                .unwrap();
            let status = response.status();
            let bytes = response.into_body().collect().await.unwrap().to_bytes();
            let json = if bytes.is_empty() {
                serde_json::Value::Null
            } else {
                serde_json::from_slice(&bytes).unwrap()
            };
            (status, json)
        }
    }
}
