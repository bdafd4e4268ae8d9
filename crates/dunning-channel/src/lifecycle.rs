//! Per-session connection state machine.
//!
//! `Idle -> Connecting -> Pairing -> Open`, with any non-logout close moving
//! to `Reconnecting` and a logout ending in `LoggedOut`. Every transition for
//! a session id runs under that id's lock; different ids never contend.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dunning_core::{Connection, EventBus, GatewayError, PersistenceGateway, StatusEvent};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::completion::{connect_slot, ConnectOutcome, ConnectResolver, ConnectWaiter};
use crate::credentials::{validate_session_id, CredentialStore, Credentials};
use crate::error::ChannelError;
use crate::pairing::qr_data_url;
use crate::registry::{SessionHandle, SessionRegistry};
use crate::transport::{ChatConnector, ChatSocket, DisconnectReason, SocketEvent, SocketEvents};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Pairing,
    Open,
    Reconnecting { attempt: u32 },
    LoggedOut,
}

/// The socket currently being driven for a session.
struct Attempt {
    generation: u64,
    cancel: CancellationToken,
    socket: Arc<dyn ChatSocket>,
}

pub struct ConnectionLifecycleManager {
    connector: Arc<dyn ChatConnector>,
    credentials: Arc<dyn CredentialStore>,
    gateway: Arc<dyn PersistenceGateway>,
    registry: Arc<SessionRegistry>,
    events: Arc<dyn EventBus>,
    reconnect_delay: Duration,
    locks: DashMap<String, Arc<Mutex<()>>>,
    attempts: DashMap<String, Attempt>,
    retries: DashMap<String, CancellationToken>,
    states: DashMap<String, SessionState>,
    generation: AtomicU64,
    /// Parent of every attempt and retry token; cancelled by `shutdown`.
    closing: CancellationToken,
}

impl ConnectionLifecycleManager {
    pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

    pub fn new(
        connector: Arc<dyn ChatConnector>,
        credentials: Arc<dyn CredentialStore>,
        gateway: Arc<dyn PersistenceGateway>,
        registry: Arc<SessionRegistry>,
        events: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            connector,
            credentials,
            gateway,
            registry,
            events,
            reconnect_delay: Self::DEFAULT_RECONNECT_DELAY,
            locks: DashMap::new(),
            attempts: DashMap::new(),
            retries: DashMap::new(),
            states: DashMap::new(),
            generation: AtomicU64::new(0),
            closing: CancellationToken::new(),
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn state(&self, session_id: &str) -> SessionState {
        self.states
            .get(session_id)
            .map(|state| *state)
            .unwrap_or(SessionState::Idle)
    }

    pub fn has_pending_reconnect(&self, session_id: &str) -> bool {
        self.retries.contains_key(session_id)
    }

    /// Start (or resume) the session and return a waiter for its single
    /// connect outcome. An already open session resolves `Ready` at once.
    #[instrument(skip(self))]
    pub async fn start(self: &Arc<Self>, session_id: &str) -> Result<ConnectWaiter, ChannelError> {
        validate_session_id(session_id)?;
        let (resolver, waiter) = connect_slot(session_id);

        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        self.cancel_retry(session_id);

        if self.registry.contains(session_id) {
            debug!("Session already open");
            resolver.resolve(ConnectOutcome::Ready {
                session_id: session_id.to_string(),
            });
            return Ok(waiter);
        }

        if let Some((_, previous)) = self.attempts.remove(session_id) {
            debug!("Replacing in-flight connect attempt");
            previous.cancel.cancel();
            if let Err(e) = previous.socket.close().await {
                warn!(error = %e, "Failed to close replaced socket");
            }
        }

        self.open_attempt(session_id, resolver, 0).await;
        Ok(waiter)
    }

    /// Caller-initiated teardown. Idempotent.
    #[instrument(skip(self))]
    pub async fn disconnect(&self, session_id: &str) -> Result<(), ChannelError> {
        validate_session_id(session_id)?;
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        self.cancel_retry(session_id);
        let attempt = self.attempts.remove(session_id).map(|(_, attempt)| attempt);
        if let Some(attempt) = &attempt {
            attempt.cancel.cancel();
        }

        let persisted = match self.gateway.mark_disconnected(session_id).await {
            Err(GatewayError::NotFound(_)) => Ok(()),
            other => other,
        };

        let handle = self.registry.delete(session_id);
        if let Some(handle) = &handle {
            if let Err(e) = handle.close().await {
                warn!(error = %e, "Failed to close session socket");
            }
        }
        if let Some(attempt) = attempt {
            let already_closed = handle
                .as_ref()
                .is_some_and(|handle| handle.uses_socket(&attempt.socket));
            if !already_closed {
                if let Err(e) = attempt.socket.close().await {
                    warn!(error = %e, "Failed to close connecting socket");
                }
            }
        }

        self.states.remove(session_id);
        self.publish(session_id, StatusEvent::disconnected());
        info!("Session disconnected");

        persisted.map_err(ChannelError::from)
    }

    /// Read the connection record with `is_connected` taken from the
    /// registry: it is true only while a live handle is registered.
    ///
    /// A record that claims to be connected while no live handle, connect
    /// attempt or pending retry exists is a leftover from a previous process.
    /// It is marked disconnected, its credentials are purged and one
    /// `{is_connected:false}` event is published.
    #[instrument(skip(self))]
    pub async fn status(&self, session_id: &str) -> Result<Option<Connection>, ChannelError> {
        let Some(record) = self.gateway.find_connection(session_id).await? else {
            return Ok(None);
        };
        if !self.is_ghost(&record) {
            return Ok(Some(self.reconcile(record)));
        }

        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        let Some(mut record) = self.gateway.find_connection(session_id).await? else {
            return Ok(None);
        };
        if !self.is_ghost(&record) {
            return Ok(Some(self.reconcile(record)));
        }

        info!("Reconciling ghost connection");
        if let Err(e) = self.gateway.mark_disconnected(session_id).await {
            warn!(error = %e, "Failed to persist ghost reconciliation");
        }
        if let Err(e) = self.credentials.delete(session_id).await {
            warn!(error = %e, "Failed to delete stale credentials");
        }
        self.publish(session_id, StatusEvent::disconnected());

        record.is_connected = false;
        Ok(Some(record))
    }

    /// Cancel every timer and close every socket, leaving durable state as
    /// is so sessions resume on the next start. No attempt is opened and no
    /// handle is registered once this has begun.
    pub async fn shutdown(&self) {
        self.closing.cancel();

        let session_ids: Vec<String> = self.locks.iter().map(|e| e.key().clone()).collect();
        for session_id in session_ids {
            let lock = self.lock_for(&session_id);
            let _guard = lock.lock().await;

            self.cancel_retry(&session_id);
            if let Some((_, attempt)) = self.attempts.remove(&session_id) {
                attempt.cancel.cancel();
                if let Err(e) = attempt.socket.close().await {
                    warn!(session_id = %session_id, error = %e, "Failed to close socket on shutdown");
                }
            }
        }

        let drained = self.registry.drain();
        for handle in &drained {
            if let Err(e) = handle.close().await {
                warn!(session_id = %handle.session_id(), error = %e, "Failed to close session on shutdown");
            }
        }
        self.states.clear();
        info!(sessions = drained.len(), "Channel shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.closing.is_cancelled()
    }

    /// Overwrite `is_connected` with whether a live handle is registered.
    pub fn reconcile(&self, mut record: Connection) -> Connection {
        record.is_connected = self.registry.contains(&record.id);
        record
    }

    fn is_ghost(&self, record: &Connection) -> bool {
        record.is_connected
            && !self.registry.contains(&record.id)
            && !self.attempts.contains_key(&record.id)
            && !self.retries.contains_key(&record.id)
    }

    fn lock_for(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(session_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    fn set_state(&self, session_id: &str, state: SessionState) {
        self.states.insert(session_id.to_string(), state);
    }

    fn cancel_retry(&self, session_id: &str) {
        if let Some((_, token)) = self.retries.remove(session_id) {
            debug!(session_id, "Cancelled pending reconnect");
            token.cancel();
        }
    }

    fn publish(&self, session_id: &str, event: StatusEvent) {
        match self.events.publish(session_id, event) {
            Ok(delivered) => debug!(session_id, delivered, "Status event published"),
            Err(e) => warn!(session_id, error = %e, "Failed to publish status event"),
        }
    }

    /// Load credentials, open a socket and hand it to a driver task.
    /// Must be called with the session lock held.
    async fn open_attempt(self: &Arc<Self>, session_id: &str, resolver: ConnectResolver, attempt: u32) {
        if self.closing.is_cancelled() {
            debug!(session_id, "Channel shut down, not connecting");
            return;
        }
        self.set_state(session_id, SessionState::Connecting);

        let credentials = match self.load_or_create_credentials(session_id).await {
            Ok(credentials) => credentials,
            Err(e) => {
                warn!(session_id, error = %e, "Could not load credentials");
                self.schedule_reconnect(session_id, resolver, attempt + 1);
                return;
            }
        };

        let (socket, events) = match self.connector.open(session_id, credentials).await {
            Ok(opened) => opened,
            Err(e) => {
                warn!(session_id, error = %e, retryable = e.is_retryable(), "Failed to open socket");
                self.schedule_reconnect(session_id, resolver, attempt + 1);
                return;
            }
        };

        if self.closing.is_cancelled() {
            if let Err(e) = socket.close().await {
                warn!(session_id, error = %e, "Failed to close socket opened during shutdown");
            }
            self.states.remove(session_id);
            return;
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = self.closing.child_token();
        self.attempts.insert(
            session_id.to_string(),
            Attempt {
                generation,
                cancel: cancel.clone(),
                socket: Arc::clone(&socket),
            },
        );
        debug!(session_id, generation, "Socket opened");

        let manager = Arc::clone(self);
        let driver = Driver {
            session_id: session_id.to_string(),
            generation,
            cancel,
            socket,
            resolver,
            attempt,
        };
        tokio::spawn(async move { manager.drive(driver, events).await });
    }

    async fn load_or_create_credentials(&self, session_id: &str) -> Result<Credentials, ChannelError> {
        if let Some(credentials) = self.credentials.load(session_id).await? {
            return Ok(credentials);
        }
        let fresh = Credentials::fresh();
        self.credentials.save(session_id, &fresh).await?;
        debug!(session_id, "Created fresh credentials");
        Ok(fresh)
    }

    async fn drive(self: Arc<Self>, mut driver: Driver, mut events: SocketEvents) {
        loop {
            let event = tokio::select! {
                _ = driver.cancel.cancelled() => {
                    debug!(session_id = %driver.session_id, "Connect attempt cancelled");
                    return;
                }
                event = events.recv() => event.unwrap_or(SocketEvent::Closed {
                    reason: DisconnectReason::ConnectionLost,
                }),
            };

            let lock = self.lock_for(&driver.session_id);
            let _guard = lock.lock().await;
            if driver.cancel.is_cancelled() {
                return;
            }

            match event {
                SocketEvent::Pairing { payload } => self.on_pairing(&driver, &payload),
                SocketEvent::CredentialsUpdated(credentials) => {
                    self.on_credentials(&driver, &credentials).await
                }
                SocketEvent::Open { phone } => {
                    self.on_open(&driver, phone).await;
                    driver.attempt = 0;
                }
                SocketEvent::Closed { reason } => {
                    self.on_close(driver, reason).await;
                    return;
                }
            }
        }
    }

    fn on_pairing(&self, driver: &Driver, payload: &str) {
        let qr = match qr_data_url(payload) {
            Ok(qr) => qr,
            Err(e) => {
                warn!(session_id = %driver.session_id, error = %e, "Dropping pairing challenge");
                return;
            }
        };

        info!(session_id = %driver.session_id, "Pairing code issued");
        self.set_state(&driver.session_id, SessionState::Pairing);
        self.publish(&driver.session_id, StatusEvent::pairing(qr.clone()));
        driver.resolver.resolve(ConnectOutcome::Pairing { qr });
    }

    async fn on_credentials(&self, driver: &Driver, credentials: &Credentials) {
        if let Err(e) = self.credentials.save(&driver.session_id, credentials).await {
            warn!(session_id = %driver.session_id, error = %e, "Failed to persist credentials");
        }
    }

    async fn on_open(&self, driver: &Driver, phone: Option<String>) {
        let session_id = driver.session_id.as_str();
        if let Err(e) = self.gateway.mark_connected(session_id).await {
            warn!(session_id, error = %e, "Failed to persist connected status");
        }
        self.registry.set(SessionHandle::new(
            session_id,
            Arc::clone(&driver.socket),
            phone,
        ));
        self.set_state(session_id, SessionState::Open);
        self.publish(session_id, StatusEvent::connected(session_id));
        driver.resolver.resolve(ConnectOutcome::Ready {
            session_id: session_id.to_string(),
        });
        info!(session_id, "Session open");
    }

    async fn on_close(self: &Arc<Self>, driver: Driver, reason: DisconnectReason) {
        let session_id = driver.session_id.as_str();
        self.attempts
            .remove_if(session_id, |_, attempt| attempt.generation == driver.generation);
        self.registry.delete_if_socket(session_id, &driver.socket);

        if !reason.is_logout() {
            info!(session_id, %reason, delay = ?self.reconnect_delay, "Session closed, scheduling reconnect");
            self.schedule_reconnect(session_id, driver.resolver, driver.attempt + 1);
            return;
        }

        info!(session_id, "Session logged out");
        if let Err(e) = self.gateway.mark_disconnected(session_id).await {
            warn!(session_id, error = %e, "Failed to persist logout");
        }
        self.publish(session_id, StatusEvent::disconnected());
        if let Err(e) = self.credentials.delete(session_id).await {
            warn!(session_id, error = %e, "Failed to purge credentials after logout");
        }
        self.set_state(session_id, SessionState::LoggedOut);
    }

    /// Arrange a new connect attempt after the reconnect delay. The retry is
    /// tracked per session so `disconnect` and `start` can cancel it.
    fn schedule_reconnect(self: &Arc<Self>, session_id: &str, resolver: ConnectResolver, attempt: u32) {
        let token = self.closing.child_token();
        if let Some(previous) = self.retries.insert(session_id.to_string(), token.clone()) {
            previous.cancel();
        }
        self.set_state(session_id, SessionState::Reconnecting { attempt });

        let manager = Arc::clone(self);
        let session_id = session_id.to_string();
        let delay = self.reconnect_delay;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let lock = manager.lock_for(&session_id);
            let _guard = lock.lock().await;
            if token.is_cancelled() {
                return;
            }
            // Any newer retry would have cancelled this token, so the entry is ours.
            manager.retries.remove(&session_id);

            debug!(session_id = %session_id, attempt, "Reconnecting");
            manager.open_attempt(&session_id, resolver, attempt).await;
        });
    }
}

struct Driver {
    session_id: String,
    generation: u64,
    cancel: CancellationToken,
    socket: Arc<dyn ChatSocket>,
    resolver: ConnectResolver,
    /// Consecutive failed attempts before this one; reset once open.
    attempt: u32,
}
