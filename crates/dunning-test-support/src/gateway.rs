use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use dunning_core::{
    Client, Connection, DueClient, DueWindow, GatewayError, PersistenceGateway,
};

#[derive(Default)]
struct State {
    connections: HashMap<String, Connection>,
    clients: HashMap<String, Client>,
}

/// Map-backed [`PersistenceGateway`] with outage and failure switches.
#[derive(Default)]
pub struct InMemoryGateway {
    state: Mutex<State>,
    unavailable: AtomicBool,
    failing_markers: Mutex<Vec<String>>,
    failing_disconnects: AtomicBool,
    mark_disconnected_calls: AtomicUsize,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(&self) -> Result<(), GatewayError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(GatewayError::Unavailable("gateway switched off".to_string()))
        } else {
            Ok(())
        }
    }

    pub fn insert_connection(&self, connection: Connection) {
        self.state()
            .connections
            .insert(connection.id.clone(), connection);
    }

    pub fn insert_client(&self, client: Client) {
        self.state().clients.insert(client.id.clone(), client);
    }

    pub fn connection(&self, id: &str) -> Option<Connection> {
        self.state().connections.get(id).cloned()
    }

    pub fn client(&self, id: &str) -> Option<Client> {
        self.state().clients.get(id).cloned()
    }

    /// Make every call fail with [`GatewayError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make `set_last_reminder_due_at` fail for `client_id`.
    pub fn fail_marker_for(&self, client_id: &str) {
        self.failing_markers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(client_id.to_string());
    }

    /// Make `mark_disconnected` fail while reads keep working.
    pub fn fail_disconnects(&self, failing: bool) {
        self.failing_disconnects.store(failing, Ordering::SeqCst);
    }

    pub fn mark_disconnected_calls(&self) -> usize {
        self.mark_disconnected_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PersistenceGateway for InMemoryGateway {
    async fn create_or_get_connection(
        &self,
        tenant_id: &str,
        phone_number: &str,
    ) -> Result<Connection, GatewayError> {
        self.check_available()?;
        let mut state = self.state();
        if let Some(existing) = state
            .connections
            .values()
            .find(|connection| connection.user_id == tenant_id)
        {
            return Ok(existing.clone());
        }

        let connection = Connection {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: tenant_id.to_string(),
            phone_number: phone_number.to_string(),
            is_connected: false,
            last_connected_at: None,
        };
        state
            .connections
            .insert(connection.id.clone(), connection.clone());
        Ok(connection)
    }

    async fn mark_connected(&self, id: &str) -> Result<(), GatewayError> {
        self.check_available()?;
        let mut state = self.state();
        let connection = state
            .connections
            .get_mut(id)
            .ok_or_else(|| GatewayError::NotFound(id.to_string()))?;
        connection.is_connected = true;
        connection.last_connected_at = Some(Utc::now());
        Ok(())
    }

    async fn mark_disconnected(&self, id: &str) -> Result<(), GatewayError> {
        self.check_available()?;
        self.mark_disconnected_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_disconnects.load(Ordering::SeqCst) {
            return Err(GatewayError::QueryFailed("disconnect write failed".to_string()));
        }
        let mut state = self.state();
        let connection = state
            .connections
            .get_mut(id)
            .ok_or_else(|| GatewayError::NotFound(id.to_string()))?;
        connection.is_connected = false;
        Ok(())
    }

    async fn find_connection(&self, id: &str) -> Result<Option<Connection>, GatewayError> {
        self.check_available()?;
        Ok(self.connection(id))
    }

    async fn find_clients_due(&self, window: DueWindow) -> Result<Vec<DueClient>, GatewayError> {
        self.check_available()?;
        let state = self.state();
        let mut due: Vec<DueClient> = state
            .clients
            .values()
            .filter(|client| client.due_at.is_some_and(|due_at| window.contains(due_at)))
            .filter_map(|client| {
                state
                    .connections
                    .values()
                    .find(|connection| connection.user_id == client.user_id && connection.is_connected)
                    .map(|connection| DueClient {
                        session_id: connection.id.clone(),
                        client: client.clone(),
                    })
            })
            .collect();
        due.sort_by(|a, b| (a.client.due_at, &a.client.id).cmp(&(b.client.due_at, &b.client.id)));
        Ok(due)
    }

    async fn set_last_reminder_due_at(
        &self,
        client_id: &str,
        due_at: NaiveDate,
    ) -> Result<(), GatewayError> {
        self.check_available()?;
        if self
            .failing_markers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|id| id == client_id)
        {
            return Err(GatewayError::QueryFailed(format!(
                "marker write rejected for {client_id}"
            )));
        }

        let mut state = self.state();
        let client = state
            .clients
            .get_mut(client_id)
            .ok_or_else(|| GatewayError::NotFound(client_id.to_string()))?;
        client.last_reminder_due_at = Some(due_at);
        Ok(())
    }
}
