use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::GatewayError;
use crate::model::{Connection, DueClient, DueWindow};

/// Durable storage consumed by the messaging channel and the reminder
/// dispatcher. The relational layer behind it belongs to the surrounding
/// application.
#[async_trait]
pub trait PersistenceGateway: Send + Sync + 'static {
    /// Return the tenant's connection, creating it on first use.
    async fn create_or_get_connection(
        &self,
        tenant_id: &str,
        phone_number: &str,
    ) -> Result<Connection, GatewayError>;

    /// Set `is_connected = true` and `last_connected_at = now`.
    async fn mark_connected(&self, id: &str) -> Result<(), GatewayError>;

    /// Set `is_connected = false`.
    async fn mark_disconnected(&self, id: &str) -> Result<(), GatewayError>;

    async fn find_connection(&self, id: &str) -> Result<Option<Connection>, GatewayError>;

    /// Clients whose `due_at` falls in `window` and whose tenant's
    /// connection is flagged connected.
    async fn find_clients_due(&self, window: DueWindow) -> Result<Vec<DueClient>, GatewayError>;

    async fn set_last_reminder_due_at(
        &self,
        client_id: &str,
        due_at: NaiveDate,
    ) -> Result<(), GatewayError>;
}
