//! [`PersistenceGateway`] over the libSQL schema.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use dunning_core::{
    Client, Connection, DueClient, DueWindow, GatewayError, MessageTemplate, PaymentKey,
    PersistenceGateway, Product,
};
use libsql::{Row, Value};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::Database;

const DATE_FORMAT: &str = "%Y-%m-%d";

const CONNECTION_COLUMNS: &str = "id, user_id, phone_number, is_connected, last_connected_at";

const DUE_CLIENTS_QUERY: &str = r#"
SELECT c.id, c.user_id, c.name, c.phone, c.due_at, c.last_reminder_due_at,
       conn.id,
       p.id, p.name, p.value_cents,
       t.id, t.content,
       k.id, k.key_type, k.key_value
FROM clients c
JOIN connections conn ON conn.user_id = c.user_id AND conn.is_connected = 1
LEFT JOIN products p ON p.id = c.product_id
LEFT JOIN message_templates t ON t.id = c.template_id
LEFT JOIN payment_keys k ON k.id = c.payment_key_id
WHERE c.due_at IS NOT NULL AND c.due_at BETWEEN ?1 AND ?2
ORDER BY c.due_at, c.id
"#;

fn query_failed(err: libsql::Error) -> GatewayError {
    GatewayError::QueryFailed(err.to_string())
}

#[derive(Clone)]
pub struct LibSqlGateway {
    db: Database,
}

impl LibSqlGateway {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    async fn load_connection(&self, column: &str, key: &str) -> Result<Option<Connection>, GatewayError> {
        let conn = self.db.connection().await;
        let sql = format!("SELECT {CONNECTION_COLUMNS} FROM connections WHERE {column} = ?1");
        let mut rows = conn.query(&sql, [key]).await.map_err(query_failed)?;
        match rows.next().await.map_err(query_failed)? {
            Some(row) => Ok(Some(connection_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn update_connection(&self, id: &str, sql: &str, params: Vec<Value>) -> Result<(), GatewayError> {
        let conn = self.db.connection().await;
        let changed = conn.execute(sql, params).await.map_err(query_failed)?;
        if changed == 0 {
            return Err(GatewayError::NotFound(format!("connection {id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl PersistenceGateway for LibSqlGateway {
    #[instrument(skip(self))]
    async fn create_or_get_connection(
        &self,
        tenant_id: &str,
        phone_number: &str,
    ) -> Result<Connection, GatewayError> {
        {
            let conn = self.db.connection().await;
            let id = Uuid::new_v4().to_string();
            let inserted = conn
                .execute(
                    "INSERT INTO connections (id, user_id, phone_number) VALUES (?1, ?2, ?3)
                     ON CONFLICT(user_id) DO NOTHING",
                    [id.as_str(), tenant_id, phone_number],
                )
                .await
                .map_err(query_failed)?;
            if inserted > 0 {
                debug!(connection_id = %id, "Created connection");
            }
        }

        self.load_connection("user_id", tenant_id)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("connection for tenant {tenant_id}")))
    }

    async fn mark_connected(&self, id: &str) -> Result<(), GatewayError> {
        self.update_connection(
            id,
            "UPDATE connections
             SET is_connected = 1, last_connected_at = ?1, updated_at = datetime('now')
             WHERE id = ?2",
            vec![
                Value::Text(Utc::now().to_rfc3339()),
                Value::Text(id.to_string()),
            ],
        )
        .await
    }

    async fn mark_disconnected(&self, id: &str) -> Result<(), GatewayError> {
        self.update_connection(
            id,
            "UPDATE connections SET is_connected = 0, updated_at = datetime('now') WHERE id = ?1",
            vec![Value::Text(id.to_string())],
        )
        .await
    }

    async fn find_connection(&self, id: &str) -> Result<Option<Connection>, GatewayError> {
        self.load_connection("id", id).await
    }

    #[instrument(skip(self), fields(start = %window.start, end = %window.end))]
    async fn find_clients_due(&self, window: DueWindow) -> Result<Vec<DueClient>, GatewayError> {
        let conn = self.db.connection().await;
        let start = window.start.format(DATE_FORMAT).to_string();
        let end = window.end.format(DATE_FORMAT).to_string();
        let mut rows = conn
            .query(DUE_CLIENTS_QUERY, [start.as_str(), end.as_str()])
            .await
            .map_err(query_failed)?;

        let mut due = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_failed)? {
            due.push(due_client_from_row(&row)?);
        }
        debug!(count = due.len(), "Loaded clients due");
        Ok(due)
    }

    async fn set_last_reminder_due_at(
        &self,
        client_id: &str,
        due_at: NaiveDate,
    ) -> Result<(), GatewayError> {
        let conn = self.db.connection().await;
        let changed = conn
            .execute(
                "UPDATE clients SET last_reminder_due_at = ?1, updated_at = datetime('now') WHERE id = ?2",
                [due_at.format(DATE_FORMAT).to_string(), client_id.to_string()],
            )
            .await
            .map_err(query_failed)?;
        if changed == 0 {
            return Err(GatewayError::NotFound(format!("client {client_id}")));
        }
        Ok(())
    }
}

fn text(row: &Row, idx: i32) -> Result<String, GatewayError> {
    row.get::<String>(idx)
        .map_err(|e| GatewayError::Malformed(format!("column {idx}: {e}")))
}

fn optional_text(row: &Row, idx: i32) -> Option<String> {
    row.get::<Option<String>>(idx).ok().flatten()
}

fn optional_date(row: &Row, idx: i32) -> Result<Option<NaiveDate>, GatewayError> {
    optional_text(row, idx)
        .map(|raw| {
            NaiveDate::parse_from_str(&raw, DATE_FORMAT)
                .map_err(|e| GatewayError::Malformed(format!("date {raw:?}: {e}")))
        })
        .transpose()
}

fn connection_from_row(row: &Row) -> Result<Connection, GatewayError> {
    let last_connected_at = optional_text(row, 4)
        .map(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .map(|at| at.with_timezone(&Utc))
                .map_err(|e| GatewayError::Malformed(format!("timestamp {raw:?}: {e}")))
        })
        .transpose()?;

    Ok(Connection {
        id: text(row, 0)?,
        user_id: text(row, 1)?,
        phone_number: text(row, 2)?,
        is_connected: row.get::<i64>(3).unwrap_or(0) != 0,
        last_connected_at,
    })
}

fn due_client_from_row(row: &Row) -> Result<DueClient, GatewayError> {
    let product = match optional_text(row, 7) {
        Some(id) => Some(Product {
            id,
            name: text(row, 8)?,
            value_cents: row
                .get::<i64>(9)
                .map_err(|e| GatewayError::Malformed(format!("value_cents: {e}")))?,
        }),
        None => None,
    };
    let template = match optional_text(row, 10) {
        Some(id) => Some(MessageTemplate {
            id,
            content: text(row, 11)?,
        }),
        None => None,
    };
    let payment_key = match optional_text(row, 12) {
        Some(id) => Some(PaymentKey {
            id,
            key_type: text(row, 13)?,
            key_value: text(row, 14)?,
        }),
        None => None,
    };

    Ok(DueClient {
        session_id: text(row, 6)?,
        client: Client {
            id: text(row, 0)?,
            user_id: text(row, 1)?,
            name: text(row, 2)?,
            phone: text(row, 3)?,
            due_at: optional_date(row, 4)?,
            last_reminder_due_at: optional_date(row, 5)?,
            product,
            template,
            payment_key,
        },
    })
}
