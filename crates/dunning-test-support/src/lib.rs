pub mod chat;
pub mod gateway;

pub use chat::{FakeConnector, FakeSocket, OpenedSession, SentMessage};
pub use gateway::InMemoryGateway;

pub mod fixtures {
    use std::future::Future;
    use std::time::Duration;

    use chrono::NaiveDate;
    use dunning_core::{Client, Connection, MessageTemplate, PaymentKey, Product};

    pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap_or_else(|| panic!("invalid fixture date {y}-{m}-{d}"))
    }

    pub fn connection(id: &str, user_id: &str, is_connected: bool) -> Connection {
        Connection {
            id: id.to_string(),
            user_id: user_id.to_string(),
            phone_number: "5511988887777".to_string(),
            is_connected,
            last_connected_at: None,
        }
    }

    pub fn client(id: &str, user_id: &str, due_at: Option<NaiveDate>) -> Client {
        Client {
            id: id.to_string(),
            user_id: user_id.to_string(),
            name: "Maria".to_string(),
            phone: "+55 11 99999-0000".to_string(),
            due_at,
            last_reminder_due_at: None,
            product: None,
            template: None,
            payment_key: None,
        }
    }

    pub fn product(name: &str, value_cents: i64) -> Product {
        Product {
            id: format!("p-{name}"),
            name: name.to_string(),
            value_cents,
        }
    }

    pub fn template(content: &str) -> MessageTemplate {
        MessageTemplate {
            id: "t1".to_string(),
            content: content.to_string(),
        }
    }

    pub fn payment_key(key_type: &str, key_value: &str) -> PaymentKey {
        PaymentKey {
            id: "k1".to_string(),
            key_type: key_type.to_string(),
            key_value: key_value.to_string(),
        }
    }

    /// Poll `condition` until it holds, panicking after a generous bound.
    /// Works under a paused clock since every sleep lets the runtime advance.
    pub async fn eventually<F>(what: &str, mut condition: F)
    where
        F: FnMut() -> bool,
    {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    /// Await `future` with a timeout, returning `None` if it never completes.
    pub async fn within<T>(limit: Duration, future: impl Future<Output = T>) -> Option<T> {
        tokio::time::timeout(limit, future).await.ok()
    }
}
