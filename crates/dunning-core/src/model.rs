//! Records shared by the messaging channel and the reminder dispatcher.
//!
//! A tenant (`user_id`) owns at most one [`Connection`]; its `id` doubles as
//! the session identifier used by the channel's credential store, session
//! registry and event bus topics.

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Durable record of a tenant's connection to the messaging network.
///
/// `is_connected` is an eventually-consistent cache of the session registry
/// and must be reconciled before it is reported to anyone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub id: String,
    pub user_id: String,
    pub phone_number: String,
    pub is_connected: bool,
    pub last_connected_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub name: String,
    /// Price in cents of the tenant's currency.
    pub value_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTemplate {
    pub id: String,
    /// Body with `{nome}`, `{produto}`, `{valor}` and `{vencimento}` tokens.
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentKey {
    pub id: String,
    /// Kind of key, e.g. `"CPF"`, `"E-mail"`, `"Aleatória"`.
    pub key_type: String,
    pub key_value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub phone: String,
    pub due_at: Option<NaiveDate>,
    /// Dedupe marker: the `due_at` the last reminder was sent for.
    pub last_reminder_due_at: Option<NaiveDate>,
    pub product: Option<Product>,
    pub template: Option<MessageTemplate>,
    pub payment_key: Option<PaymentKey>,
}

impl Client {
    /// True when a reminder was already sent for the current due date.
    pub fn already_notified(&self) -> bool {
        matches!(
            (self.due_at, self.last_reminder_due_at),
            (Some(due), Some(last)) if due == last
        )
    }
}

/// A client whose due date falls in the dispatch window, paired with the
/// session id of its tenant's connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueClient {
    pub session_id: String,
    pub client: Client,
}

/// Inclusive range of due dates scanned by one dispatcher run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DueWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DueWindow {
    /// `[today - days, today]`.
    pub fn lookback(today: NaiveDate, days: u32) -> Self {
        let start = today
            .checked_sub_days(Days::new(u64::from(days)))
            .unwrap_or(NaiveDate::MIN);
        Self { start, end: today }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn client(due_at: Option<NaiveDate>, last: Option<NaiveDate>) -> Client {
        Client {
            id: "c1".to_string(),
            user_id: "u1".to_string(),
            name: "Maria".to_string(),
            phone: "5511999990000".to_string(),
            due_at,
            last_reminder_due_at: last,
            product: None,
            template: None,
            payment_key: None,
        }
    }

    #[test]
    fn lookback_window_includes_both_ends() {
        let window = DueWindow::lookback(date(2024, 5, 10), 3);
        assert_eq!(window.start, date(2024, 5, 7));
        assert_eq!(window.end, date(2024, 5, 10));
        assert!(window.contains(date(2024, 5, 7)));
        assert!(window.contains(date(2024, 5, 10)));
        assert!(!window.contains(date(2024, 5, 6)));
        assert!(!window.contains(date(2024, 5, 11)));
    }

    #[test]
    fn lookback_window_crosses_month_boundary() {
        let window = DueWindow::lookback(date(2024, 3, 1), 3);
        assert_eq!(window.start, date(2024, 2, 27));
    }

    #[test]
    fn already_notified_requires_matching_dates() {
        let due = date(2024, 5, 10);
        assert!(client(Some(due), Some(due)).already_notified());
        assert!(!client(Some(due), None).already_notified());
        assert!(!client(Some(due), Some(date(2024, 4, 10))).already_notified());
        assert!(!client(None, None).already_notified());
    }
}
