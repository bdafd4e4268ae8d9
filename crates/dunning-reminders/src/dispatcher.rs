use std::sync::Arc;

use chrono::{FixedOffset, NaiveDate, Offset, Utc};
use dunning_channel::{Destination, SessionRegistry};
use dunning_core::{DueClient, DueWindow, PersistenceGateway};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::error::ReminderError;
use crate::render::MessageRenderer;

/// Tally of one dispatcher run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub examined: usize,
    pub sent: usize,
    pub already_notified: usize,
    /// Tenant flagged connected but no live session in the registry.
    pub offline: usize,
    /// Destination missing, not on the network, or the lookup failed.
    pub unreachable: usize,
    pub failed: usize,
}

enum Outcome {
    Sent,
    AlreadyNotified,
    Offline,
    Unreachable,
}

/// Sends at most one reminder per client and due date.
///
/// Clients are processed one after another; outbound sends are deliberately
/// never issued concurrently within a batch.
pub struct ReminderDispatcher {
    gateway: Arc<dyn PersistenceGateway>,
    registry: Arc<SessionRegistry>,
    renderer: MessageRenderer,
    lookback_days: u32,
    offset: FixedOffset,
    verify_destination: bool,
}

impl ReminderDispatcher {
    pub const DEFAULT_LOOKBACK_DAYS: u32 = 3;

    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        registry: Arc<SessionRegistry>,
        renderer: MessageRenderer,
    ) -> Self {
        Self {
            gateway,
            registry,
            renderer,
            lookback_days: Self::DEFAULT_LOOKBACK_DAYS,
            offset: Utc.fix(),
            verify_destination: true,
        }
    }

    pub fn with_lookback_days(mut self, days: u32) -> Self {
        self.lookback_days = days;
        self
    }

    /// Offset of the wall clock that decides what "today" is.
    pub fn with_utc_offset(mut self, offset: FixedOffset) -> Self {
        self.offset = offset;
        self
    }

    /// Skip the network presence lookup before each send.
    pub fn without_destination_check(mut self) -> Self {
        self.verify_destination = false;
        self
    }

    pub fn today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.offset).date_naive()
    }

    /// Run for the current local date.
    pub async fn run_now(&self) -> Result<DispatchReport, ReminderError> {
        self.run_for(self.today()).await
    }

    /// Remind every due client of a connected tenant. Per-client failures
    /// are logged and counted; only a failure to list clients aborts the run.
    #[instrument(skip(self))]
    pub async fn run_for(&self, today: NaiveDate) -> Result<DispatchReport, ReminderError> {
        let window = DueWindow::lookback(today, self.lookback_days);
        let due = self.gateway.find_clients_due(window).await?;
        debug!(candidates = due.len(), start = %window.start, end = %window.end, "Dispatching reminders");

        let mut report = DispatchReport::default();
        for entry in &due {
            report.examined += 1;
            match self.remind(entry).await {
                Ok(Outcome::Sent) => report.sent += 1,
                Ok(Outcome::AlreadyNotified) => report.already_notified += 1,
                Ok(Outcome::Offline) => report.offline += 1,
                Ok(Outcome::Unreachable) => report.unreachable += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        client_id = %entry.client.id,
                        session_id = %entry.session_id,
                        error = %e,
                        "Reminder failed, continuing with next client"
                    );
                }
            }
        }

        info!(
            examined = report.examined,
            sent = report.sent,
            already_notified = report.already_notified,
            offline = report.offline,
            unreachable = report.unreachable,
            failed = report.failed,
            "Reminder batch finished"
        );
        Ok(report)
    }

    async fn remind(&self, entry: &DueClient) -> Result<Outcome, ReminderError> {
        let client = &entry.client;
        let due_at = client
            .due_at
            .ok_or_else(|| ReminderError::MissingDueDate(client.id.clone()))?;

        let Some(handle) = self.registry.get(&entry.session_id) else {
            debug!(client_id = %client.id, session_id = %entry.session_id, "No live session, skipping");
            return Ok(Outcome::Offline);
        };

        let destination = match Destination::from_phone(&client.phone) {
            Ok(destination) => destination,
            Err(e) => {
                warn!(client_id = %client.id, error = %e, "Client phone is not addressable");
                return Ok(Outcome::Unreachable);
            }
        };

        if self.verify_destination {
            match handle.is_on_network(&destination).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(client_id = %client.id, "Destination not on the network");
                    return Ok(Outcome::Unreachable);
                }
                Err(e) => {
                    warn!(client_id = %client.id, error = %e, "Destination lookup failed");
                    return Ok(Outcome::Unreachable);
                }
            }
        }

        if client.already_notified() {
            return Ok(Outcome::AlreadyNotified);
        }

        let text = self.renderer.render(client);
        handle.send_text(&destination, &text).await?;
        self.gateway
            .set_last_reminder_due_at(&client.id, due_at)
            .await?;

        info!(client_id = %client.id, due_at = %due_at, "Reminder sent");
        Ok(Outcome::Sent)
    }
}
