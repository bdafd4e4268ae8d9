//! "Run at these local wall-clock times" trigger.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Days, FixedOffset, NaiveTime, Utc};
use dunning_core::config::ReminderConfig;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::dispatcher::DispatchReport;
use crate::error::ReminderError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailySchedule {
    times: Vec<NaiveTime>,
    offset: FixedOffset,
}

impl DailySchedule {
    pub fn new(mut times: Vec<NaiveTime>, offset: FixedOffset) -> Result<Self, ReminderError> {
        if times.is_empty() {
            return Err(ReminderError::InvalidSchedule(
                "at least one time of day is required".to_string(),
            ));
        }
        times.sort();
        times.dedup();
        Ok(Self { times, offset })
    }

    pub fn from_config(config: &ReminderConfig) -> Result<Self, ReminderError> {
        let times = config
            .parsed_times()
            .map_err(|e| ReminderError::InvalidSchedule(e.to_string()))?;
        let offset = config
            .parsed_offset()
            .map_err(|e| ReminderError::InvalidSchedule(e.to_string()))?;
        Self::new(times, offset)
    }

    pub fn times(&self) -> &[NaiveTime] {
        &self.times
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// First fire instant strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = now.with_timezone(&self.offset).date_naive();
        let tomorrow = today.checked_add_days(Days::new(1)).unwrap_or(today);

        [today, tomorrow]
            .into_iter()
            .flat_map(|date| self.times.iter().map(move |time| date.and_time(*time)))
            .filter_map(|local| local.and_local_timezone(self.offset).single())
            .map(|fire| fire.with_timezone(&Utc))
            .find(|fire| *fire > now)
            .unwrap_or_else(|| now + chrono::Duration::days(1))
    }
}

/// Invoke `job` at every fire time of `schedule` until `token` is cancelled.
/// A failed run is logged; the loop carries on to the next fire time.
pub async fn run_daily<F, Fut>(schedule: DailySchedule, token: CancellationToken, job: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<DispatchReport, ReminderError>>,
{
    run_daily_with_clock(schedule, token, Utc::now, job).await
}

pub(crate) async fn run_daily_with_clock<C, F, Fut>(
    schedule: DailySchedule,
    token: CancellationToken,
    clock: C,
    mut job: F,
) where
    C: Fn() -> DateTime<Utc>,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<DispatchReport, ReminderError>>,
{
    let mut last_fire: Option<DateTime<Utc>> = None;
    loop {
        let now = clock();
        // Never fire the same slot twice if the timer wakes a little early.
        let anchor = last_fire.map_or(now, |last| last.max(now));
        let next = schedule.next_after(anchor);
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
        info!(next_run = %next, "Next reminder run scheduled");

        tokio::select! {
            _ = token.cancelled() => {
                info!("Reminder scheduler stopped");
                return;
            }
            _ = tokio::time::sleep(wait) => {}
        }

        last_fire = Some(next);
        match job().await {
            Ok(report) => info!(sent = report.sent, failed = report.failed, "Scheduled reminder run complete"),
            Err(e) => error!(error = %e, "Scheduled reminder run failed"),
        }
    }
}
