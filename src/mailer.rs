use anyhow::Result;
use chrono::{DateTime, Utc};
use icalendar::{Calendar, Component, Event as IcsEvent, EventLike};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tokio::time::{Duration, Instant, interval_at};
use tracing::{debug, error, info, warn};

use crate::queue::{EmailTask, Outbox};
use crate::store::{MailTransport, SendError};

/// Outcome of one dispatch run over the outbound-email queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub sent: usize,
    pub retained: usize,
    pub dropped: usize,
}

/// Drains the outbound-email queue through the mail transport.
///
/// Transient failures keep the task queued for the next run; permanent ones
/// drop it after logging. Without a configured transport every run is a
/// no-op, leaving the queue intact.
pub struct MailDispatcher {
    outbox: Arc<Outbox>,
    transport: Option<Arc<dyn MailTransport>>,
    dispatching: AtomicBool,
}

impl MailDispatcher {
    pub fn new(outbox: Arc<Outbox>, transport: Option<Arc<dyn MailTransport>>) -> Self {
        Self {
            outbox,
            transport,
            dispatching: AtomicBool::new(false),
        }
    }

    /// One pass over the queue. Returns None when no transport is configured
    /// or another dispatch is already running.
    pub async fn dispatch_once(&self) -> Result<Option<DispatchReport>> {
        let Some(transport) = &self.transport else {
            debug!("mail transport not configured, skipping dispatch");
            return Ok(None);
        };

        if self.dispatching.swap(true, Ordering::SeqCst) {
            debug!("dispatch already in progress, skipping");
            return Ok(None);
        }

        let result = self.dispatch_locked(transport.as_ref()).await;
        self.dispatching.store(false, Ordering::SeqCst);
        result.map(Some)
    }

    async fn dispatch_locked(&self, transport: &dyn MailTransport) -> Result<DispatchReport> {
        let tasks = self.outbox.snapshot().await;
        if tasks.is_empty() {
            return Ok(DispatchReport::default());
        }

        let mut report = DispatchReport::default();
        let mut done = Vec::new();

        for task in tasks {
            let (subject, body) = render(&task);
            match transport.send(task.recipient(), &subject, &body).await {
                Ok(()) => {
                    report.sent += 1;
                    done.push(task);
                }
                Err(SendError::Transient(e)) => {
                    warn!("transient send failure to {}, will retry: {e}", task.recipient());
                    report.retained += 1;
                }
                Err(SendError::Permanent(e)) => {
                    error!("permanent send failure to {}, dropping task: {e}", task.recipient());
                    report.dropped += 1;
                    done.push(task);
                }
            }
        }

        // Re-persists only when membership actually changed
        self.outbox.complete(&done).await?;

        info!(
            "mail dispatch finished: {} sent, {} retained, {} dropped",
            report.sent, report.retained, report.dropped
        );
        Ok(report)
    }

    pub async fn run(
        self: Arc<Self>,
        mut shutdown_rx: broadcast::Receiver<()>,
        interval_secs: u64,
    ) -> Result<()> {
        // Mandatory initial delay: the first run happens a full period in
        let period = Duration::from_secs(interval_secs);
        let mut tick = interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    break;
                }
                _ = tick.tick() => {
                    if let Err(e) = self.dispatch_once().await {
                        warn!("mail dispatch failed: {e:#}");
                    }
                }
            }
        }

        Ok(())
    }
}

fn render(task: &EmailTask) -> (String, String) {
    match task {
        EmailTask::Verification { token, .. } => (
            "Verify your account".to_string(),
            format!("Enter this code to verify your account: {token}\n"),
        ),
        EmailTask::EventReminder {
            event_title,
            starts_at,
            minutes_before,
            ..
        } => (
            format!("Reminder: {event_title} in {}", lead_label(*minutes_before)),
            format!(
                "Your event \"{event_title}\" starts at {}.\n",
                starts_at.format("%Y-%m-%d %H:%M UTC")
            ),
        ),
        EmailTask::CalendarInvitation {
            event_title,
            starts_at,
            ends_at,
            organizer,
            ..
        } => (
            format!("Invitation: {event_title}"),
            format!(
                "{organizer} invites you to \"{event_title}\".\n\n{}",
                render_ics(event_title, *starts_at, *ends_at)
            ),
        ),
    }
}

fn lead_label(minutes: i64) -> String {
    if minutes % 1440 == 0 {
        format!("{} day(s)", minutes / 1440)
    } else if minutes % 60 == 0 {
        format!("{} hour(s)", minutes / 60)
    } else {
        format!("{minutes} minute(s)")
    }
}

fn render_ics(title: &str, starts_at: DateTime<Utc>, ends_at: DateTime<Utc>) -> String {
    let event = IcsEvent::new()
        .summary(title)
        .starts(starts_at)
        .ends(ends_at)
        .done();
    Calendar::new().push(event).done().to_string()
}
