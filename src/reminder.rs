use anyhow::Result;
use chrono::Duration;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::clock::TrustedClock;
use crate::queue::Outbox;
use crate::store::EventSource;

/// Lead times (minutes before the event) at which a reminder fires.
const LEAD_THRESHOLDS_MIN: [i64; 4] = [1440, 60, 15, 5];

/// Tolerance around a threshold, tightened close to the event so the 15
/// and 5 minute windows cannot overlap.
fn tolerance_minutes(minutes_until: i64) -> i64 {
    if minutes_until <= 10 { 1 } else { 2 }
}

/// Scans upcoming events on a fixed cadence and queues reminder emails when
/// an event crosses one of the lead-time thresholds.
///
/// Firing is a live window check against the trusted clock on every run;
/// there is no persisted already-sent marker, so a run landing twice inside
/// the same tolerance window duplicates the reminder and downtime across a
/// window misses it. Inherited behavior, kept deliberately.
pub struct ReminderScheduler {
    clock: Arc<TrustedClock>,
    events: Arc<dyn EventSource>,
    outbox: Arc<Outbox>,
    lookahead: Duration,
}

impl ReminderScheduler {
    pub fn new(
        clock: Arc<TrustedClock>,
        events: Arc<dyn EventSource>,
        outbox: Arc<Outbox>,
        lookahead_hours: i64,
    ) -> Self {
        Self {
            clock,
            events,
            outbox,
            lookahead: Duration::hours(lookahead_hours),
        }
    }

    /// One scan pass. Returns the number of reminder tasks queued.
    pub async fn scan_once(&self) -> Result<usize> {
        let now = self.clock.now();
        let until = now + self.lookahead;
        let mut fired = 0;

        for user_id in self.events.users_with_upcoming_events(now, until).await? {
            let Some(email) = self.events.email_for_user(&user_id).await? else {
                debug!("user {user_id} has no email on file, skipping reminders");
                continue;
            };

            for event in self.events.events_for_user(&user_id, now, until).await? {
                // Round to the nearest minute so an event at exactly one
                // threshold lands on it regardless of sub-minute jitter
                let minutes_until = ((event.starts_at - now).num_seconds() + 30) / 60;

                for threshold in LEAD_THRESHOLDS_MIN {
                    if (minutes_until - threshold).abs() <= tolerance_minutes(minutes_until) {
                        self.outbox
                            .queue_event_reminder(&email, &event.title, event.starts_at, threshold)
                            .await?;
                        fired += 1;
                        info!(
                            "queued {threshold}-minute reminder for event {} to {email}",
                            event.id
                        );
                    }
                }
            }
        }

        Ok(fired)
    }

    pub async fn run(
        self: Arc<Self>,
        mut shutdown_rx: broadcast::Receiver<()>,
        interval_secs: u64,
    ) -> Result<()> {
        let mut tick = interval(tokio::time::Duration::from_secs(interval_secs));

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    break;
                }
                _ = tick.tick() => {
                    if let Err(e) = self.scan_once().await {
                        warn!("reminder scan failed: {e:#}");
                    }
                }
            }
        }

        Ok(())
    }
}
