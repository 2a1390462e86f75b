use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::warn;

/// A deferred outbound email. Tasks survive restarts via a whole-queue
/// snapshot file, which is plenty for the small volumes involved.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EmailTask {
    Verification {
        recipient: String,
        token: String,
    },
    EventReminder {
        recipient: String,
        event_title: String,
        starts_at: DateTime<Utc>,
        minutes_before: i64,
    },
    CalendarInvitation {
        recipient: String,
        event_title: String,
        starts_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
        organizer: String,
    },
}

impl EmailTask {
    pub fn recipient(&self) -> &str {
        match self {
            EmailTask::Verification { recipient, .. }
            | EmailTask::EventReminder { recipient, .. }
            | EmailTask::CalendarInvitation { recipient, .. } => recipient,
        }
    }
}

/// Durable outbound-email queue. Every enqueue re-persists the entire queue;
/// an absent or unreadable snapshot file just means starting empty.
pub struct Outbox {
    path: PathBuf,
    tasks: Mutex<Vec<EmailTask>>,
}

impl Outbox {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let tasks = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<Vec<EmailTask>>(&bytes) {
                Ok(tasks) => tasks,
                Err(e) => {
                    warn!("outbox snapshot {:?} is corrupt, starting empty: {e}", path);
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                warn!("could not read outbox snapshot {:?}, starting empty: {e}", path);
                Vec::new()
            }
        };

        Self {
            path,
            tasks: Mutex::new(tasks),
        }
    }

    pub async fn queue_verification(&self, recipient: &str, token: &str) -> Result<()> {
        self.push(EmailTask::Verification {
            recipient: recipient.to_string(),
            token: token.to_string(),
        })
        .await
    }

    pub async fn queue_event_reminder(
        &self,
        recipient: &str,
        event_title: &str,
        starts_at: DateTime<Utc>,
        minutes_before: i64,
    ) -> Result<()> {
        self.push(EmailTask::EventReminder {
            recipient: recipient.to_string(),
            event_title: event_title.to_string(),
            starts_at,
            minutes_before,
        })
        .await
    }

    pub async fn queue_calendar_invitation(
        &self,
        recipient: &str,
        event_title: &str,
        starts_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
        organizer: &str,
    ) -> Result<()> {
        self.push(EmailTask::CalendarInvitation {
            recipient: recipient.to_string(),
            event_title: event_title.to_string(),
            starts_at,
            ends_at,
            organizer: organizer.to_string(),
        })
        .await
    }

    async fn push(&self, task: EmailTask) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        tasks.push(task);
        self.persist(&tasks).await
    }

    /// Current queue contents, in order.
    pub async fn snapshot(&self) -> Vec<EmailTask> {
        self.tasks.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.tasks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.lock().await.is_empty()
    }

    /// Remove tasks that finished (sent, or permanently failed) during a
    /// dispatch run. The snapshot file is rewritten only when membership
    /// actually changed. Returns whether it did.
    pub async fn complete(&self, done: &[EmailTask]) -> Result<bool> {
        if done.is_empty() {
            return Ok(false);
        }

        let mut tasks = self.tasks.lock().await;
        let mut changed = false;
        for finished in done {
            if let Some(pos) = tasks.iter().position(|t| t == finished) {
                tasks.remove(pos);
                changed = true;
            }
        }

        if changed {
            self.persist(&tasks).await?;
        }
        Ok(changed)
    }

    async fn persist(&self, tasks: &[EmailTask]) -> Result<()> {
        let json = serde_json::to_vec_pretty(tasks)?;
        tokio::fs::write(&self.path, json)
            .await
            .with_context(|| format!("failed to persist outbox snapshot to {:?}", self.path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static SNAPSHOT_SEQ: AtomicU64 = AtomicU64::new(0);

    fn snapshot_path() -> PathBuf {
        let n = SNAPSHOT_SEQ.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("waypost-outbox-test-{}-{n}.json", std::process::id()))
    }

    #[tokio::test]
    async fn queue_survives_a_restart_in_order() {
        let path = snapshot_path();
        let starts = Utc::now();

        let outbox = Outbox::load(&path);
        outbox.queue_verification("a@example.com", "tok-1").await.unwrap();
        outbox
            .queue_event_reminder("b@example.com", "Standup", starts, 15)
            .await
            .unwrap();
        outbox
            .queue_calendar_invitation(
                "c@example.com",
                "Review",
                starts,
                starts + chrono::Duration::hours(1),
                "d@example.com",
            )
            .await
            .unwrap();

        let before = outbox.snapshot().await;
        drop(outbox);

        let reloaded = Outbox::load(&path);
        assert_eq!(reloaded.snapshot().await, before);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn corrupt_snapshot_starts_empty() {
        let path = snapshot_path();
        std::fs::write(&path, b"{ not json").unwrap();

        let outbox = Outbox::load(&path);
        assert!(outbox.is_empty().await);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn missing_snapshot_starts_empty() {
        let outbox = Outbox::load(snapshot_path());
        assert_eq!(outbox.len().await, 0);
    }

    #[tokio::test]
    async fn duplicate_queued_during_dispatch_is_not_lost() {
        let path = snapshot_path();
        let outbox = Outbox::load(&path);

        // One copy is snapshotted and sent; an identical duplicate lands
        // while the dispatch run is still in flight
        outbox.queue_verification("a@example.com", "t1").await.unwrap();
        let in_flight = outbox.snapshot().await;
        outbox.queue_verification("a@example.com", "t1").await.unwrap();

        // Completing the sent copy removes exactly one instance; the
        // duplicate stays queued for the next run
        assert!(outbox.complete(&in_flight).await.unwrap());
        assert_eq!(outbox.len().await, 1);
        assert_eq!(outbox.snapshot().await, in_flight);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn complete_removes_only_finished_tasks() {
        let path = snapshot_path();
        let outbox = Outbox::load(&path);

        outbox.queue_verification("a@example.com", "t1").await.unwrap();
        outbox.queue_verification("b@example.com", "t2").await.unwrap();

        let done = vec![EmailTask::Verification {
            recipient: "a@example.com".to_string(),
            token: "t1".to_string(),
        }];
        assert!(outbox.complete(&done).await.unwrap());
        assert!(!outbox.complete(&done).await.unwrap());

        let remaining = outbox.snapshot().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].recipient(), "b@example.com");

        let _ = std::fs::remove_file(&path);
    }
}
