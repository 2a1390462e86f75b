use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use thiserror::Error;

/// Opaque key-value payload carried by a pending change
pub type Payload = BTreeMap<String, String>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "INSERT" => Ok(Operation::Insert),
            "UPDATE" => Ok(Operation::Update),
            "DELETE" => Ok(Operation::Delete),
            other => Err(anyhow!("unknown operation: {other}")),
        }
    }
}

/// The remote table-like backend mutations are reconciled against.
///
/// `health_check` is a stronger probe than `is_reachable`: it exercises the
/// current connection and is used to detect silent ONLINE to OFFLINE drops.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn is_reachable(&self) -> bool;
    async fn health_check(&self) -> bool;
    async fn apply(
        &self,
        op: Operation,
        table: &str,
        record_id: &str,
        payload: &Payload,
    ) -> Result<()>;
}

/// Outbound mail channel. Failures must be classified so the dispatcher
/// knows whether a task is worth retrying.
#[derive(Debug, Error)]
pub enum SendError {
    /// Connectivity or timeout class failure, retry later
    #[error("transient mail failure: {0}")]
    Transient(String),
    /// Anything else, drop the task after logging
    #[error("permanent mail failure: {0}")]
    Permanent(String),
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<(), SendError>;
}

#[derive(Clone, Debug)]
pub struct Event {
    pub id: String,
    pub title: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

/// Read side of the calendar used by the reminder scheduler.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn users_with_upcoming_events(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<String>>;

    async fn events_for_user(
        &self,
        user_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Event>>;

    async fn email_for_user(&self, user_id: &str) -> Result<Option<String>>;
}

/// sqlx-backed record store. Tables are expected to carry a TEXT `id`
/// primary key and an `active` flag; deletes are soft.
pub struct SqliteRecordStore {
    pool: SqlitePool,
}

impl SqliteRecordStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

// Table and column names cannot be bound as parameters, so they are
// restricted to plain identifiers before being spliced into SQL.
fn checked_identifier(name: &str) -> Result<&str> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if ok {
        Ok(name)
    } else {
        Err(anyhow!("invalid identifier: {name:?}"))
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn is_reachable(&self) -> bool {
        self.pool.acquire().await.is_ok()
    }

    async fn health_check(&self) -> bool {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }

    async fn apply(
        &self,
        op: Operation,
        table: &str,
        record_id: &str,
        payload: &Payload,
    ) -> Result<()> {
        let table = checked_identifier(table)?;

        match op {
            Operation::Insert => {
                let mut columns = vec!["id"];
                for key in payload.keys() {
                    columns.push(checked_identifier(key)?);
                }
                let placeholders = vec!["?"; columns.len()].join(", ");
                let updates = columns[1..]
                    .iter()
                    .map(|c| format!("{c} = excluded.{c}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                let sql = if updates.is_empty() {
                    format!(
                        "INSERT INTO {table} ({}) VALUES ({placeholders}) ON CONFLICT(id) DO NOTHING",
                        columns.join(", ")
                    )
                } else {
                    format!(
                        "INSERT INTO {table} ({}) VALUES ({placeholders}) ON CONFLICT(id) DO UPDATE SET {updates}",
                        columns.join(", ")
                    )
                };

                let mut query = sqlx::query(&sql).bind(record_id);
                for value in payload.values() {
                    query = query.bind(value);
                }
                query.execute(&self.pool).await?;
            }
            Operation::Update => {
                if payload.is_empty() {
                    return Ok(());
                }
                let mut assignments = Vec::new();
                for key in payload.keys() {
                    assignments.push(format!("{} = ?", checked_identifier(key)?));
                }
                let sql = format!(
                    "UPDATE {table} SET {} WHERE id = ?",
                    assignments.join(", ")
                );

                let mut query = sqlx::query(&sql);
                for value in payload.values() {
                    query = query.bind(value);
                }
                query.bind(record_id).execute(&self.pool).await?;
            }
            Operation::Delete => {
                let sql = format!("UPDATE {table} SET active = 0 WHERE id = ?");
                sqlx::query(&sql).bind(record_id).execute(&self.pool).await?;
            }
        }

        Ok(())
    }
}

/// Event source over the same sqlite schema the record store writes to.
pub struct SqliteEventSource {
    pool: SqlitePool,
}

impl SqliteEventSource {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventSource for SqliteEventSource {
    async fn users_with_upcoming_events(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT user_id FROM events
             WHERE active = 1 AND starts_at >= ? AND starts_at < ?",
        )
        .bind(from.to_rfc3339())
        .bind(to.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn events_for_user(
        &self,
        user_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Event>> {
        let rows: Vec<(String, String, String, String)> = sqlx::query_as(
            "SELECT id, title, starts_at, ends_at FROM events
             WHERE active = 1 AND user_id = ? AND starts_at >= ? AND starts_at < ?
             ORDER BY starts_at ASC",
        )
        .bind(user_id)
        .bind(from.to_rfc3339())
        .bind(to.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        for (id, title, starts_at, ends_at) in rows {
            events.push(Event {
                id,
                title,
                starts_at: DateTime::parse_from_rfc3339(&starts_at)?.with_timezone(&Utc),
                ends_at: DateTime::parse_from_rfc3339(&ends_at)?.with_timezone(&Utc),
            });
        }
        Ok(events)
    }

    async fn email_for_user(&self, user_id: &str) -> Result<Option<String>> {
        let email: Option<(Option<String>,)> =
            sqlx::query_as("SELECT email FROM users WHERE id = ? AND active = 1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(email.and_then(|(e,)| e))
    }
}
