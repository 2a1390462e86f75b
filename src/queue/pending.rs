use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::warn;

use crate::store::{Operation, Payload};

/// A locally recorded intent to mutate the record store, queued because the
/// store was unreachable at mutation time.
#[derive(Clone, Debug)]
pub struct PendingChange {
    pub id: i64,
    pub table_name: String,
    pub record_id: String,
    pub operation: Operation,
    pub payload: Payload,
    pub created_at: DateTime<Utc>,
}

/// Crash-durable queue of pending changes backed by the local database.
///
/// Uniqueness is enforced on (table, record, operation): re-queueing the same
/// triple is silently ignored, so at most one pending operation of a given
/// kind survives per record.
#[derive(Clone)]
pub struct PendingQueue {
    pool: SqlitePool,
}

impl PendingQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Returns false when the triple was already queued and the enqueue
    /// was dropped as a duplicate.
    pub async fn enqueue(
        &self,
        table: &str,
        record_id: &str,
        operation: Operation,
        payload: &Payload,
    ) -> Result<bool> {
        let payload_json =
            serde_json::to_string(payload).context("failed to serialize pending payload")?;

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO pending_changes
                (table_name, record_id, operation, payload, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(table)
        .bind(record_id)
        .bind(operation.as_str())
        .bind(payload_json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// All queued changes, oldest first. A row that no longer decodes is
    /// purged with a warning rather than blocking the healthy ones.
    pub async fn fetch_all(&self) -> Result<Vec<PendingChange>> {
        let rows: Vec<(i64, String, String, String, String, String)> = sqlx::query_as(
            r#"
            SELECT id, table_name, record_id, operation, payload, created_at
            FROM pending_changes
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut changes = Vec::with_capacity(rows.len());
        for (id, table_name, record_id, operation, payload, created_at) in rows {
            match decode_row(id, table_name, record_id, &operation, &payload, &created_at) {
                Ok(change) => changes.push(change),
                Err(e) => {
                    warn!("dropping undecodable pending change {id}: {e:#}");
                    self.remove(id).await?;
                }
            }
        }
        Ok(changes)
    }

    /// Delete a change after it has been applied against the record store.
    pub async fn remove(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM pending_changes WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pending_changes")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

fn decode_row(
    id: i64,
    table_name: String,
    record_id: String,
    operation: &str,
    payload: &str,
    created_at: &str,
) -> Result<PendingChange> {
    Ok(PendingChange {
        id,
        table_name,
        record_id,
        operation: Operation::parse(operation)?,
        payload: serde_json::from_str(payload)
            .with_context(|| format!("corrupt payload for pending change {id}"))?,
        created_at: DateTime::parse_from_rfc3339(created_at)?.with_timezone(&Utc),
    })
}
