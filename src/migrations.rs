use anyhow::Result;
use sqlx::SqlitePool;
use tracing::info;

/// Idempotent schema bootstrap, run once at startup.
pub async fn run(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pending_changes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            table_name TEXT NOT NULL,
            record_id TEXT NOT NULL,
            operation TEXT NOT NULL CHECK(operation IN ('INSERT', 'UPDATE', 'DELETE')),
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE(table_name, record_id, operation)
        )
    "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_pending_changes_created ON pending_changes(created_at)",
    )
    .execute(pool)
    .await?;

    // Single-row table, id is pinned to 1
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS clock_state (
            id INTEGER PRIMARY KEY CHECK(id = 1),
            offset_millis INTEGER NOT NULL,
            last_sync_epoch_millis INTEGER NOT NULL,
            last_corrected TEXT NOT NULL
        )
    "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            email TEXT,
            active INTEGER NOT NULL DEFAULT 1
        )
    "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS events (
            id TEXT PRIMARY KEY,
            user_id TEXT,
            title TEXT,
            starts_at TEXT,
            ends_at TEXT,
            active INTEGER NOT NULL DEFAULT 1
        )
    "#,
    )
    .execute(pool)
    .await?;

    // Older databases predate soft deletes
    if !column_exists(pool, "events", "active").await? {
        sqlx::query("ALTER TABLE events ADD COLUMN active INTEGER NOT NULL DEFAULT 1")
            .execute(pool)
            .await?;
    }
    if !column_exists(pool, "users", "active").await? {
        sqlx::query("ALTER TABLE users ADD COLUMN active INTEGER NOT NULL DEFAULT 1")
            .execute(pool)
            .await?;
    }

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_user_start ON events(user_id, starts_at)")
        .execute(pool)
        .await?;

    info!("schema ready");
    Ok(())
}

async fn column_exists(pool: &SqlitePool, table: &str, column: &str) -> Result<bool> {
    let count: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM pragma_table_info('{}') WHERE name = ?",
        table
    ))
    .bind(column)
    .fetch_one(pool)
    .await?;

    Ok(count > 0)
}
