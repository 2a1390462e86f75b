use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{info, warn};

const NETWORK_TIMEOUT_SECS: u64 = 5;

/// An independent network-derived time reading.
#[async_trait]
pub trait TimeSource: Send + Sync {
    fn name(&self) -> &str;
    async fn fetch_epoch_millis(&self) -> Result<i64>;
}

#[derive(Clone, Copy, Debug)]
pub enum EpochUnit {
    Seconds,
    Milliseconds,
}

/// HTTP JSON time API exposing a unix-epoch field.
pub struct HttpTimeSource {
    name: String,
    url: String,
    field: String,
    unit: EpochUnit,
    client: reqwest::Client,
}

impl HttpTimeSource {
    pub fn new(name: &str, url: &str, field: &str, unit: EpochUnit) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(NETWORK_TIMEOUT_SECS))
            .timeout(std::time::Duration::from_secs(NETWORK_TIMEOUT_SECS))
            .build()
            .context("failed to build time source http client")?;

        Ok(Self {
            name: name.to_string(),
            url: url.to_string(),
            field: field.to_string(),
            unit,
            client,
        })
    }

    /// Primary and backup sources tried in order.
    pub fn defaults() -> Result<Vec<Arc<dyn TimeSource>>> {
        Ok(vec![
            Arc::new(Self::new(
                "worldtimeapi",
                "https://worldtimeapi.org/api/timezone/Etc/UTC",
                "unixtime",
                EpochUnit::Seconds,
            )?),
            Arc::new(Self::new(
                "jsontest",
                "http://date.jsontest.com",
                "milliseconds_since_epoch",
                EpochUnit::Milliseconds,
            )?),
        ])
    }
}

#[async_trait]
impl TimeSource for HttpTimeSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_epoch_millis(&self) -> Result<i64> {
        let body: serde_json::Value = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let raw = body
            .get(&self.field)
            .and_then(|v| v.as_i64())
            .ok_or_else(|| anyhow!("{} response missing field {:?}", self.name, self.field))?;

        Ok(match self.unit {
            EpochUnit::Seconds => raw * 1000,
            EpochUnit::Milliseconds => raw,
        })
    }
}

/// Wall clock corrected by the last known offset against network time.
///
/// `now()` never blocks and never fails: callers always get local time plus
/// the best offset seen so far. Tamper detection only raises a flag.
pub struct TrustedClock {
    pool: SqlitePool,
    sources: Vec<Arc<dyn TimeSource>>,
    offset_millis: AtomicI64,
    tampered: AtomicBool,
    tamper_threshold_millis: i64,
}

impl TrustedClock {
    /// Restore persisted clock state, or start with a zero offset on first
    /// run. A local clock that runs behind the last persisted corrected time
    /// by more than the threshold raises the tamper flag.
    pub async fn load(
        pool: SqlitePool,
        sources: Vec<Arc<dyn TimeSource>>,
        tamper_threshold_secs: i64,
    ) -> Result<Self> {
        let row: Option<(i64, i64, String)> = sqlx::query_as(
            "SELECT offset_millis, last_sync_epoch_millis, last_corrected FROM clock_state WHERE id = 1",
        )
        .fetch_optional(&pool)
        .await?;

        let clock = Self {
            pool,
            sources,
            offset_millis: AtomicI64::new(0),
            tampered: AtomicBool::new(false),
            tamper_threshold_millis: tamper_threshold_secs * 1000,
        };

        if let Some((offset, _last_sync, last_corrected)) = row {
            match DateTime::parse_from_rfc3339(&last_corrected) {
                Ok(last_corrected) => {
                    clock.offset_millis.store(offset, Ordering::Relaxed);

                    // Corrected time must never run behind what was already
                    // observed; a gap beyond the threshold means the local
                    // clock jumped back.
                    let corrected_now = clock.now();
                    let behind = (last_corrected.with_timezone(&Utc) - corrected_now)
                        .num_milliseconds();
                    if behind > clock.tamper_threshold_millis {
                        warn!(
                            "local clock runs {}s behind last trusted time, flagging possible manipulation",
                            behind / 1000
                        );
                        clock.tampered.store(true, Ordering::Relaxed);
                    }
                }
                Err(e) => {
                    // Unreadable state is treated like a first run, never fatal;
                    // the next successful sync overwrites it
                    warn!("corrupt clock state on disk, starting with zero offset: {e}");
                }
            }
        }

        Ok(clock)
    }

    /// Best-effort corrected time: local wall clock plus the last known offset.
    pub fn now(&self) -> DateTime<Utc> {
        Utc::now() + Duration::milliseconds(self.offset_millis.load(Ordering::Relaxed))
    }

    pub fn offset_millis(&self) -> i64 {
        self.offset_millis.load(Ordering::Relaxed)
    }

    pub fn tamper_detected(&self) -> bool {
        self.tampered.load(Ordering::Relaxed)
    }

    pub async fn last_sync(&self) -> Result<Option<DateTime<Utc>>> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT last_sync_epoch_millis FROM clock_state WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.and_then(|(millis,)| DateTime::from_timestamp_millis(millis)))
    }

    /// Fetch network time from the first responding source and replace the
    /// offset. When every source fails the previous offset is kept and the
    /// error is reported to the caller, which logs and moves on.
    pub async fn sync(&self) -> Result<()> {
        let mut failures = Vec::new();

        for source in &self.sources {
            match source.fetch_epoch_millis().await {
                Ok(network_millis) => {
                    let local_millis = Utc::now().timestamp_millis();
                    let offset = network_millis - local_millis;
                    self.offset_millis.store(offset, Ordering::Relaxed);

                    if let Err(e) = self.persist(offset, network_millis).await {
                        // Non-fatal: the in-memory offset is already live
                        warn!("failed to persist clock state: {e:#}");
                    }

                    info!(
                        "clock synced against {} (offset {}ms)",
                        source.name(),
                        offset
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!("time source {} failed: {e:#}", source.name());
                    failures.push(format!("{}: {e}", source.name()));
                }
            }
        }

        Err(anyhow!(
            "all time sources failed, keeping last known offset: {}",
            failures.join("; ")
        ))
    }

    async fn persist(&self, offset_millis: i64, network_millis: i64) -> Result<()> {
        let corrected = Utc::now() + Duration::milliseconds(offset_millis);
        sqlx::query(
            r#"
            INSERT INTO clock_state (id, offset_millis, last_sync_epoch_millis, last_corrected)
            VALUES (1, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                offset_millis = excluded.offset_millis,
                last_sync_epoch_millis = excluded.last_sync_epoch_millis,
                last_corrected = excluded.last_corrected
            "#,
        )
        .bind(offset_millis)
        .bind(network_millis)
        .bind(corrected.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Periodic clock re-sync task. The first tick fires immediately so the
/// offset is fresh right after startup.
pub async fn sync_worker(
    clock: Arc<TrustedClock>,
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
                if let Err(e) = clock.sync().await {
                    warn!("clock sync failed: {e:#}");
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::Mutex;

    async fn memory_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrations::run(&pool).await.unwrap();
        pool
    }

    struct FakeSource {
        millis: Mutex<Option<i64>>,
    }

    impl FakeSource {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                millis: Mutex::new(None),
            })
        }

        fn set(&self, millis: Option<i64>) {
            *self.millis.lock().unwrap() = millis;
        }
    }

    #[async_trait]
    impl TimeSource for FakeSource {
        fn name(&self) -> &str {
            "fake"
        }

        async fn fetch_epoch_millis(&self) -> Result<i64> {
            self.millis
                .lock()
                .unwrap()
                .ok_or_else(|| anyhow!("source down"))
        }
    }

    #[tokio::test]
    async fn first_run_starts_with_zero_offset() {
        let clock = TrustedClock::load(memory_pool().await, vec![], 900)
            .await
            .unwrap();

        assert_eq!(clock.offset_millis(), 0);
        assert!(!clock.tamper_detected());
    }

    #[tokio::test]
    async fn failed_sync_keeps_the_previous_offset() {
        let source = FakeSource::new();
        let clock = TrustedClock::load(
            memory_pool().await,
            vec![source.clone() as Arc<dyn TimeSource>],
            900,
        )
        .await
        .unwrap();

        // Network time runs one minute ahead of the local clock
        source.set(Some(Utc::now().timestamp_millis() + 60_000));
        clock.sync().await.unwrap();
        let offset = clock.offset_millis();
        assert!((offset - 60_000).abs() < 5_000, "offset was {offset}");

        // Both fetches now fail: sync errors but now() stays corrected
        source.set(None);
        assert!(clock.sync().await.is_err());
        assert_eq!(clock.offset_millis(), offset);

        let skew = (clock.now() - Utc::now()).num_milliseconds() - offset;
        assert!(skew.abs() < 1_000);
    }

    #[tokio::test]
    async fn offset_survives_a_restart() {
        let pool = memory_pool().await;
        let source = FakeSource::new();
        source.set(Some(Utc::now().timestamp_millis() - 30_000));

        let clock = TrustedClock::load(
            pool.clone(),
            vec![source.clone() as Arc<dyn TimeSource>],
            900,
        )
        .await
        .unwrap();
        clock.sync().await.unwrap();
        let offset = clock.offset_millis();
        drop(clock);

        let reloaded = TrustedClock::load(pool, vec![], 900).await.unwrap();
        assert_eq!(reloaded.offset_millis(), offset);
        assert!(!reloaded.tamper_detected());
        assert!(reloaded.last_sync().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn corrupt_clock_state_falls_back_to_first_run() {
        let pool = memory_pool().await;
        sqlx::query(
            "INSERT INTO clock_state (id, offset_millis, last_sync_epoch_millis, last_corrected)
             VALUES (1, 99999, 0, 'not-a-timestamp')",
        )
        .execute(&pool)
        .await
        .unwrap();

        let clock = TrustedClock::load(pool, vec![], 900).await.unwrap();
        assert_eq!(clock.offset_millis(), 0);
        assert!(!clock.tamper_detected());
        assert!((clock.now() - Utc::now()).num_seconds().abs() < 2);
    }

    #[tokio::test]
    async fn backwards_clock_jump_raises_the_tamper_flag() {
        let pool = memory_pool().await;

        // Persisted state claims the last corrected time is an hour ahead
        // of where the local clock is now.
        let ahead = Utc::now() + Duration::hours(1);
        sqlx::query(
            "INSERT INTO clock_state (id, offset_millis, last_sync_epoch_millis, last_corrected)
             VALUES (1, 0, ?, ?)",
        )
        .bind(ahead.timestamp_millis())
        .bind(ahead.to_rfc3339())
        .execute(&pool)
        .await
        .unwrap();

        let clock = TrustedClock::load(pool, vec![], 900).await.unwrap();
        assert!(clock.tamper_detected());
        // Operation continues regardless
        assert!((clock.now() - Utc::now()).num_seconds().abs() < 2);
    }
}
