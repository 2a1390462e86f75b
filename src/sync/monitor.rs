use anyhow::Result;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::time::{Duration, sleep};
use tracing::{info, warn};

use super::{DrainReport, SyncEngine};
use crate::config::ServiceConfig;
use crate::store::RecordStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Connectivity {
    Online,
    Offline,
}

/// Point-in-time view of the monitor, for status reporting.
#[derive(Clone, Debug, Serialize)]
pub struct ConnectivitySnapshot {
    pub connectivity: Connectivity,
    pub reason: String,
    pub consecutive_failures: u32,
}

struct MonitorState {
    connectivity: Connectivity,
    reason: String,
    consecutive_failures: u32,
    // Distinguishes the OFFLINE to ONLINE edge from steady ONLINE
    was_offline: bool,
}

/// Drives the ONLINE/OFFLINE state machine off reachability probes and
/// triggers queue drains on the way back online.
///
/// Polling is load-adaptive: short interval while changes are queued, longer
/// when idle, stretched exponentially after repeated failures.
pub struct ConnectivityMonitor {
    store: Arc<dyn RecordStore>,
    engine: Arc<SyncEngine>,
    state: Mutex<MonitorState>,
    busy_poll: Duration,
    idle_poll: Duration,
    failure_threshold: u32,
    cooldown_cap: Duration,
}

impl ConnectivityMonitor {
    pub fn new(
        store: Arc<dyn RecordStore>,
        engine: Arc<SyncEngine>,
        config: &ServiceConfig,
    ) -> Self {
        Self {
            store,
            engine,
            state: Mutex::new(MonitorState {
                connectivity: Connectivity::Offline,
                reason: "not yet probed".to_string(),
                consecutive_failures: 0,
                was_offline: true,
            }),
            busy_poll: Duration::from_secs(config.busy_poll_secs),
            idle_poll: Duration::from_secs(config.idle_poll_secs),
            failure_threshold: config.failure_threshold,
            cooldown_cap: Duration::from_secs(config.cooldown_cap_secs),
        }
    }

    pub fn snapshot(&self) -> ConnectivitySnapshot {
        let state = self.state.lock().unwrap();
        ConnectivitySnapshot {
            connectivity: state.connectivity,
            reason: state.reason.clone(),
            consecutive_failures: state.consecutive_failures,
        }
    }

    /// One probe step of the state machine. Returns the drain report when
    /// this step ran a drain (on the offline-to-online edge, or while online
    /// with queued work).
    pub async fn poll_once(&self) -> Result<Option<DrainReport>> {
        let connectivity = self.state.lock().unwrap().connectivity;

        match connectivity {
            Connectivity::Offline => {
                if self.store.is_reachable().await {
                    self.mark_online("record store reachable");
                    self.drain_tracked().await
                } else {
                    self.record_failure("record store unreachable");
                    Ok(None)
                }
            }
            Connectivity::Online => {
                if !self.store.health_check().await {
                    // Silent connectivity loss: force the transition, no drain
                    self.mark_offline("health check failed while online");
                    Ok(None)
                } else if self.engine.queue().count().await? > 0 {
                    // Still online but work piled up, reconcile opportunistically
                    self.drain_tracked().await
                } else {
                    self.clear_failures();
                    Ok(None)
                }
            }
        }
    }

    async fn drain_tracked(&self) -> Result<Option<DrainReport>> {
        match self.engine.drain().await {
            Ok(report) => {
                self.clear_failures();
                Ok(report)
            }
            Err(e) => {
                self.record_failure("drain failed");
                Err(e)
            }
        }
    }

    fn mark_online(&self, reason: &str) {
        let mut state = self.state.lock().unwrap();
        if state.was_offline {
            info!("connectivity restored: {reason}");
        }
        state.connectivity = Connectivity::Online;
        state.reason = reason.to_string();
        state.consecutive_failures = 0;
        state.was_offline = false;
    }

    fn mark_offline(&self, reason: &str) {
        let mut state = self.state.lock().unwrap();
        warn!("going offline: {reason}");
        state.connectivity = Connectivity::Offline;
        state.reason = reason.to_string();
        state.consecutive_failures += 1;
        state.was_offline = true;
    }

    fn record_failure(&self, reason: &str) {
        let mut state = self.state.lock().unwrap();
        state.reason = reason.to_string();
        state.consecutive_failures += 1;
    }

    fn clear_failures(&self) {
        self.state.lock().unwrap().consecutive_failures = 0;
    }

    /// Delay until the next probe: short while work is pending, longer when
    /// idle, doubling past the failure threshold up to the cap.
    pub fn poll_delay(&self, work_pending: bool) -> Duration {
        let failures = self.state.lock().unwrap().consecutive_failures;
        let base = if work_pending {
            self.busy_poll
        } else {
            self.idle_poll
        };

        if failures <= self.failure_threshold {
            return base;
        }
        let doublings = (failures - self.failure_threshold).min(6);
        (base * 2u32.pow(doublings)).min(self.cooldown_cap)
    }

    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("connectivity monitor started");

        loop {
            if let Err(e) = self.poll_once().await {
                warn!("connectivity poll failed: {e:#}");
            }

            let work_pending = self.engine.queue().count().await.unwrap_or(0) > 0;
            let delay = self.poll_delay(work_pending);

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    break;
                }
                _ = sleep(delay) => {}
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations;
    use crate::queue::PendingQueue;
    use crate::store::{Operation, Payload};
    use async_trait::async_trait;
    use sqlx::SqlitePool;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    async fn memory_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrations::run(&pool).await.unwrap();
        pool
    }

    struct SwitchableStore {
        reachable: AtomicBool,
        healthy: AtomicBool,
        applies: AtomicUsize,
    }

    impl SwitchableStore {
        fn new(up: bool) -> Arc<Self> {
            Arc::new(Self {
                reachable: AtomicBool::new(up),
                healthy: AtomicBool::new(up),
                applies: AtomicUsize::new(0),
            })
        }

        fn set_up(&self, up: bool) {
            self.reachable.store(up, Ordering::SeqCst);
            self.healthy.store(up, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl RecordStore for SwitchableStore {
        async fn is_reachable(&self) -> bool {
            self.reachable.load(Ordering::SeqCst)
        }

        async fn health_check(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }

        async fn apply(
            &self,
            _op: Operation,
            _table: &str,
            _record_id: &str,
            _payload: &Payload,
        ) -> Result<()> {
            self.applies.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn monitor(store: Arc<SwitchableStore>, pool: SqlitePool) -> ConnectivityMonitor {
        let engine = Arc::new(SyncEngine::new(
            store.clone() as Arc<dyn RecordStore>,
            PendingQueue::new(pool),
        ));
        ConnectivityMonitor::new(store, engine, &ServiceConfig::default())
    }

    #[tokio::test]
    async fn visits_online_offline_online_with_one_drain_per_edge() {
        let store = SwitchableStore::new(true);
        let monitor = monitor(store.clone(), memory_pool().await);

        assert_eq!(monitor.snapshot().connectivity, Connectivity::Offline);

        // First probe: store reachable, edge to ONLINE drains once
        let drained = monitor.poll_once().await.unwrap();
        assert!(drained.is_some());
        assert_eq!(monitor.snapshot().connectivity, Connectivity::Online);

        // Silent loss: health check fails while nominally online
        store.set_up(false);
        assert!(monitor.poll_once().await.unwrap().is_none());
        let snap = monitor.snapshot();
        assert_eq!(snap.connectivity, Connectivity::Offline);
        assert!(snap.reason.contains("health check"));

        // Still down: steady OFFLINE, failures accumulate, no drain
        assert!(monitor.poll_once().await.unwrap().is_none());
        assert!(monitor.snapshot().consecutive_failures >= 2);

        // Back up: exactly one drain on the final transition
        store.set_up(true);
        let drained = monitor.poll_once().await.unwrap();
        assert!(drained.is_some());
        assert_eq!(monitor.snapshot().connectivity, Connectivity::Online);
        assert_eq!(monitor.snapshot().consecutive_failures, 0);

        // Steady ONLINE with an empty queue does not drain again
        assert!(monitor.poll_once().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn opportunistic_drain_while_online_with_queued_work() {
        let store = SwitchableStore::new(true);
        let pool = memory_pool().await;
        let monitor = monitor(store.clone(), pool);

        monitor.poll_once().await.unwrap(); // now ONLINE

        monitor
            .engine
            .queue()
            .enqueue("events", "E9", Operation::Update, &Payload::new())
            .await
            .unwrap();

        let report = monitor.poll_once().await.unwrap().unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(store.applies.load(Ordering::SeqCst), 1);
        assert_eq!(monitor.engine.queue().count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn repeated_failures_stretch_the_poll_delay_up_to_the_cap() {
        let store = SwitchableStore::new(false);
        let monitor = monitor(store.clone(), memory_pool().await);
        let config = ServiceConfig::default();

        assert_eq!(
            monitor.poll_delay(false),
            Duration::from_secs(config.idle_poll_secs)
        );
        assert_eq!(
            monitor.poll_delay(true),
            Duration::from_secs(config.busy_poll_secs)
        );

        for _ in 0..config.failure_threshold + 2 {
            monitor.poll_once().await.unwrap();
        }
        let backed_off = monitor.poll_delay(true);
        assert!(backed_off > Duration::from_secs(config.busy_poll_secs));

        for _ in 0..20 {
            monitor.poll_once().await.unwrap();
        }
        assert_eq!(
            monitor.poll_delay(false),
            Duration::from_secs(config.cooldown_cap_secs)
        );
    }
}
