use anyhow::{Context, Result};
use sqlx::migrate::MigrateDatabase;
use sqlx::sqlite::{Sqlite, SqlitePool, SqlitePoolOptions};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{error, info, warn};

use crate::clock::{self, HttpTimeSource, TrustedClock};
use crate::config::ServiceConfig;
use crate::mailer::MailDispatcher;
use crate::migrations;
use crate::queue::{Outbox, PendingQueue};
use crate::reminder::ReminderScheduler;
use crate::store::{
    EventSource, MailTransport, RecordStore, SqliteEventSource, SqliteRecordStore,
};
use crate::sync::{ConnectivityMonitor, SyncEngine};

/// All long-lived services, wired once at startup and passed by handle.
pub struct Services {
    pub pool: SqlitePool,
    pub store: Arc<dyn RecordStore>,
    pub clock: Arc<TrustedClock>,
    pub outbox: Arc<Outbox>,
    pub engine: Arc<SyncEngine>,
    pub monitor: Arc<ConnectivityMonitor>,
    pub dispatcher: Arc<MailDispatcher>,
    pub reminders: Arc<ReminderScheduler>,
}

impl Services {
    /// Build the full service graph with no mail transport configured; the
    /// dispatcher stays a no-op until one is provided.
    pub async fn build(config: &ServiceConfig) -> Result<Self> {
        Self::build_with_transport(config, None).await
    }

    pub async fn build_with_transport(
        config: &ServiceConfig,
        transport: Option<Arc<dyn MailTransport>>,
    ) -> Result<Self> {
        if !Sqlite::database_exists(&config.database_url)
            .await
            .unwrap_or(false)
        {
            Sqlite::create_database(&config.database_url)
                .await
                .with_context(|| format!("failed to create database {}", config.database_url))?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&config.database_url)
            .await
            .with_context(|| format!("failed to open database {}", config.database_url))?;

        migrations::run(&pool).await?;

        let clock = Arc::new(
            TrustedClock::load(
                pool.clone(),
                HttpTimeSource::defaults()?,
                config.clock_tamper_threshold_secs,
            )
            .await?,
        );
        if clock.tamper_detected() {
            warn!("possible local clock manipulation detected at startup");
        }

        let store: Arc<dyn RecordStore> = Arc::new(SqliteRecordStore::new(pool.clone()));
        let events: Arc<dyn EventSource> = Arc::new(SqliteEventSource::new(pool.clone()));
        let outbox = Arc::new(Outbox::load(&config.outbox_path));

        let engine = Arc::new(SyncEngine::new(
            store.clone(),
            PendingQueue::new(pool.clone()),
        ));
        let monitor = Arc::new(ConnectivityMonitor::new(store.clone(), engine.clone(), config));
        let dispatcher = Arc::new(MailDispatcher::new(outbox.clone(), transport));
        let reminders = Arc::new(ReminderScheduler::new(
            clock.clone(),
            events,
            outbox.clone(),
            config.reminder_lookahead_hours,
        ));

        Ok(Self {
            pool,
            store,
            clock,
            outbox,
            engine,
            monitor,
            dispatcher,
            reminders,
        })
    }
}

/// Handle for the four periodic background actors.
pub struct ServiceDaemon {
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<Result<()>>>,
}

impl ServiceDaemon {
    /// Spawn the clock sync, connectivity monitor, mail dispatcher and
    /// reminder scheduler as independent scheduled tasks.
    pub fn start(services: &Services, config: &ServiceConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let mut tasks = Vec::new();

        {
            let clock = services.clock.clone();
            let shutdown_rx = shutdown_tx.subscribe();
            let interval_secs = config.clock_sync_interval_secs;

            tasks.push(tokio::spawn(async move {
                clock::sync_worker(clock, shutdown_rx, interval_secs).await
            }));
        }

        {
            let monitor = services.monitor.clone();
            let shutdown_rx = shutdown_tx.subscribe();

            tasks.push(tokio::spawn(async move { monitor.run(shutdown_rx).await }));
        }

        {
            let dispatcher = services.dispatcher.clone();
            let shutdown_rx = shutdown_tx.subscribe();
            let interval_secs = config.mail_dispatch_interval_secs;

            tasks.push(tokio::spawn(async move {
                dispatcher.run(shutdown_rx, interval_secs).await
            }));
        }

        {
            let reminders = services.reminders.clone();
            let shutdown_rx = shutdown_tx.subscribe();
            let interval_secs = config.reminder_interval_secs;

            tasks.push(tokio::spawn(async move {
                reminders.run(shutdown_rx, interval_secs).await
            }));
        }

        info!("service daemon started ({} background tasks)", tasks.len());
        Self { shutdown_tx, tasks }
    }

    /// Cooperative shutdown: signal every task, then wait a bounded time
    /// for in-flight work to finish.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(());

        let results = tokio::time::timeout(
            Duration::from_secs(5),
            futures::future::join_all(self.tasks),
        )
        .await;

        match results {
            Ok(results) => {
                for result in results {
                    match result {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!("task finished with error during shutdown: {e:#}"),
                        Err(e) => error!("task panicked during shutdown: {e:?}"),
                    }
                }
            }
            Err(_) => {
                warn!("shutdown timeout exceeded, some tasks may not have completed");
            }
        }

        Ok(())
    }
}
