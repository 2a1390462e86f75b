use std::path::PathBuf;

/// Configuration for the background service daemon
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub database_url: String,
    pub outbox_path: PathBuf,

    /// How often the trusted clock re-syncs against network time
    pub clock_sync_interval_secs: u64,
    /// Unexplained drift beyond this raises the tamper flag
    pub clock_tamper_threshold_secs: i64,

    /// Reachability poll interval while pending changes are queued
    pub busy_poll_secs: u64,
    /// Reachability poll interval while the queue is empty
    pub idle_poll_secs: u64,
    /// Consecutive failures before the monitor backs off exponentially
    pub failure_threshold: u32,
    /// Upper bound on the backoff delay
    pub cooldown_cap_secs: u64,

    pub mail_dispatch_interval_secs: u64,
    pub reminder_interval_secs: u64,
    pub reminder_lookahead_hours: i64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:waypost.db".to_string(),
            outbox_path: PathBuf::from("waypost-outbox.json"),
            clock_sync_interval_secs: 3600,
            clock_tamper_threshold_secs: 900,
            busy_poll_secs: 10,
            idle_poll_secs: 45,
            failure_threshold: 3,
            cooldown_cap_secs: 300,
            mail_dispatch_interval_secs: 300,
            reminder_interval_secs: 300,
            reminder_lookahead_hours: 48,
        }
    }
}
