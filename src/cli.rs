use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "waypost")]
#[command(about = "Offline-resilient sync core for calendar data", long_about = None)]
pub struct Cli {
    /// Local database holding the pending-change queue and clock state
    #[arg(long, default_value = "sqlite:waypost.db")]
    pub database_url: String,

    /// Snapshot file for the outbound-email queue
    #[arg(long, default_value = "waypost-outbox.json")]
    pub outbox_path: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the background service daemon until interrupted
    Run,

    /// Print a status summary of queues, connectivity and the trusted clock
    Status,

    /// Trigger one immediate drain of the pending-change queue
    SyncNow,
}
