mod engine;
mod monitor;

pub use engine::{DrainReport, SyncEngine};
pub use monitor::{Connectivity, ConnectivityMonitor, ConnectivitySnapshot};
