pub mod cli;
pub mod clock;
pub mod config;
pub mod mailer;
pub mod migrations;
pub mod queue;
pub mod reminder;
pub mod service;
pub mod status;
pub mod store;
pub mod sync;

pub use config::ServiceConfig;
pub use service::{ServiceDaemon, Services};
