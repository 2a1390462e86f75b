use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::service::Services;

/// Indirect failure surface: a stuck offline store or a growing pending
/// count shows up here rather than as errors in the interactive path.
#[derive(Debug, Serialize)]
pub struct StatusSummary {
    pub record_store_reachable: bool,
    pub pending_changes: i64,
    pub queued_mail: usize,
    pub clock_offset_millis: i64,
    pub clock_tamper_detected: bool,
    pub last_clock_sync: Option<DateTime<Utc>>,
}

impl StatusSummary {
    pub async fn collect(services: &Services) -> Result<Self> {
        Ok(Self {
            record_store_reachable: services.store.is_reachable().await,
            pending_changes: services.engine.queue().count().await?,
            queued_mail: services.outbox.len().await,
            clock_offset_millis: services.clock.offset_millis(),
            clock_tamper_detected: services.clock.tamper_detected(),
            last_clock_sync: services.clock.last_sync().await?,
        })
    }
}
