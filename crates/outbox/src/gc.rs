//! Retention-based cleanup of settled notifications.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info};

use super::config::OutboxConfig;
use super::store::{OutboxStore, OutboxStoreError};
use super::types::{OutboxRecord, ProcessingStatus};

/// Default retention for processed notifications.
pub const DEFAULT_RETENTION_DAYS: i64 = 7;

/// Deletes `Processed` records older than the retention window.
///
/// `DLQ` records and transactional emails are never collected.
pub struct GarbageCollector<S> {
    store: S,
    retention: Duration,
}

impl<S: OutboxStore> GarbageCollector<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            retention: Duration::days(DEFAULT_RETENTION_DAYS),
        }
    }

    pub fn from_config(store: S, config: &OutboxConfig) -> Self {
        Self::new(store).with_retention(config.retention())
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run one collection cycle against the current time.
    pub fn run_cycle(&self) -> Result<Vec<OutboxRecord>, OutboxStoreError> {
        self.run_cycle_at(Utc::now())
    }

    /// Run one collection cycle as of `now`; returns the deleted records.
    ///
    /// A failed delete is logged and skipped.
    pub fn run_cycle_at(&self, now: DateTime<Utc>) -> Result<Vec<OutboxRecord>, OutboxStoreError> {
        let candidates = self.store.query_by_status_older_than(
            ProcessingStatus::Processed,
            self.retention,
            now,
        )?;

        let mut deleted = Vec::new();
        for record in candidates.into_iter().filter(|r| r.kind.is_collectable()) {
            match self.store.delete(&record.id) {
                Ok(()) => {
                    debug!(notification_id = %record.id, kind = %record.kind, "collected notification");
                    deleted.push(record);
                }
                Err(e) => {
                    error!(notification_id = %record.id, error = %e, "failed to delete notification");
                }
            }
        }

        info!(deleted = deleted.len(), "garbage collection cycle finished");
        Ok(deleted)
    }
}
