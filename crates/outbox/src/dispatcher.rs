//! Dispatcher: polls pending records, delivers them and keeps retry bookkeeping.
//!
//! ## State machine
//!
//! `New` → `Retrying` → (`Processed` | `DLQ`)
//!
//! - success: `Processed`, fail count untouched
//! - failure: fail count + 1; `DLQ` once it exceeds `max_retries`, else `Retrying`
//!
//! Delivery failures never escape a cycle; they become status transitions.

use std::thread;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::config::OutboxConfig;
use super::delivery::{deliver, DeliveryClient};
use super::store::{OutboxStore, OutboxStoreError};
use super::types::{
    NotificationId, NotificationType, OutboxRecord, ProcessingStatus, RecordChanges, MAX_RETRIES,
};

/// Dispatcher configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Retries allowed after the first failure
    pub max_retries: u32,
    /// Threads used to work through one cycle's batch
    pub concurrency: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            concurrency: 1,
        }
    }
}

impl From<&OutboxConfig> for DispatcherConfig {
    fn from(config: &OutboxConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            concurrency: config.dispatch_concurrency.max(1),
        }
    }
}

/// A record that crossed the retry threshold and was dead-lettered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExhaustedNotification {
    pub id: NotificationId,
    pub kind: NotificationType,
    pub fail_count: u32,
    pub error: String,
}

/// Per-record dispatch failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error(
        "notification {} ({}) exhausted after {} failed attempts: {}",
        .0.id, .0.kind, .0.fail_count, .0.error
    )]
    NotificationExhausted(ExhaustedNotification),
    #[error(transparent)]
    Store(#[from] OutboxStoreError),
}

/// Outcome of one dispatch cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub retrying: usize,
    pub dead_lettered: usize,
    /// Bookkeeping updates that failed; the record stays pending.
    pub store_errors: usize,
    pub exhausted: Vec<ExhaustedNotification>,
}

impl DispatchSummary {
    fn record(&mut self, outcome: Result<ProcessingStatus, DispatchError>) {
        self.attempted += 1;
        match outcome {
            Ok(ProcessingStatus::Processed) => self.succeeded += 1,
            Ok(_) => self.retrying += 1,
            Err(DispatchError::NotificationExhausted(exhausted)) => {
                self.dead_lettered += 1;
                self.exhausted.push(exhausted);
            }
            Err(DispatchError::Store(_)) => self.store_errors += 1,
        }
    }
}

/// Delivers pending outbox records through an injected client.
pub struct Dispatcher<S, C> {
    store: S,
    client: C,
    config: DispatcherConfig,
}

impl<S, C> Dispatcher<S, C> {
    pub fn new(store: S, client: C) -> Self {
        Self {
            store,
            client,
            config: DispatcherConfig::default(),
        }
    }

    pub fn with_config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.config.max_retries = max_retries;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.config.concurrency = concurrency.max(1);
        self
    }

    pub fn config(&self) -> DispatcherConfig {
        self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn client(&self) -> &C {
        &self.client
    }
}

impl<S: OutboxStore, C: DeliveryClient> Dispatcher<S, C> {
    /// Run one poll-and-process cycle over all `New` and `Retrying` records.
    ///
    /// Only a failure of the initial query is returned as an error.
    pub fn run_cycle(&self) -> Result<DispatchSummary, OutboxStoreError> {
        let records = self.store.query_by_status(&ProcessingStatus::PENDING)?;
        if records.is_empty() {
            debug!("no pending notifications");
            return Ok(DispatchSummary::default());
        }

        let outcomes = if self.config.concurrency <= 1 || records.len() == 1 {
            records.iter().map(|r| self.dispatch_record(r)).collect()
        } else {
            self.dispatch_parallel(&records)
        };

        let mut summary = DispatchSummary::default();
        for outcome in outcomes {
            summary.record(outcome);
        }

        info!(
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            retrying = summary.retrying,
            dead_lettered = summary.dead_lettered,
            store_errors = summary.store_errors,
            "dispatch cycle finished"
        );
        Ok(summary)
    }

    /// Deliver a single record and persist the resulting transition.
    ///
    /// Returns the new status, or `NotificationExhausted` when the record was
    /// moved to `DLQ`.
    pub fn dispatch_record(&self, record: &OutboxRecord) -> Result<ProcessingStatus, DispatchError> {
        if record.processing_status.is_terminal() {
            return Ok(record.processing_status);
        }

        match deliver(&self.client, record) {
            Ok(()) => {
                self.store
                    .update(&record.id, &RecordChanges::processed())
                    .inspect_err(|e| {
                        error!(notification_id = %record.id, error = %e, "failed to mark notification processed")
                    })?;
                debug!(notification_id = %record.id, kind = %record.kind, "notification delivered");
                Ok(ProcessingStatus::Processed)
            }
            Err(delivery_error) => {
                let fail_count = record.processing_fail_count.saturating_add(1);
                let message = delivery_error.to_string();

                if fail_count > self.config.max_retries {
                    self.store
                        .update(
                            &record.id,
                            &RecordChanges::failed(ProcessingStatus::Dlq, fail_count, &message),
                        )
                        .inspect_err(|e| {
                            error!(notification_id = %record.id, error = %e, "failed to dead-letter notification")
                        })?;

                    let exhausted = ExhaustedNotification {
                        id: record.id.clone(),
                        kind: record.kind,
                        fail_count,
                        error: message,
                    };
                    let err = DispatchError::NotificationExhausted(exhausted);
                    error!(notification_id = %record.id, kind = %record.kind, fail_count, "{err}");
                    Err(err)
                } else {
                    self.store
                        .update(
                            &record.id,
                            &RecordChanges::failed(ProcessingStatus::Retrying, fail_count, &message),
                        )
                        .inspect_err(|e| {
                            error!(notification_id = %record.id, error = %e, "failed to record delivery failure")
                        })?;
                    warn!(
                        notification_id = %record.id,
                        kind = %record.kind,
                        fail_count,
                        error = %message,
                        "delivery failed; will retry"
                    );
                    Ok(ProcessingStatus::Retrying)
                }
            }
        }
    }

    /// Each record's update only touches its own id, so chunks run independently.
    fn dispatch_parallel(
        &self,
        records: &[OutboxRecord],
    ) -> Vec<Result<ProcessingStatus, DispatchError>> {
        let chunk_size = records.len().div_ceil(self.config.concurrency);

        thread::scope(|scope| {
            let handles: Vec<_> = records
                .chunks(chunk_size)
                .map(|chunk| {
                    scope.spawn(move || {
                        chunk
                            .iter()
                            .map(|r| self.dispatch_record(r))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();

            handles
                .into_iter()
                .flat_map(|handle| match handle.join() {
                    Ok(outcomes) => outcomes,
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .collect()
        })
    }
}
