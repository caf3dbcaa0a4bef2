//! Notification outbox with retry, dead-lettering and retention cleanup.
//!
//! ## Design
//!
//! - Producers enqueue one durable record per domain event
//! - A dispatcher delivers `NEW`/`RETRYING` records to the external system
//! - Failed deliveries are retried up to `max_retries`, then dead-lettered
//! - A garbage collector deletes old `PROCESSED` records
//! - Delivery is at-least-once; the store is the only shared state
//!
//! ## Components
//!
//! - `OutboxRecord`: the persisted notification and its bookkeeping
//! - `OutboxStore`: status-indexed persistence (in-memory or Postgres)
//! - `Enqueuer`: domain event → outbox record
//! - `Dispatcher`: poll, deliver, retry/DLQ
//! - `GarbageCollector`: retention cleanup
//! - `Scheduler`: interval-driven background cycles

pub mod config;
pub mod delivery;
pub mod dispatcher;
pub mod enqueue;
pub mod gc;
pub mod postgres;
pub mod scheduler;
pub mod store;
pub mod types;

pub use config::{ConfigError, OutboxConfig};
pub use delivery::{
    deliver, handler_for, DeliveryClient, DeliveryError, DeliveryFn, LogDeliveryClient,
    Reauthorizing,
};
pub use dispatcher::{
    DispatchError, DispatchSummary, Dispatcher, DispatcherConfig, ExhaustedNotification,
};
pub use enqueue::{EnqueueError, Enqueuer};
pub use gc::GarbageCollector;
pub use postgres::PostgresOutboxStore;
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerHandle, SchedulerStats};
pub use store::{InMemoryOutboxStore, OutboxStore, OutboxStoreError};
pub use types::{
    NotificationId, NotificationType, OutboxRecord, OutboxStats, ProcessingStatus, RecordChanges,
    MAX_RETRIES,
};
