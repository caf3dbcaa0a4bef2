//! Worker commands, executed against any outbox store.

use anyhow::Context;
use serde_json::{json, Value as JsonValue};
use tracing::{info, warn};

use herald_outbox::{
    DeliveryClient, Dispatcher, DispatcherConfig, GarbageCollector, OutboxConfig, OutboxStore,
    ProcessingStatus, Scheduler, SchedulerConfig,
};

/// A resolved worker command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Dispatch,
    Gc,
    Run,
    Stats,
    Dlq { limit: Option<usize> },
}

impl Command {
    /// Whether the command hands records to the delivery client and settles them.
    pub fn delivers(&self) -> bool {
        matches!(self, Command::Dispatch | Command::Run)
    }
}

/// Execute `command` and return its JSON summary.
///
/// `wait_for_shutdown` blocks until the long-running `run` command should stop.
pub fn execute<S, C, W>(
    store: S,
    client: C,
    config: &OutboxConfig,
    command: Command,
    wait_for_shutdown: W,
) -> anyhow::Result<JsonValue>
where
    S: OutboxStore + Clone + 'static,
    C: DeliveryClient + 'static,
    W: FnOnce() -> anyhow::Result<()>,
{
    match command {
        Command::Dispatch => {
            let dispatcher =
                Dispatcher::new(store, client).with_config(DispatcherConfig::from(config));
            let summary = dispatcher.run_cycle().context("dispatch cycle failed")?;
            if summary.dead_lettered > 0 {
                warn!(
                    dead_lettered = summary.dead_lettered,
                    "notifications moved to DLQ"
                );
            }
            Ok(serde_json::to_value(summary)?)
        }
        Command::Gc => {
            let collector = GarbageCollector::from_config(store, config);
            let deleted = collector
                .run_cycle()
                .context("garbage collection cycle failed")?;
            let ids: Vec<&str> = deleted.iter().map(|r| r.id.as_str()).collect();
            Ok(json!({
                "retention_days": config.retention_days,
                "deleted": deleted.len(),
                "ids": ids,
            }))
        }
        Command::Run => {
            let scheduler = Scheduler::new(
                Dispatcher::new(store.clone(), client).with_config(DispatcherConfig::from(config)),
                GarbageCollector::from_config(store, config),
            );
            let handle = scheduler
                .spawn(SchedulerConfig::from(config))
                .context("failed to spawn scheduler thread")?;
            info!(
                dispatch_interval_secs = config.dispatch_interval_secs,
                gc_interval_secs = config.gc_interval_secs,
                "worker running; press Ctrl-C to stop"
            );

            let waited = wait_for_shutdown();
            let stats = handle.shutdown();
            waited?;
            info!(
                dispatch_cycles = stats.dispatch_cycles,
                gc_cycles = stats.gc_cycles,
                "worker stopped"
            );
            Ok(serde_json::to_value(stats)?)
        }
        Command::Stats => {
            let stats = store.count_by_status().context("failed to count records")?;
            Ok(json!({
                "NEW": stats.new,
                "RETRYING": stats.retrying,
                "PROCESSED": stats.processed,
                "DLQ": stats.dlq,
                "total": stats.total(),
            }))
        }
        Command::Dlq { limit } => {
            let mut records = store
                .query_by_status(&[ProcessingStatus::Dlq])
                .context("failed to query DLQ")?;
            if let Some(limit) = limit {
                records.truncate(limit);
            }
            Ok(serde_json::to_value(records)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use chrono::Utc;
    use herald_outbox::{
        InMemoryOutboxStore, LogDeliveryClient, NotificationId, NotificationType, OutboxRecord,
    };

    fn seed(store: &InMemoryOutboxStore, id: &str, status: ProcessingStatus, age_days: i64) {
        let mut record = OutboxRecord::new(
            NotificationId::new(id),
            NotificationType::UserRegistration,
            "grace@example.org",
            json!({"email": "grace@example.org"}),
        );
        record.processing_status = status;
        record.modified = Utc::now() - chrono::Duration::days(age_days);
        store.put(record, false).unwrap();
    }

    #[test]
    fn only_dispatch_and_run_deliver() {
        assert!(Command::Dispatch.delivers());
        assert!(Command::Run.delivers());
        assert!(!Command::Gc.delivers());
        assert!(!Command::Stats.delivers());
        assert!(!Command::Dlq { limit: None }.delivers());
    }

    fn no_wait() -> anyhow::Result<()> {
        Ok(())
    }

    #[test]
    fn dispatch_reports_summary() {
        let store = InMemoryOutboxStore::arc();
        seed(&store, "a", ProcessingStatus::New, 0);
        seed(&store, "b", ProcessingStatus::Retrying, 0);
        let buffer = Arc::new(Mutex::new(Vec::new()));

        let output = execute(
            store.clone(),
            LogDeliveryClient::with_buffer(buffer.clone()),
            &OutboxConfig::default(),
            Command::Dispatch,
            no_wait,
        )
        .unwrap();

        assert_eq!(output["attempted"], 2);
        assert_eq!(output["succeeded"], 2);
        assert_eq!(buffer.lock().unwrap().len(), 2);
    }

    #[test]
    fn gc_honors_configured_retention() {
        let store = InMemoryOutboxStore::arc();
        seed(&store, "old", ProcessingStatus::Processed, 10);
        seed(&store, "recent", ProcessingStatus::Processed, 3);
        let config = OutboxConfig {
            retention_days: 2,
            ..Default::default()
        };

        let output = execute(
            store.clone(),
            LogDeliveryClient::new(),
            &config,
            Command::Gc,
            no_wait,
        )
        .unwrap();

        assert_eq!(output["deleted"], 2);
        assert_eq!(store.count_by_status().unwrap().total(), 0);
    }

    #[test]
    fn stats_and_dlq_listing() {
        let store = InMemoryOutboxStore::arc();
        seed(&store, "n", ProcessingStatus::New, 0);
        seed(&store, "d1", ProcessingStatus::Dlq, 1);
        seed(&store, "d2", ProcessingStatus::Dlq, 2);

        let stats = execute(
            store.clone(),
            LogDeliveryClient::new(),
            &OutboxConfig::default(),
            Command::Stats,
            no_wait,
        )
        .unwrap();
        assert_eq!(stats["NEW"], 1);
        assert_eq!(stats["DLQ"], 2);
        assert_eq!(stats["total"], 3);

        let dlq = execute(
            store,
            LogDeliveryClient::new(),
            &OutboxConfig::default(),
            Command::Dlq { limit: Some(1) },
            no_wait,
        )
        .unwrap();
        assert_eq!(dlq.as_array().unwrap().len(), 1);
        assert_eq!(dlq[0]["processing_status"], "DLQ");
    }

    #[test]
    fn run_stops_when_shutdown_returns() {
        let store = InMemoryOutboxStore::arc();
        seed(&store, "a", ProcessingStatus::New, 0);

        let output = execute(
            store.clone(),
            LogDeliveryClient::with_buffer(Arc::new(Mutex::new(Vec::new()))),
            &OutboxConfig::default(),
            Command::Run,
            || {
                std::thread::sleep(Duration::from_millis(200));
                Ok(())
            },
        )
        .unwrap();

        assert!(output["dispatch_cycles"].as_u64().unwrap() >= 1);
        let record = store.get(&NotificationId::new("a")).unwrap().unwrap();
        assert_eq!(record.processing_status, ProcessingStatus::Processed);
    }
}
