//! Interval-driven background runner for dispatch and garbage collection cycles.
//!
//! Each cycle is a stateless run-to-completion batch; the scheduler only decides
//! when to trigger them. A cycle that fails is logged and retried at the next tick.

use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{error, info};

use super::config::OutboxConfig;
use super::delivery::DeliveryClient;
use super::dispatcher::Dispatcher;
use super::gc::GarbageCollector;
use super::store::OutboxStore;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub dispatch_interval: Duration,
    pub gc_interval: Duration,
    /// Thread name, also used in logs
    pub name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            dispatch_interval: Duration::from_secs(60),
            gc_interval: Duration::from_secs(3600),
            name: "herald-scheduler".to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl From<&OutboxConfig> for SchedulerConfig {
    fn from(config: &OutboxConfig) -> Self {
        Self {
            dispatch_interval: config.dispatch_interval(),
            gc_interval: config.gc_interval(),
            ..Default::default()
        }
    }
}

/// Scheduler runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub dispatch_cycles: u64,
    pub gc_cycles: u64,
    pub failed_cycles: u64,
    pub delivered: u64,
    pub dead_lettered: u64,
    pub collected: u64,
}

/// Handle to control a running scheduler.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<SchedulerStats>>,
}

impl SchedulerHandle {
    /// Request graceful shutdown and wait for the in-flight cycle to finish.
    pub fn shutdown(mut self) -> SchedulerStats {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
        self.stats()
    }

    /// Get current scheduler statistics.
    pub fn stats(&self) -> SchedulerStats {
        lock(&self.stats).clone()
    }
}

/// Runs dispatch and garbage collection cycles on a background thread.
pub struct Scheduler<S, C, G> {
    dispatcher: Dispatcher<S, C>,
    collector: GarbageCollector<G>,
}

impl<S, C, G> Scheduler<S, C, G>
where
    S: OutboxStore + 'static,
    C: DeliveryClient + 'static,
    G: OutboxStore + 'static,
{
    pub fn new(dispatcher: Dispatcher<S, C>, collector: GarbageCollector<G>) -> Self {
        Self {
            dispatcher,
            collector,
        }
    }

    /// Spawn the scheduler thread. The first dispatch cycle runs immediately.
    pub fn spawn(self, config: SchedulerConfig) -> std::io::Result<SchedulerHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(SchedulerStats::default()));
        let stats_clone = stats.clone();

        let join = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || scheduler_loop(self, config, shutdown_rx, stats_clone))?;

        Ok(SchedulerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }

    fn dispatch(&self, stats: &Mutex<SchedulerStats>) {
        let result = self.dispatcher.run_cycle();
        let mut s = lock(stats);
        s.dispatch_cycles += 1;
        match result {
            Ok(summary) => {
                s.delivered += summary.succeeded as u64;
                s.dead_lettered += summary.dead_lettered as u64;
            }
            Err(e) => {
                s.failed_cycles += 1;
                error!(error = %e, "dispatch cycle failed");
            }
        }
    }

    fn collect(&self, stats: &Mutex<SchedulerStats>) {
        let result = self.collector.run_cycle();
        let mut s = lock(stats);
        s.gc_cycles += 1;
        match result {
            Ok(deleted) => s.collected += deleted.len() as u64,
            Err(e) => {
                s.failed_cycles += 1;
                error!(error = %e, "garbage collection cycle failed");
            }
        }
    }
}

fn scheduler_loop<S, C, G>(
    scheduler: Scheduler<S, C, G>,
    config: SchedulerConfig,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<SchedulerStats>>,
) where
    S: OutboxStore + 'static,
    C: DeliveryClient + 'static,
    G: OutboxStore + 'static,
{
    info!(scheduler = %config.name, "scheduler started");

    let start = Instant::now();
    let mut next_dispatch = start;
    let mut next_gc = start + config.gc_interval;

    loop {
        let now = Instant::now();
        if now >= next_dispatch {
            scheduler.dispatch(&stats);
            next_dispatch = Instant::now() + config.dispatch_interval;
        }
        if now >= next_gc {
            scheduler.collect(&stats);
            next_gc = Instant::now() + config.gc_interval;
        }

        let wait = next_dispatch
            .min(next_gc)
            .saturating_duration_since(Instant::now());
        match shutdown_rx.recv_timeout(wait) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }
    }

    info!(scheduler = %config.name, "scheduler stopped");
}

fn lock(stats: &Mutex<SchedulerStats>) -> MutexGuard<'_, SchedulerStats> {
    stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
