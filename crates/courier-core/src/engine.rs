//! Worker-pool scheduler for subscription delivery.
//!
//! The engine receives "this subscription has work" signals, keeps them in a
//! FIFO queue and runs a bounded pool of long-lived worker loops that drain
//! it. A worker is added only when every existing worker is busy, and idle
//! workers beyond `max_idle_workers` retire, so the pool follows load without
//! spawning a task per message.
//!
//! ```text
//!  publish ──▶ schedule ──▶ ┌───────────┐ ──▶ worker ──▶ Subscription::work
//!                           │ FIFO queue│ ──▶ worker ──▶ Subscription::work
//!  sweep timer ──▶ schedule │           │ ──▶ ...
//!                           └───────────┘
//! ```
//!
//! A periodic sweep re-schedules every subscription on every topic so that a
//! lost signal or a faulted worker cannot strand pending messages.

use crate::counters::{Counter, Counters};
use crate::error::BusError;
use crate::subscription::Subscription;
use crate::topic::Topic;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace};

/// Default interval between liveness sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Topics shared between the bus and the engine.
pub type TopicMap = DashMap<String, Arc<Topic>>;

fn parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on concurrently alive workers.
    pub max_workers: usize,
    /// Idle workers tolerated before extras retire.
    pub max_idle_workers: usize,
    /// Interval between liveness sweeps.
    pub sweep_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let cores = parallelism();
        Self {
            max_workers: 3 * cores,
            max_idle_workers: cores,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

struct Shared {
    config: EngineConfig,
    topics: Arc<TopicMap>,
    queue: Mutex<VecDeque<Arc<Subscription>>>,
    notify: Notify,
    allocated: AtomicUsize,
    busy: AtomicUsize,
    sweeping: AtomicBool,
    shut_down: AtomicBool,
    counters: Counters,
    runtime: Handle,
}

/// Releases a worker slot when a pump exits, however it exits.
struct WorkerSlot(Arc<Shared>);

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        let shared = &self.0;
        let allocated = shared.allocated.fetch_sub(1, Ordering::AcqRel) - 1;
        shared
            .counters
            .set_raw(Counter::WorkersAllocated, allocated as u64);
        debug!(allocated, "Worker exited");

        // A retiring worker may race with a schedule that saw it as idle.
        if !shared.is_shut_down() && !shared.queue.lock().is_empty() {
            shared.add_worker();
        }
    }
}

/// Marks a worker busy for the duration of one `work()` call.
struct BusyGuard<'a> {
    shared: &'a Shared,
    subscription: &'a Subscription,
}

impl<'a> BusyGuard<'a> {
    fn new(shared: &'a Shared, subscription: &'a Subscription) -> Self {
        let busy = shared.busy.fetch_add(1, Ordering::AcqRel) + 1;
        shared.counters.set_raw(Counter::WorkersBusy, busy as u64);
        Self {
            shared,
            subscription,
        }
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.subscription.unset_queued();
        let busy = self.shared.busy.fetch_sub(1, Ordering::AcqRel) - 1;
        self.shared
            .counters
            .set_raw(Counter::WorkersBusy, busy as u64);
    }
}

/// Clears the sweep flag when a sweep ends.
struct SweepGuard<'a>(&'a AtomicBool);

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Shared {
    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn schedule(self: &Arc<Self>, subscription: Arc<Subscription>) {
        if self.is_shut_down() {
            return;
        }

        if subscription.set_queued() {
            trace!(subscription = %subscription.identity(), "Scheduled");
            self.queue.lock().push_back(subscription);
            self.notify.notify_one();
        }

        self.add_worker();
    }

    fn add_worker(self: &Arc<Self>) {
        let mut allocated = self.allocated.load(Ordering::Acquire);
        loop {
            let busy = self.busy.load(Ordering::Acquire);
            if allocated >= self.config.max_workers || allocated != busy {
                return;
            }
            match self.allocated.compare_exchange(
                allocated,
                allocated + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => allocated = actual,
            }
        }

        self.counters
            .set_raw(Counter::WorkersAllocated, (allocated + 1) as u64);
        debug!(allocated = allocated + 1, "Worker added");

        let slot = WorkerSlot(Arc::clone(self));
        self.runtime.spawn(pump(slot));
    }

    /// Wait for the next queued subscription. `None` once shut down.
    async fn next(&self) -> Option<Arc<Subscription>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_shut_down() {
                return None;
            }
            let next = self.queue.lock().pop_front();
            if next.is_some() {
                return next;
            }

            notified.await;
        }
    }

    fn should_retire(&self) -> bool {
        let allocated = self.allocated.load(Ordering::Acquire);
        let busy = self.busy.load(Ordering::Acquire);
        allocated.saturating_sub(busy) > self.config.max_idle_workers
    }

    fn sweep(self: &Arc<Self>) -> usize {
        if self.sweeping.swap(true, Ordering::AcqRel) {
            trace!("Sweep already running");
            return 0;
        }
        let _sweeping = SweepGuard(&self.sweeping);

        let topics: Vec<Arc<Topic>> = self
            .topics
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut scheduled = 0;
        for topic in topics {
            for subscription in topic.subscriptions() {
                if subscription.is_disposed() {
                    continue;
                }
                self.schedule(subscription);
                scheduled += 1;
            }
        }

        trace!(scheduled, "Sweep finished");
        scheduled
    }
}

/// A worker loop. Runs until it retires, faults or the engine shuts down.
async fn pump(slot: WorkerSlot) {
    let shared = Arc::clone(&slot.0);

    loop {
        if shared.is_shut_down() {
            return;
        }
        if shared.should_retire() {
            debug!("Idle worker retiring");
            return;
        }

        let Some(subscription) = shared.next().await else {
            return;
        };

        let result = {
            let _busy = BusyGuard::new(&shared, &subscription);
            subscription.work().await
        };
        if let Err(e) = result {
            error!(
                subscription = %subscription.identity(),
                error = %e,
                "Worker faulted"
            );
            return;
        }

        // A publish that landed while the loop was finishing saw it queued.
        if !subscription.is_disposed() && subscription.has_pending() {
            shared.schedule(subscription);
        }
    }
}

async fn sweep_loop(shared: Weak<Shared>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            return;
        };
        if shared.is_shut_down() {
            return;
        }
        shared.sweep();
    }
}

/// The worker-pool scheduler.
pub struct Engine {
    shared: Arc<Shared>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Create an engine on the current tokio runtime and start its sweep timer.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::NoRuntime`] when called outside a tokio runtime.
    pub fn new(
        config: EngineConfig,
        topics: Arc<TopicMap>,
        counters: Counters,
    ) -> Result<Self, BusError> {
        let runtime = Handle::try_current().map_err(|e| BusError::NoRuntime(e.to_string()))?;
        info!("Creating engine with config: {:?}", config);

        let interval = config.sweep_interval.max(Duration::from_millis(1));
        let shared = Arc::new(Shared {
            config,
            topics,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            allocated: AtomicUsize::new(0),
            busy: AtomicUsize::new(0),
            sweeping: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            counters,
            runtime: runtime.clone(),
        });

        let sweeper = runtime.spawn(sweep_loop(Arc::downgrade(&shared), interval));

        Ok(Self {
            shared,
            sweeper: Mutex::new(Some(sweeper)),
        })
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Signal that `subscription` may have new messages.
    ///
    /// Never blocks. A subscription already in the queue is not queued twice.
    pub fn schedule(&self, subscription: Arc<Subscription>) {
        self.shared.schedule(subscription);
    }

    /// Re-schedule every live subscription on every topic.
    ///
    /// Returns how many subscriptions were signalled, or 0 if another sweep
    /// is in progress.
    pub fn sweep(&self) -> usize {
        self.shared.sweep()
    }

    /// Workers currently alive.
    #[must_use]
    pub fn allocated_workers(&self) -> usize {
        self.shared.allocated.load(Ordering::Acquire)
    }

    /// Workers currently running a subscription.
    #[must_use]
    pub fn busy_workers(&self) -> usize {
        self.shared.busy.load(Ordering::Acquire)
    }

    /// Subscriptions waiting for a worker.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Whether [`Engine::shutdown`] has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shared.is_shut_down()
    }

    /// Stop the sweep timer and retire all workers.
    ///
    /// In-flight deliveries finish; queued subscriptions are dropped.
    pub fn shutdown(&self) {
        if self.shared.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }

        let drained: Vec<_> = self.shared.queue.lock().drain(..).collect();
        for subscription in drained {
            subscription.unset_queued();
        }

        self.shared.notify.notify_waiters();
        info!("Engine shut down");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
