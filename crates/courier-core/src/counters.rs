//! Performance counters for the message bus.
//!
//! The bus reports worker and subscriber activity through a write-only
//! [`CounterSink`]. Sink failures are logged at `trace` and otherwise ignored,
//! so a broken sink never affects delivery.

use crate::error::CounterError;
use metrics::{counter, gauge};
use std::fmt;
use std::sync::Arc;
use tracing::{info, trace};

/// Metric names.
pub mod names {
    pub const WORKERS_ALLOCATED: &str = "courier_workers_allocated";
    pub const WORKERS_BUSY: &str = "courier_workers_busy";
    pub const SUBSCRIBERS_CURRENT: &str = "courier_subscribers_current";
    pub const SUBSCRIBERS_TOTAL: &str = "courier_subscribers_total";
    pub const MESSAGES_PUBLISHED: &str = "courier_messages_published_total";
    pub const TOPICS_CURRENT: &str = "courier_topics_current";
}

/// Counters maintained by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    /// Worker loops currently alive.
    WorkersAllocated,
    /// Worker loops currently running a subscription.
    WorkersBusy,
    /// Live subscriptions.
    SubscribersCurrent,
    /// Subscriptions created since start.
    SubscribersTotal,
    /// Messages published since start.
    MessagesPublished,
    /// Topics currently known to the bus.
    TopicsCurrent,
}

impl Counter {
    /// Metric name of this counter.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Counter::WorkersAllocated => names::WORKERS_ALLOCATED,
            Counter::WorkersBusy => names::WORKERS_BUSY,
            Counter::SubscribersCurrent => names::SUBSCRIBERS_CURRENT,
            Counter::SubscribersTotal => names::SUBSCRIBERS_TOTAL,
            Counter::MessagesPublished => names::MESSAGES_PUBLISHED,
            Counter::TopicsCurrent => names::TOPICS_CURRENT,
        }
    }

    /// Whether the counter only ever grows.
    #[must_use]
    pub fn is_monotonic(&self) -> bool {
        matches!(self, Counter::SubscribersTotal | Counter::MessagesPublished)
    }
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Write-only sink for bus counters.
pub trait CounterSink: Send + Sync {
    /// Add one to a counter.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink rejects the update.
    fn increment(&self, counter: Counter) -> Result<(), CounterError>;

    /// Subtract one from a counter.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink rejects the update.
    fn decrement(&self, counter: Counter) -> Result<(), CounterError>;

    /// Overwrite a counter with an absolute value.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink rejects the update.
    fn set_raw(&self, counter: Counter, value: u64) -> Result<(), CounterError>;
}

/// Sink that discards every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl CounterSink for NoopSink {
    fn increment(&self, _counter: Counter) -> Result<(), CounterError> {
        Ok(())
    }

    fn decrement(&self, _counter: Counter) -> Result<(), CounterError> {
        Ok(())
    }

    fn set_raw(&self, _counter: Counter, _value: u64) -> Result<(), CounterError> {
        Ok(())
    }
}

/// Sink that records through the `metrics` facade.
///
/// Monotonic counters map to `metrics` counters, the rest to gauges.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsSink;

impl MetricsSink {
    /// Create a sink and describe all bus metrics to the installed recorder.
    #[must_use]
    pub fn new() -> Self {
        describe_counters();
        Self
    }
}

impl CounterSink for MetricsSink {
    fn increment(&self, c: Counter) -> Result<(), CounterError> {
        if c.is_monotonic() {
            counter!(c.name()).increment(1);
        } else {
            gauge!(c.name()).increment(1.0);
        }
        Ok(())
    }

    fn decrement(&self, c: Counter) -> Result<(), CounterError> {
        if c.is_monotonic() {
            return Err(CounterError {
                counter: c.name(),
                reason: "counter is monotonic".to_string(),
            });
        }
        gauge!(c.name()).decrement(1.0);
        Ok(())
    }

    fn set_raw(&self, c: Counter, value: u64) -> Result<(), CounterError> {
        if c.is_monotonic() {
            counter!(c.name()).absolute(value);
        } else {
            gauge!(c.name()).set(value as f64);
        }
        Ok(())
    }
}

/// Describe all bus metrics.
pub fn describe_counters() {
    metrics::describe_gauge!(names::WORKERS_ALLOCATED, "Worker loops currently alive");
    metrics::describe_gauge!(
        names::WORKERS_BUSY,
        "Worker loops currently delivering to a subscription"
    );
    metrics::describe_gauge!(names::SUBSCRIBERS_CURRENT, "Current number of subscriptions");
    metrics::describe_counter!(
        names::SUBSCRIBERS_TOTAL,
        "Total number of subscriptions since start"
    );
    metrics::describe_counter!(names::MESSAGES_PUBLISHED, "Total number of published messages");
    metrics::describe_gauge!(names::TOPICS_CURRENT, "Current number of topics");

    info!("Bus metrics described");
}

/// Shared handle to a [`CounterSink`] that swallows sink errors.
#[derive(Clone)]
pub struct Counters {
    sink: Arc<dyn CounterSink>,
}

impl Counters {
    /// Wrap a sink.
    #[must_use]
    pub fn new(sink: Arc<dyn CounterSink>) -> Self {
        Self { sink }
    }

    /// Counters that go nowhere.
    #[must_use]
    pub fn noop() -> Self {
        Self::new(Arc::new(NoopSink))
    }

    /// Add one to a counter.
    pub fn increment(&self, counter: Counter) {
        if let Err(e) = self.sink.increment(counter) {
            trace!(error = %e, "Counter increment dropped");
        }
    }

    /// Subtract one from a counter.
    pub fn decrement(&self, counter: Counter) {
        if let Err(e) = self.sink.decrement(counter) {
            trace!(error = %e, "Counter decrement dropped");
        }
    }

    /// Overwrite a counter.
    pub fn set_raw(&self, counter: Counter, value: u64) {
        if let Err(e) = self.sink.set_raw(counter, value) {
            trace!(error = %e, "Counter update dropped");
        }
    }
}

impl Default for Counters {
    fn default() -> Self {
        Self::noop()
    }
}

impl fmt::Debug for Counters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Counters").finish_non_exhaustive()
    }
}
