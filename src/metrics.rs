use std::sync::Arc;
use std::time::Instant;

/// Sink for the log's operational metrics.
///
/// Implementations bridge into whatever metrics registry the embedding
/// server uses. Every call must be cheap; the log invokes these on the hot
/// append path.
pub trait MetricSink: Send + Sync {
    fn counter(&self, name: &'static str, delta: u64);
    fn gauge(&self, name: &'static str, value: u64);
    /// Records a latency observation in microseconds.
    fn observe(&self, name: &'static str, micros: u64);
}

/// Handle through which the log reports metrics. A `None` sink makes every
/// call a no-op.
#[derive(Clone, Default)]
pub struct LogMetrics {
    sink: Option<Arc<dyn MetricSink>>,
}

impl LogMetrics {
    pub fn new(sink: Option<Arc<dyn MetricSink>>) -> Self {
        Self { sink }
    }

    pub fn counter(&self, name: &'static str, delta: u64) {
        if let Some(s) = &self.sink {
            s.counter(name, delta);
        }
    }

    pub fn gauge(&self, name: &'static str, value: u64) {
        if let Some(s) = &self.sink {
            s.gauge(name, value);
        }
    }

    /// Runs `f` and records its wall time under `name`.
    pub fn time<T>(&self, name: &'static str, f: impl FnOnce() -> T) -> T {
        match &self.sink {
            Some(s) => {
                let start = Instant::now();
                let out = f();
                s.observe(name, start.elapsed().as_micros() as u64);
                out
            }
            None => f(),
        }
    }

    pub fn observe_since(&self, name: &'static str, start: Instant) {
        if let Some(s) = &self.sink {
            s.observe(name, start.elapsed().as_micros() as u64);
        }
    }
}

/// Metric names reported by the log.
pub mod names {
    pub const BYTES_LOGGED: &str = "log_bytes_logged";
    pub const ENTRY_BATCHES_PER_GROUP: &str = "log_entry_batches_per_group";
    pub const GROUP_COMMIT_LATENCY: &str = "log_group_commit_latency";
    pub const APPEND_LATENCY: &str = "log_append_latency";
    pub const SYNC_LATENCY: &str = "log_sync_latency";
    pub const ROLL_LATENCY: &str = "log_roll_latency";
    pub const GC_DURATION: &str = "log_gc_duration";
}
