use serde::Serialize;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

pub const EVENT_QUEUE_TIME_METRIC: &str = "coordinator_event_queue_time_ms";
pub const EVENT_PROCESSING_TIME_METRIC: &str = "coordinator_event_processing_time_ms";
pub const THREAD_IDLE_TIME_METRIC: &str = "coordinator_thread_idle_time_ms_total";
pub const THREAD_IDLE_SAMPLES_METRIC: &str = "coordinator_thread_idle_samples_total";

/// Upper bounds (inclusive, ms) of the latency buckets; the last bucket is open.
const LATENCY_BUCKETS_MS: [u64; 14] = [
    1, 2, 5, 10, 25, 50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000, 30_000,
];

const REPORTED_QUANTILES: [f64; 4] = [0.5, 0.95, 0.99, 0.999];

/// Sink for the timing samples produced by worker threads.
///
/// Called from worker threads without any processor lock held;
/// implementations must not block.
pub trait CoordinatorRuntimeMetrics: Send + Sync {
    /// Time between event creation and the start of its execution.
    fn record_event_queue_time(&self, duration_ms: u64);

    /// Time spent inside one event's `run`.
    fn record_event_processing_time(&self, duration_ms: u64);

    /// Time one worker spent blocked in `poll`.
    fn record_thread_idle_time(&self, idle_time_ms: f64);
}

/// Discards every sample.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRuntimeMetrics;

impl CoordinatorRuntimeMetrics for NoopRuntimeMetrics {
    fn record_event_queue_time(&self, _duration_ms: u64) {}

    fn record_event_processing_time(&self, _duration_ms: u64) {}

    fn record_thread_idle_time(&self, _idle_time_ms: f64) {}
}

/// Lock-free bucketed latency histogram.
#[derive(Debug)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; LATENCY_BUCKETS_MS.len() + 1],
    count: AtomicU64,
    sum_ms: AtomicU64,
    max_ms: AtomicU64,
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_ms: AtomicU64::new(0),
            max_ms: AtomicU64::new(0),
        }
    }
}

impl LatencyHistogram {
    pub fn record(&self, value_ms: u64) {
        let index = LATENCY_BUCKETS_MS
            .iter()
            .position(|bound| value_ms <= *bound)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        self.buckets[index].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_ms.fetch_add(value_ms, Ordering::Relaxed);
        self.max_ms.fetch_max(value_ms, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum_ms(&self) -> u64 {
        self.sum_ms.load(Ordering::Relaxed)
    }

    pub fn max_ms(&self) -> u64 {
        self.max_ms.load(Ordering::Relaxed)
    }

    /// Upper bound of the bucket holding the `quantile` sample, capped by the
    /// observed maximum. Returns 0 when nothing was recorded.
    pub fn quantile_ms(&self, quantile: f64) -> u64 {
        let count = self.count();
        if count == 0 {
            return 0;
        }
        let rank = ((quantile.clamp(0.0, 1.0) * count as f64).ceil() as u64).max(1);
        let max = self.max_ms();
        let mut cumulative = 0u64;
        for (index, bucket) in self.buckets.iter().enumerate() {
            cumulative += bucket.load(Ordering::Relaxed);
            if cumulative >= rank {
                return LATENCY_BUCKETS_MS
                    .get(index)
                    .map_or(max, |bound| (*bound).min(max));
            }
        }
        max
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            count: self.count(),
            sum_ms: self.sum_ms(),
            max_ms: self.max_ms(),
            p50_ms: self.quantile_ms(0.5),
            p95_ms: self.quantile_ms(0.95),
            p99_ms: self.quantile_ms(0.99),
            p999_ms: self.quantile_ms(0.999),
        }
    }

    fn render(&self, name: &str, output: &mut String) {
        let _ = writeln!(output, "# TYPE {name} summary");
        for quantile in REPORTED_QUANTILES {
            let _ = writeln!(
                output,
                "{name}{{quantile=\"{quantile}\"}} {}",
                self.quantile_ms(quantile)
            );
        }
        let _ = writeln!(output, "{name}_sum {}", self.sum_ms());
        let _ = writeln!(output, "{name}_count {}", self.count());
        let _ = writeln!(output, "{name}_max {}", self.max_ms());
    }
}

/// Point-in-time view of a [`LatencyHistogram`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum_ms: u64,
    pub max_ms: u64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub p999_ms: u64,
}

/// Point-in-time view of [`RuntimeMetrics`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuntimeMetricsSnapshot {
    pub event_queue_time: HistogramSnapshot,
    pub event_processing_time: HistogramSnapshot,
    pub thread_idle_time_ms: f64,
    pub thread_idle_samples: u64,
}

/// In-memory aggregate of the processor's timing samples.
#[derive(Debug, Default)]
pub struct RuntimeMetrics {
    queue_time: LatencyHistogram,
    processing_time: LatencyHistogram,
    idle_time_bits: AtomicU64,
    idle_samples: AtomicU64,
}

impl RuntimeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_queue_time(&self) -> &LatencyHistogram {
        &self.queue_time
    }

    pub fn event_processing_time(&self) -> &LatencyHistogram {
        &self.processing_time
    }

    /// Sum of every idle sample recorded so far.
    pub fn thread_idle_time_ms(&self) -> f64 {
        f64::from_bits(self.idle_time_bits.load(Ordering::Relaxed))
    }

    pub fn thread_idle_samples(&self) -> u64 {
        self.idle_samples.load(Ordering::Relaxed)
    }

    /// Fraction of the pool's capacity spent idle over `elapsed_ms`.
    pub fn thread_idle_ratio(&self, elapsed_ms: u64, num_threads: usize) -> f64 {
        let capacity = elapsed_ms as f64 * num_threads.max(1) as f64;
        if capacity == 0.0 {
            return 0.0;
        }
        self.thread_idle_time_ms() / capacity
    }

    pub fn snapshot(&self) -> RuntimeMetricsSnapshot {
        RuntimeMetricsSnapshot {
            event_queue_time: self.queue_time.snapshot(),
            event_processing_time: self.processing_time.snapshot(),
            thread_idle_time_ms: self.thread_idle_time_ms(),
            thread_idle_samples: self.thread_idle_samples(),
        }
    }

    /// Renders Prometheus exposition text.
    pub fn render_metrics(&self) -> String {
        let mut output = String::new();
        self.queue_time.render(EVENT_QUEUE_TIME_METRIC, &mut output);
        self.processing_time
            .render(EVENT_PROCESSING_TIME_METRIC, &mut output);
        let _ = writeln!(output, "# TYPE {THREAD_IDLE_TIME_METRIC} counter");
        let _ = writeln!(
            output,
            "{THREAD_IDLE_TIME_METRIC} {}",
            self.thread_idle_time_ms()
        );
        let _ = writeln!(output, "# TYPE {THREAD_IDLE_SAMPLES_METRIC} counter");
        let _ = writeln!(
            output,
            "{THREAD_IDLE_SAMPLES_METRIC} {}",
            self.thread_idle_samples()
        );
        output
    }
}

impl CoordinatorRuntimeMetrics for RuntimeMetrics {
    fn record_event_queue_time(&self, duration_ms: u64) {
        self.queue_time.record(duration_ms);
    }

    fn record_event_processing_time(&self, duration_ms: u64) {
        self.processing_time.record(duration_ms);
    }

    fn record_thread_idle_time(&self, idle_time_ms: f64) {
        if !idle_time_ms.is_finite() || idle_time_ms < 0.0 {
            return;
        }
        let _ = self
            .idle_time_bits
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + idle_time_ms).to_bits())
            });
        self.idle_samples.fetch_add(1, Ordering::Relaxed);
    }
}
