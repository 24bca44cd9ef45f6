//! Partitioned multi-threaded event processor backing coordinator state
//! machines.
//!
//! Producers submit [`CoordinatorEvent`]s keyed by partition. A fixed pool of
//! worker threads executes them with at most one event in flight per key and
//! first-in first-out order within a key, while distinct keys proceed in
//! parallel.

pub mod accumulator;
pub mod app;
pub mod config;
pub mod event;
pub mod metrics;
pub mod processor;
pub mod telemetry;
pub mod time;

pub use accumulator::{EventAccumulator, EventQueue};
pub use config::{ConfigError, EventProcessorConfig};
pub use event::{
    BoxedEvent, CoordinatorEvent, EventCompletion, EventKey, EventProcessorError, EventResult,
    FutureEvent, KeyedEvent, TopicPartition,
};
pub use metrics::{
    CoordinatorRuntimeMetrics, HistogramSnapshot, LatencyHistogram, NoopRuntimeMetrics,
    RuntimeMetrics, RuntimeMetricsSnapshot, EVENT_PROCESSING_TIME_METRIC,
    EVENT_QUEUE_TIME_METRIC, THREAD_IDLE_SAMPLES_METRIC, THREAD_IDLE_TIME_METRIC,
};
pub use processor::{
    EnqueueError, EventProcessorBuilder, MultiThreadedEventProcessor, ProcessorBuildError,
    ProcessorState,
};
pub use telemetry::{
    ensure_ms_only_metrics, scrape_metric_names, validate_runtime_exposition, TelemetryError,
};
pub use time::{Clock, ManualClock, SystemClock};
