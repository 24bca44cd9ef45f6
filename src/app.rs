use crate::config::EventProcessorConfig;
use crate::event::{FutureEvent, TopicPartition};
use crate::metrics::{RuntimeMetrics, RuntimeMetricsSnapshot};
use crate::processor::MultiThreadedEventProcessor;
use crate::telemetry::validate_runtime_exposition;
use crate::time::{Clock, SystemClock};
use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// Shape of the demonstration workload.
#[derive(Debug, Clone)]
pub struct WorkloadOptions {
    pub topic: String,
    pub partitions: i32,
    pub events_per_partition: usize,
}

impl Default for WorkloadOptions {
    fn default() -> Self {
        Self {
            topic: "__consumer_offsets".to_string(),
            partitions: 8,
            events_per_partition: 64,
        }
    }
}

/// Outcome of [`run_workload`].
#[derive(Debug, Clone)]
pub struct WorkloadReport {
    pub executed: usize,
    pub metrics: RuntimeMetricsSnapshot,
    pub exposition: String,
}

/// Entry point of the binary: `coordinator-runtime [config.json]`.
pub fn run() -> Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => EventProcessorConfig::load_from_file(&path)
            .with_context(|| format!("loading processor config from {path}"))?,
        None => EventProcessorConfig::default(),
    };
    init_logging(&config.log_level);
    let report = run_workload(config, &WorkloadOptions::default())?;
    info!(executed = report.executed, "workload finished");
    print!("{}", report.exposition);
    Ok(())
}

/// Installs the `tracing` subscriber; `RUST_LOG` wins over `default_level`.
pub fn init_logging(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    // A subscriber may already be installed by an embedding process.
    let _ = fmt().with_env_filter(filter).with_target(true).try_init();
}

/// Runs a keyed workload to completion and checks per-partition ordering.
pub fn run_workload(
    config: EventProcessorConfig,
    options: &WorkloadOptions,
) -> Result<WorkloadReport> {
    let clock = Arc::new(SystemClock::new());
    let metrics = Arc::new(RuntimeMetrics::new());
    let processor = MultiThreadedEventProcessor::<TopicPartition>::builder()
        .config(config)
        .clock(clock.clone())
        .metrics(metrics.clone())
        .build()?;

    let observed: Arc<Mutex<BTreeMap<i32, Vec<usize>>>> = Arc::default();
    let mut completions = Vec::new();
    for sequence in 0..options.events_per_partition {
        for partition in 0..options.partitions {
            let key = TopicPartition::new(options.topic.clone(), partition);
            let log = observed.clone();
            let (event, completion) = FutureEvent::new(key, clock.now_ms(), move || {
                let mut guard = log.lock().unwrap_or_else(|err| err.into_inner());
                guard.entry(partition).or_default().push(sequence);
                sequence
            });
            processor
                .enqueue_last(event)
                .map_err(|err| anyhow::anyhow!("{err}"))?;
            completions.push(completion);
        }
    }

    let mut executed = 0;
    for completion in completions {
        completion.wait()?;
        executed += 1;
    }
    processor.close();

    let observed = observed.lock().unwrap_or_else(|err| err.into_inner());
    for (partition, sequences) in observed.iter() {
        if sequences.windows(2).any(|pair| pair[0] > pair[1]) {
            bail!("partition {partition} executed events out of order: {sequences:?}");
        }
    }

    let exposition = metrics.render_metrics();
    validate_runtime_exposition(&exposition)?;
    Ok(WorkloadReport {
        executed,
        metrics: metrics.snapshot(),
        exposition,
    })
}
