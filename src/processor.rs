use crate::accumulator::{EventAccumulator, EventQueue};
use crate::config::{ConfigError, EventProcessorConfig};
use crate::event::{
    panic_message, BoxedEvent, CoordinatorEvent, EventKey, EventProcessorError, KeyedEvent,
};
use crate::metrics::{CoordinatorRuntimeMetrics, NoopRuntimeMetrics};
use crate::time::{Clock, SystemClock};
use serde::Serialize;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Lifecycle of a processor. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum ProcessorState {
    Running,
    ShuttingDown,
    Closed,
}

impl ProcessorState {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessorState::Running => "running",
            ProcessorState::ShuttingDown => "shutting down",
            ProcessorState::Closed => "closed",
        }
    }
}

impl fmt::Display for ProcessorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when enqueuing is refused; hands the event back.
pub enum EnqueueError<T> {
    Rejected { event: T, state: ProcessorState },
}

impl<T> EnqueueError<T> {
    pub fn state(&self) -> ProcessorState {
        match self {
            EnqueueError::Rejected { state, .. } => *state,
        }
    }

    pub fn into_event(self) -> T {
        match self {
            EnqueueError::Rejected { event, .. } => event,
        }
    }
}

impl<T> fmt::Debug for EnqueueError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<T> fmt::Display for EnqueueError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event processor is {}; event rejected", self.state())
    }
}

impl<T> std::error::Error for EnqueueError<T> {}

impl<T> From<EnqueueError<T>> for EventProcessorError {
    fn from(err: EnqueueError<T>) -> Self {
        EventProcessorError::rejected(err.state())
    }
}

/// Errors raised while constructing a processor.
#[derive(Debug, Error)]
pub enum ProcessorBuildError {
    /// The supplied parameters failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The OS refused to start a worker; already started workers were stopped.
    #[error("failed to spawn worker thread {name}: {source}")]
    Spawn {
        /// Name of the thread that could not be started.
        name: String,
        source: std::io::Error,
    },
}

type SharedQueue<K> = Arc<dyn EventQueue<K, BoxedEvent<K>>>;

/// Builder for [`MultiThreadedEventProcessor`] with optional collaborators.
pub struct EventProcessorBuilder<K: EventKey> {
    config: EventProcessorConfig,
    clock: Option<Arc<dyn Clock>>,
    metrics: Option<Arc<dyn CoordinatorRuntimeMetrics>>,
    queue: Option<SharedQueue<K>>,
}

impl<K: EventKey> Default for EventProcessorBuilder<K> {
    fn default() -> Self {
        Self {
            config: EventProcessorConfig::default(),
            clock: None,
            metrics: None,
            queue: None,
        }
    }
}

impl<K: EventKey> EventProcessorBuilder<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: EventProcessorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn thread_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.thread_prefix = prefix.into();
        self
    }

    pub fn log_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.log_prefix = prefix.into();
        self
    }

    pub fn num_threads(mut self, num_threads: usize) -> Self {
        self.config.num_threads = num_threads;
        self
    }

    /// Rounded down to whole milliseconds.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval_ms = interval.as_millis().min(u128::from(u64::MAX)) as u64;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn CoordinatorRuntimeMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Replaces the default [`EventAccumulator`].
    pub fn queue(mut self, queue: SharedQueue<K>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn build(self) -> Result<MultiThreadedEventProcessor<K>, ProcessorBuildError> {
        self.config.validate()?;
        let shared = Arc::new(WorkerShared {
            queue: self
                .queue
                .unwrap_or_else(|| Arc::new(EventAccumulator::<K, BoxedEvent<K>>::new())),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock::new())),
            metrics: self
                .metrics
                .unwrap_or_else(|| Arc::new(NoopRuntimeMetrics)),
            poll_interval: self.config.poll_interval(),
            log_prefix: self.config.log_prefix.clone(),
            stop: AtomicBool::new(false),
        });

        let mut workers = Vec::with_capacity(self.config.num_threads);
        for index in 0..self.config.num_threads {
            let name = format!("{}{}", self.config.thread_prefix, index);
            let worker_shared = shared.clone();
            let worker_name = name.clone();
            let spawned = thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker_shared.run_worker(&worker_name));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(source) => {
                    shared.stop_workers();
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(ProcessorBuildError::Spawn { name, source });
                }
            }
        }
        info!(
            processor = %shared.log_prefix,
            num_threads = workers.len(),
            "event processor started"
        );

        Ok(MultiThreadedEventProcessor {
            num_threads: workers.len(),
            worker_ids: workers.iter().map(|handle| handle.thread().id()).collect(),
            shared,
            state: Mutex::new(ProcessorState::Running),
            workers: Mutex::new(WorkerHandles {
                handles: workers,
                joining: false,
                joined: false,
            }),
            workers_joined: Condvar::new(),
        })
    }
}

/// Fixed pool of worker threads draining a key-partitioned queue.
///
/// Events sharing a key run one at a time in submission order; events with
/// distinct keys run in parallel up to the pool size.
pub struct MultiThreadedEventProcessor<K: EventKey> {
    shared: Arc<WorkerShared<K>>,
    state: Mutex<ProcessorState>,
    workers: Mutex<WorkerHandles>,
    workers_joined: Condvar,
    worker_ids: Vec<ThreadId>,
    num_threads: usize,
}

// Join handles are owned by whichever `close` call gets to them first.
struct WorkerHandles {
    handles: Vec<thread::JoinHandle<()>>,
    joining: bool,
    joined: bool,
}

impl<K: EventKey> MultiThreadedEventProcessor<K> {
    pub fn builder() -> EventProcessorBuilder<K> {
        EventProcessorBuilder::new()
    }

    /// Starts `num_threads` workers named `{thread_prefix}{i}`.
    pub fn new(
        thread_prefix: impl Into<String>,
        num_threads: usize,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn CoordinatorRuntimeMetrics>,
    ) -> Result<Self, ProcessorBuildError> {
        Self::builder()
            .thread_prefix(thread_prefix)
            .num_threads(num_threads)
            .clock(clock)
            .metrics(metrics)
            .build()
    }

    pub fn state(&self) -> ProcessorState {
        *self.lock_state()
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Queued plus in-flight events.
    pub fn queue_size(&self) -> usize {
        self.shared.queue.size()
    }

    /// Appends an event to its key's queue, or hands it back if the
    /// processor is no longer running.
    pub fn enqueue_last<E>(&self, event: E) -> Result<(), EnqueueError<E>>
    where
        E: CoordinatorEvent<K> + 'static,
    {
        // Held across `add` so no event can slip in behind the shutdown drain.
        let state = self.lock_state();
        if *state != ProcessorState::Running {
            return Err(EnqueueError::Rejected {
                event,
                state: *state,
            });
        }
        self.shared.queue.add(Box::new(event));
        Ok(())
    }

    /// Stops accepting events and fails every event that has not started.
    /// Running events are left to finish; this does not wait for them.
    pub fn begin_shutdown(&self) {
        {
            let mut state = self.lock_state();
            if *state != ProcessorState::Running {
                return;
            }
            *state = ProcessorState::ShuttingDown;
        }
        info!(processor = %self.shared.log_prefix, "shutting down event processor");
        let failed = self
            .shared
            .queue
            .drain_and_fail(&|| EventProcessorError::rejected(ProcessorState::ShuttingDown));
        debug!(
            processor = %self.shared.log_prefix,
            failed,
            "failed queued events on shutdown"
        );
    }

    /// Shuts down if needed, stops every worker, and waits for them to exit.
    ///
    /// Concurrent callers all return only after the workers have been joined,
    /// except a caller running on a worker thread, which cannot wait for
    /// itself.
    pub fn close(&self) {
        self.begin_shutdown();
        self.shared.stop_workers();
        let current = thread::current().id();
        let handles = {
            let mut workers = self.lock_workers();
            if workers.joining {
                if !workers.joined && self.worker_ids.contains(&current) {
                    return;
                }
                while !workers.joined {
                    workers = self
                        .workers_joined
                        .wait(workers)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Vec::new()
            } else {
                workers.joining = true;
                std::mem::take(&mut workers.handles)
            }
        };
        for handle in handles {
            if handle.thread().id() == current {
                warn!(
                    processor = %self.shared.log_prefix,
                    "event processor closed from its own worker thread; not joining it"
                );
                continue;
            }
            let name = handle.thread().name().unwrap_or_default().to_string();
            if handle.join().is_err() {
                error!(processor = %self.shared.log_prefix, thread = %name, "worker thread panicked");
            }
        }
        {
            let mut workers = self.lock_workers();
            workers.joined = true;
            self.workers_joined.notify_all();
        }
        let mut state = self.lock_state();
        if *state != ProcessorState::Closed {
            *state = ProcessorState::Closed;
            info!(processor = %self.shared.log_prefix, "event processor closed");
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ProcessorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_workers(&self) -> MutexGuard<'_, WorkerHandles> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K: EventKey> Drop for MultiThreadedEventProcessor<K> {
    fn drop(&mut self) {
        self.close();
    }
}

/// State shared between the processor handle and its workers.
struct WorkerShared<K> {
    queue: SharedQueue<K>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn CoordinatorRuntimeMetrics>,
    poll_interval: Duration,
    log_prefix: String,
    stop: AtomicBool,
}

impl<K: EventKey> WorkerShared<K> {
    fn stop_workers(&self) {
        self.stop.store(true, Ordering::Release);
        self.queue.close();
    }

    fn run_worker(&self, thread_name: &str) {
        info!(processor = %self.log_prefix, thread = %thread_name, "starting event processor thread");
        while !self.stop.load(Ordering::Acquire) {
            let poll_start_ms = self.clock.now_ms();
            let event = self.queue.poll(self.poll_interval);
            let poll_end_ms = self.clock.now_ms();
            self.metrics
                .record_thread_idle_time(poll_end_ms.saturating_sub(poll_start_ms) as f64);
            if let Some(event) = event {
                self.execute(event, poll_end_ms, thread_name);
            }
        }
        self.drain_remaining(thread_name);
        info!(processor = %self.log_prefix, thread = %thread_name, "event processor thread stopped");
    }

    fn execute(&self, mut event: BoxedEvent<K>, dequeued_ms: u64, thread_name: &str) {
        self.metrics
            .record_event_queue_time(dequeued_ms.saturating_sub(event.created_time_ms()));
        debug!(processor = %self.log_prefix, thread = %thread_name, key = ?event.key(), "executing event");
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| event.run()));
        self.metrics
            .record_event_processing_time(self.clock.now_ms().saturating_sub(dequeued_ms));
        if let Err(payload) = outcome {
            error!(
                processor = %self.log_prefix,
                thread = %thread_name,
                key = ?event.key(),
                error = %panic_message(payload.as_ref()),
                "failed to run event"
            );
        }
        self.queue.done(&event);
    }

    // Anything still reachable after the stop signal is failed rather than run.
    fn drain_remaining(&self, thread_name: &str) {
        while let Some(mut event) = self.queue.poll(Duration::ZERO) {
            debug!(processor = %self.log_prefix, thread = %thread_name, key = ?event.key(), "draining event");
            self.metrics.record_event_queue_time(
                self.clock.now_ms().saturating_sub(event.created_time_ms()),
            );
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                event.complete(EventProcessorError::rejected(ProcessorState::Closed))
            }));
            if let Err(payload) = outcome {
                error!(
                    processor = %self.log_prefix,
                    key = ?event.key(),
                    error = %panic_message(payload.as_ref()),
                    "failed to complete drained event"
                );
            }
            self.queue.done(&event);
        }
    }
}
