#![allow(dead_code)]

use coordinator_runtime::{
    BoxedEvent, CoordinatorRuntimeMetrics, EventAccumulator, EventCompletion, EventQueue,
    EventResult, FutureEvent, ManualClock, TopicPartition,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

pub fn wait_for<F>(timeout: Duration, mut predicate: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("condition not met within {:?}", timeout);
}

/// Awaits a completion on a throwaway current-thread runtime.
pub fn await_completion<T>(completion: EventCompletion<T>, timeout: Duration) -> EventResult<T> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("tokio runtime");
    runtime
        .block_on(async { tokio::time::timeout(timeout, completion).await })
        .expect("event did not complete in time")
}

pub fn tp(partition: i32) -> TopicPartition {
    TopicPartition::new("foo", partition)
}

/// One-shot gate threads can wait on.
#[derive(Default)]
pub struct Latch {
    open: Mutex<bool>,
    cv: Condvar,
}

impl Latch {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn release(&self) {
        *self.open.lock().unwrap() = true;
        self.cv.notify_all();
    }

    pub fn is_released(&self) -> bool {
        *self.open.lock().unwrap()
    }

    pub fn wait(&self) {
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.cv.wait(open).unwrap();
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.open.lock().unwrap();
        let (open, _) = self
            .cv
            .wait_timeout_while(guard, timeout, |open| !*open)
            .unwrap();
        *open
    }
}

/// Handles for steering a blocking event from the test thread.
pub struct Gate {
    pub executed: Arc<Latch>,
    pub release: Arc<Latch>,
}

impl Gate {
    pub fn await_execution(&self, timeout: Duration) -> bool {
        self.executed.wait_timeout(timeout)
    }
}

pub type TestEvent = FutureEvent<TopicPartition, usize>;

/// Event that bumps `counter` and returns the new value.
pub fn counting_event(
    key: TopicPartition,
    counter: &Arc<AtomicUsize>,
) -> (TestEvent, EventCompletion<usize>) {
    let counter = counter.clone();
    FutureEvent::new(key, 0, move || counter.fetch_add(1, Ordering::SeqCst) + 1)
}

/// Event that bumps `counter`, signals execution, then parks until released.
pub fn blocking_event(
    key: TopicPartition,
    counter: &Arc<AtomicUsize>,
    created_time_ms: u64,
    before: impl FnOnce() + Send + 'static,
) -> (TestEvent, EventCompletion<usize>, Gate) {
    let counter = counter.clone();
    let executed = Latch::new();
    let release = Latch::new();
    let gate = Gate {
        executed: executed.clone(),
        release: release.clone(),
    };
    let (event, completion) = FutureEvent::new(key, created_time_ms, move || {
        before();
        let value = counter.fetch_add(1, Ordering::SeqCst) + 1;
        executed.release();
        release.wait();
        value
    });
    (event, completion, gate)
}

/// Sink keeping every sample in arrival order.
#[derive(Default)]
pub struct RecordingMetrics {
    pub queue_times: Mutex<Vec<u64>>,
    pub processing_times: Mutex<Vec<u64>>,
    pub idle_times: Mutex<Vec<f64>>,
}

impl RecordingMetrics {
    pub fn queue_times(&self) -> Vec<u64> {
        self.queue_times.lock().unwrap().clone()
    }

    pub fn processing_times(&self) -> Vec<u64> {
        self.processing_times.lock().unwrap().clone()
    }

    pub fn idle_times(&self) -> Vec<f64> {
        self.idle_times.lock().unwrap().clone()
    }
}

impl CoordinatorRuntimeMetrics for RecordingMetrics {
    fn record_event_queue_time(&self, duration_ms: u64) {
        self.queue_times.lock().unwrap().push(duration_ms);
    }

    fn record_event_processing_time(&self, duration_ms: u64) {
        self.processing_times.lock().unwrap().push(duration_ms);
    }

    fn record_thread_idle_time(&self, idle_time_ms: f64) {
        self.idle_times.lock().unwrap().push(idle_time_ms);
    }
}

/// Accumulator whose blocking polls advance a manual clock, simulating time
/// spent waiting for work.
pub struct DelayedQueue {
    inner: EventAccumulator<TopicPartition, BoxedEvent<TopicPartition>>,
    clock: ManualClock,
    delay_ms: u64,
}

impl DelayedQueue {
    pub fn new(clock: ManualClock, delay_ms: u64) -> Self {
        Self {
            inner: EventAccumulator::new(),
            clock,
            delay_ms,
        }
    }
}

impl EventQueue<TopicPartition, BoxedEvent<TopicPartition>> for DelayedQueue {
    fn add(&self, event: BoxedEvent<TopicPartition>) {
        self.inner.add(event);
    }

    fn poll(&self, timeout: Duration) -> Option<BoxedEvent<TopicPartition>> {
        let event = self.inner.poll(timeout);
        if !timeout.is_zero() {
            self.clock.advance_ms(self.delay_ms);
        }
        event
    }

    fn done(&self, event: &BoxedEvent<TopicPartition>) {
        self.inner.done(event);
    }

    fn size(&self) -> usize {
        self.inner.size()
    }

    fn drain(&self) -> Vec<BoxedEvent<TopicPartition>> {
        self.inner.drain()
    }

    fn close(&self) {
        self.inner.close();
    }
}
