use crate::event::{panic_message, CoordinatorEvent, EventProcessorError, KeyedEvent};
use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::error;

/// Key-partitioned ready queue shared by producers and worker threads.
///
/// Implementations guarantee that at most one event per key is handed out
/// between a `poll` and the matching `done`, and that events of one key are
/// handed out in insertion order.
pub trait EventQueue<K, T>: Send + Sync {
    /// Appends the event to its key's queue. Never blocks.
    fn add(&self, event: T);

    /// Waits up to `timeout` for a ready key and returns its head event.
    fn poll(&self, timeout: Duration) -> Option<T>;

    /// Releases the key of an event previously returned by `poll`.
    fn done(&self, event: &T);

    /// Queued plus in-flight events.
    fn size(&self) -> usize;

    /// Removes every queued event that is not in flight.
    fn drain(&self) -> Vec<T>;

    /// Wakes all pollers; later polls never block.
    fn close(&self);

    /// Removes every queued event that is not in flight and completes each
    /// with a freshly built error. Returns the number of failed events.
    ///
    /// A panicking `complete` is logged and does not prevent the remaining
    /// events from being completed.
    fn drain_and_fail(&self, error: &dyn Fn() -> EventProcessorError) -> usize
    where
        T: CoordinatorEvent<K>,
        K: Debug,
    {
        let drained = self.drain();
        let count = drained.len();
        for mut event in drained {
            let failure = error();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| event.complete(failure)));
            if let Err(payload) = outcome {
                error!(
                    key = ?event.key(),
                    error = %panic_message(payload.as_ref()),
                    "failed to complete drained event"
                );
            }
        }
        count
    }
}

struct KeyQueue<T> {
    events: VecDeque<T>,
    in_flight: bool,
}

impl<T> KeyQueue<T> {
    fn new() -> Self {
        Self {
            events: VecDeque::new(),
            in_flight: false,
        }
    }
}

struct AccumulatorState<K, T> {
    queues: HashMap<K, KeyQueue<T>>,
    // Keys with queued work and nothing in flight, oldest transition first.
    ready: VecDeque<K>,
    queued: usize,
    in_flight: usize,
    closed: bool,
}

/// Monitor-based [`EventQueue`]: one mutex guards all per-key queues, one
/// condition variable signals readiness.
pub struct EventAccumulator<K, T> {
    state: Mutex<AccumulatorState<K, T>>,
    available: Condvar,
}

impl<K, T> Default for EventAccumulator<K, T> {
    fn default() -> Self {
        Self {
            state: Mutex::new(AccumulatorState {
                queues: HashMap::new(),
                ready: VecDeque::new(),
                queued: 0,
                in_flight: 0,
                closed: false,
            }),
            available: Condvar::new(),
        }
    }
}

impl<K, T> EventAccumulator<K, T>
where
    K: Eq + Hash + Clone + Debug + Send,
    T: KeyedEvent<K> + Send,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Number of keys currently executing an event.
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    /// Number of keys waiting for a worker.
    pub fn ready_keys(&self) -> usize {
        self.lock().ready.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> MutexGuard<'_, AccumulatorState<K, T>> {
        // Event code never runs under this lock, so a poisoned guard still
        // holds consistent bookkeeping.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K, T> EventQueue<K, T> for EventAccumulator<K, T>
where
    K: Eq + Hash + Clone + Debug + Send,
    T: KeyedEvent<K> + Send,
{
    fn add(&self, event: T) {
        let mut guard = self.lock();
        let key = event.key().clone();
        let queue = guard.queues.entry(key.clone()).or_insert_with(KeyQueue::new);
        queue.events.push_back(event);
        let became_ready = !queue.in_flight && queue.events.len() == 1;
        guard.queued += 1;
        if became_ready {
            guard.ready.push_back(key);
            self.available.notify_one();
        }
    }

    fn poll(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now().checked_add(timeout);
        let mut guard = self.lock();
        loop {
            while let Some(key) = guard.ready.pop_front() {
                let state = &mut *guard;
                let Some(queue) = state.queues.get_mut(&key) else {
                    error!(key = ?key, "ready key has no queue; skipping");
                    continue;
                };
                let Some(event) = queue.events.pop_front() else {
                    error!(key = ?key, "ready key has an empty queue; releasing it");
                    if !queue.in_flight {
                        state.queues.remove(&key);
                    }
                    continue;
                };
                queue.in_flight = true;
                state.queued -= 1;
                state.in_flight += 1;
                return Some(event);
            }
            if guard.closed {
                return None;
            }
            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => timeout,
            };
            if remaining.is_zero() {
                return None;
            }
            let (next_guard, _) = self
                .available
                .wait_timeout(guard, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            guard = next_guard;
        }
    }

    fn done(&self, event: &T) {
        let mut guard = self.lock();
        let key = event.key();
        let state = &mut *guard;
        let Some(queue) = state.queues.get_mut(key) else {
            error!(key = ?key, "done called for an untracked key");
            return;
        };
        if !queue.in_flight {
            error!(key = ?key, "done called for a key with nothing in flight");
            return;
        }
        queue.in_flight = false;
        state.in_flight -= 1;
        if queue.events.is_empty() {
            state.queues.remove(key);
        } else {
            state.ready.push_back(key.clone());
            self.available.notify_one();
        }
    }

    fn size(&self) -> usize {
        let guard = self.lock();
        guard.queued + guard.in_flight
    }

    fn drain(&self) -> Vec<T> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let mut drained = Vec::with_capacity(state.queued);
        // Ready keys first so earlier-ready partitions fail first.
        for key in state.ready.drain(..) {
            if let Some(queue) = state.queues.remove(&key) {
                drained.extend(queue.events);
            }
        }
        state.queues.retain(|_, queue| {
            drained.extend(queue.events.drain(..));
            queue.in_flight
        });
        state.queued = 0;
        drained
    }

    fn close(&self) {
        let mut guard = self.lock();
        guard.closed = true;
        self.available.notify_all();
    }
}
