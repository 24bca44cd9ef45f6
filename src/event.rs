use crate::processor::ProcessorState;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::oneshot;

/// Bounds required of a partition key.
pub trait EventKey: Eq + Hash + Clone + Debug + Send + Sync + 'static {}

impl<K> EventKey for K where K: Eq + Hash + Clone + Debug + Send + Sync + 'static {}

/// Anything the accumulator can partition by key.
pub trait KeyedEvent<K> {
    /// Partition identity used for ordering and mutual exclusion.
    fn key(&self) -> &K;
}

/// Unit of work dispatched by the event processor.
///
/// `run` and `complete` are mutually exclusive: the processor either hands the
/// event to a worker, which calls `run` exactly once, or rejects it and calls
/// `complete` with the reason. A failing `run` is responsible for signaling
/// its own originator.
pub trait CoordinatorEvent<K>: KeyedEvent<K> + Send {
    /// Creation timestamp assigned by the producer, in clock milliseconds.
    fn created_time_ms(&self) -> u64;

    /// Executes the event.
    fn run(&mut self);

    /// Completes the event without running it.
    fn complete(&mut self, error: EventProcessorError);
}

impl<K, E> KeyedEvent<K> for Box<E>
where
    E: KeyedEvent<K> + ?Sized,
{
    fn key(&self) -> &K {
        (**self).key()
    }
}

impl<K, E> CoordinatorEvent<K> for Box<E>
where
    E: CoordinatorEvent<K> + ?Sized,
{
    fn created_time_ms(&self) -> u64 {
        (**self).created_time_ms()
    }

    fn run(&mut self) {
        (**self).run();
    }

    fn complete(&mut self, error: EventProcessorError) {
        (**self).complete(error);
    }
}

/// Type-erased event stored by the processor.
pub type BoxedEvent<K> = Box<dyn CoordinatorEvent<K>>;

/// Failures delivered to event originators.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventProcessorError {
    #[error("event processor is {state}; event rejected")]
    Rejected { state: ProcessorState },
    #[error("event failed during execution: {message}")]
    EventFailed { message: String },
}

impl EventProcessorError {
    pub fn rejected(state: ProcessorState) -> Self {
        EventProcessorError::Rejected { state }
    }

    /// True for refusals caused by shutdown.
    pub fn is_rejection(&self) -> bool {
        matches!(self, EventProcessorError::Rejected { .. })
    }
}

/// Canonical coordinator partition key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartition {
    topic: String,
    partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// Outcome observed by the originator of a [`FutureEvent`].
pub type EventResult<T> = Result<T, EventProcessorError>;

/// Receiving half of a [`FutureEvent`]; resolves exactly once.
#[derive(Debug)]
pub struct EventCompletion<T> {
    receiver: oneshot::Receiver<EventResult<T>>,
}

impl<T> EventCompletion<T> {
    /// Returns the outcome if the event has already been resolved.
    pub fn try_result(&mut self) -> Option<EventResult<T>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(dropped())),
        }
    }

    /// Blocks the calling (non-async) thread until the event resolves.
    pub fn wait(self) -> EventResult<T> {
        self.receiver.blocking_recv().unwrap_or_else(|_| Err(dropped()))
    }
}

impl<T> Future for EventCompletion<T> {
    type Output = EventResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(dropped())))
    }
}

fn dropped() -> EventProcessorError {
    EventProcessorError::EventFailed {
        message: "event dropped before completion".to_string(),
    }
}

type Operation<T> = Box<dyn FnOnce() -> T + Send>;

/// Event that evaluates a closure and publishes its result to an
/// [`EventCompletion`].
pub struct FutureEvent<K, T> {
    key: K,
    created_time_ms: u64,
    operation: Option<Operation<T>>,
    sender: Option<oneshot::Sender<EventResult<T>>>,
}

impl<K, T> FutureEvent<K, T>
where
    K: Send,
    T: Send + 'static,
{
    pub fn new<F>(key: K, created_time_ms: u64, operation: F) -> (Self, EventCompletion<T>)
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        let event = Self {
            key,
            created_time_ms,
            operation: Some(Box::new(operation)),
            sender: Some(sender),
        };
        (event, EventCompletion { receiver })
    }

    fn resolve(&mut self, result: EventResult<T>) {
        self.operation = None;
        if let Some(sender) = self.sender.take() {
            // The originator may have stopped listening.
            let _ = sender.send(result);
        }
    }
}

impl<K, T> KeyedEvent<K> for FutureEvent<K, T> {
    fn key(&self) -> &K {
        &self.key
    }
}

impl<K, T> CoordinatorEvent<K> for FutureEvent<K, T>
where
    K: Send,
    T: Send + 'static,
{
    fn created_time_ms(&self) -> u64 {
        self.created_time_ms
    }

    fn run(&mut self) {
        let Some(operation) = self.operation.take() else {
            return;
        };
        let result = panic::catch_unwind(AssertUnwindSafe(operation)).map_err(|payload| {
            EventProcessorError::EventFailed {
                message: panic_message(payload.as_ref()),
            }
        });
        self.resolve(result);
    }

    fn complete(&mut self, error: EventProcessorError) {
        self.resolve(Err(error));
    }
}

impl<K: Debug, T> fmt::Debug for FutureEvent<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FutureEvent")
            .field("key", &self.key)
            .field("created_time_ms", &self.created_time_ms)
            .field("resolved", &self.sender.is_none())
            .finish()
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "event panicked".to_string()
    }
}
