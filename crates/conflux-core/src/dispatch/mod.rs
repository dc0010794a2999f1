//! Task dispatch strategies.
//!
//! A [`Dispatcher`] accepts [`Task`]s and executes them on its own threads.
//! Four strategies cover the ordering/throughput/backpressure trade-offs:
//!
//! - [`ThreadPoolDispatcher`]: N workers over an unbounded queue. Maximum
//!   concurrency, no ordering guarantee, no backpressure.
//! - [`WorkQueueDispatcher`]: N consumers over a bounded queue. Producers
//!   block when the queue is full.
//! - [`RingDispatcher`]: one consumer over a pre-allocated slot ring.
//!   Lowest per-task overhead; FIFO in single-producer mode.
//! - [`ActorDispatcher`]: a fixed set of ring shards routed by task key.
//!   Same-key tasks execute in order, different keys in parallel.
//!
//! Every strategy shares one lifecycle: [`DispatcherState::Alive`] accepts
//! work; `shutdown` moves through [`DispatcherState::ShuttingDown`] (drain)
//! to [`DispatcherState::Terminated`]; `halt` jumps straight to
//! [`DispatcherState::Halted`], discarding queued work. Dispatch against a
//! non-alive dispatcher fails fast with [`DispatchError::Rejected`].

mod actor;
mod config;
mod error;
mod ring;
mod task;
mod thread_pool;
mod work_queue;

use std::sync::Arc;
use std::time::Duration;

pub use actor::{ActorDispatcher, ShardSelector};
pub use config::{
    OverflowPolicy, ProducerMode, RingConfig, WaitStrategy, DEFAULT_RING_CAPACITY,
    DEFAULT_SHUTDOWN_GRACE, MAX_RING_CAPACITY, MIN_RING_CAPACITY,
};
pub use error::{DispatchError, StageError};
pub use ring::RingDispatcher;
pub use task::Task;
pub use thread_pool::ThreadPoolDispatcher;
pub use work_queue::WorkQueueDispatcher;

/// Lifecycle state of a dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DispatcherState {
    /// Accepting and executing tasks.
    Alive = 0,

    /// Intake closed; draining already-accepted tasks.
    ShuttingDown = 1,

    /// Fully stopped after a drain.
    Terminated = 2,

    /// Stopped abruptly; queued tasks were discarded.
    Halted = 3,
}

impl From<u8> for DispatcherState {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Alive,
            1 => Self::ShuttingDown,
            2 => Self::Terminated,
            _ => Self::Halted,
        }
    }
}

/// A dispatch strategy, closed over the four supported variants.
///
/// Pipelines hold `Arc<Dispatcher>` so stages can route follow-on work to
/// the dispatcher that carried them.
#[derive(Debug)]
pub enum Dispatcher {
    /// Worker pool over an unbounded queue.
    ThreadPool(ThreadPoolDispatcher),

    /// Consumers over a bounded blocking queue.
    WorkQueue(WorkQueueDispatcher),

    /// Single consumer over a pre-allocated slot ring.
    Ring(RingDispatcher),

    /// Key-sharded ring set.
    Actor(ActorDispatcher),
}

impl Dispatcher {
    /// Creates a shared thread pool dispatcher.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::SpawnFailed` if a worker cannot be spawned.
    pub fn thread_pool(
        name: impl Into<String>,
        threads: usize,
    ) -> Result<Arc<Self>, DispatchError> {
        Ok(Arc::new(Self::ThreadPool(ThreadPoolDispatcher::new(
            name, threads,
        )?)))
    }

    /// Creates a shared work queue dispatcher.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::SpawnFailed` if a consumer cannot be spawned.
    pub fn work_queue(
        name: impl Into<String>,
        consumers: usize,
        capacity: usize,
    ) -> Result<Arc<Self>, DispatchError> {
        Ok(Arc::new(Self::WorkQueue(WorkQueueDispatcher::new(
            name, consumers, capacity,
        )?)))
    }

    /// Creates a shared ring dispatcher.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::SpawnFailed` if the consumer cannot be
    /// spawned.
    pub fn ring(name: impl Into<String>, config: RingConfig) -> Result<Arc<Self>, DispatchError> {
        Ok(Arc::new(Self::Ring(RingDispatcher::new(name, config)?)))
    }

    /// Creates a shared actor dispatcher with the default hash selector.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::SpawnFailed` if a shard consumer cannot be
    /// spawned.
    pub fn actor(
        name: impl Into<String>,
        shards: usize,
        capacity: usize,
    ) -> Result<Arc<Self>, DispatchError> {
        Ok(Arc::new(Self::Actor(ActorDispatcher::new(
            name, shards, capacity,
        )?)))
    }

    /// Returns the dispatcher name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::ThreadPool(d) => d.name(),
            Self::WorkQueue(d) => d.name(),
            Self::Ring(d) => d.name(),
            Self::Actor(d) => d.name(),
        }
    }

    /// Returns the lifecycle state.
    #[must_use]
    pub fn state(&self) -> DispatcherState {
        match self {
            Self::ThreadPool(d) => d.state(),
            Self::WorkQueue(d) => d.state(),
            Self::Ring(d) => d.state(),
            Self::Actor(d) => d.state(),
        }
    }

    /// Returns true if the calling thread belongs to this dispatcher.
    ///
    /// Dispatch from inside the context executes inline, which keeps
    /// recursive stage-to-stage dispatch deadlock-free on bounded
    /// strategies.
    #[must_use]
    pub fn in_context(&self) -> bool {
        match self {
            Self::ThreadPool(d) => d.in_context(),
            Self::WorkQueue(d) => d.in_context(),
            Self::Ring(d) => d.in_context(),
            Self::Actor(d) => d.in_context(),
        }
    }

    /// Submits a task for execution.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Rejected` if the dispatcher is not alive, or
    /// `DispatchError::BufferFull` from a reject-on-full ring.
    pub fn dispatch(&self, task: Task) -> Result<(), DispatchError> {
        match self {
            Self::ThreadPool(d) => d.dispatch(task),
            Self::WorkQueue(d) => d.dispatch(task),
            Self::Ring(d) => d.dispatch(task),
            Self::Actor(d) => d.dispatch(task),
        }
    }

    /// Stops intake and drains accepted tasks within the default grace
    /// period.
    pub fn shutdown(&self) {
        match self {
            Self::ThreadPool(d) => d.shutdown(),
            Self::WorkQueue(d) => d.shutdown(),
            Self::Ring(d) => d.shutdown(),
            Self::Actor(d) => d.shutdown(),
        }
    }

    /// Stops intake and drains, waiting up to `grace`. Returns true if every
    /// accepted task executed.
    pub fn shutdown_timeout(&self, grace: Duration) -> bool {
        match self {
            Self::ThreadPool(d) => d.shutdown_timeout(grace),
            Self::WorkQueue(d) => d.shutdown_timeout(grace),
            Self::Ring(d) => d.shutdown_timeout(grace),
            Self::Actor(d) => d.shutdown_timeout(grace),
        }
    }

    /// Stops intake immediately, discarding tasks that have not started.
    pub fn halt(&self) {
        match self {
            Self::ThreadPool(d) => d.halt(),
            Self::WorkQueue(d) => d.halt(),
            Self::Ring(d) => d.halt(),
            Self::Actor(d) => d.halt(),
        }
    }
}
