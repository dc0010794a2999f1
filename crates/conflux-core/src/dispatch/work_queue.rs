//! Bounded work queue dispatcher with producer backpressure.
//!
//! A fixed pool of N consumer threads pulls from one bounded queue of
//! capacity C. `dispatch` blocks once the queue is full until a slot frees;
//! this is the system's only producer-blocking backpressure mechanism. The
//! queue is FIFO, but because multiple consumers drain concurrently,
//! completion order across tasks is only guaranteed up to the point of
//! dequeue. Use this strategy when total in-flight task memory must be
//! capped.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::config::DEFAULT_SHUTDOWN_GRACE;
use super::error::DispatchError;
use super::task::Task;
use super::DispatcherState;

struct QueueInner {
    state: AtomicU8,
    capacity: usize,
    queue: Mutex<VecDeque<Task>>,
    /// Signaled when work arrives or the lifecycle state changes.
    available: Condvar,
    /// Signaled when a slot frees up for blocked producers.
    not_full: Condvar,
    /// Signaled when the pending count reaches zero.
    drained: Condvar,
    /// Tasks enqueued but not yet finished executing.
    pending: AtomicUsize,
}

impl QueueInner {
    fn state(&self) -> DispatcherState {
        DispatcherState::from(self.state.load(Ordering::Acquire))
    }

    fn finish_task(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _guard = self.queue.lock();
            self.drained.notify_all();
        }
    }
}

/// A dispatcher backed by N consumers over one bounded queue.
pub struct WorkQueueDispatcher {
    name: String,
    inner: Arc<QueueInner>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
    consumer_ids: Vec<ThreadId>,
}

impl WorkQueueDispatcher {
    /// Spawns `consumers` threads over a bounded queue of `capacity` tasks.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::SpawnFailed` if a consumer thread cannot be
    /// created.
    pub fn new(
        name: impl Into<String>,
        consumers: usize,
        capacity: usize,
    ) -> Result<Self, DispatchError> {
        let name = name.into();
        let consumers = consumers.max(1);
        let capacity = capacity.max(1);

        let inner = Arc::new(QueueInner {
            state: AtomicU8::new(DispatcherState::Alive as u8),
            capacity,
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            available: Condvar::new(),
            not_full: Condvar::new(),
            drained: Condvar::new(),
            pending: AtomicUsize::new(0),
        });

        let mut handles = Vec::with_capacity(consumers);
        for index in 0..consumers {
            let consumer_inner = Arc::clone(&inner);
            let handle = thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || consumer_loop(&consumer_inner))
                .map_err(|e| DispatchError::SpawnFailed {
                    name: name.clone(),
                    message: e.to_string(),
                })?;
            handles.push(handle);
        }
        let consumer_ids = handles.iter().map(|h| h.thread().id()).collect();

        tracing::debug!(%name, consumers, capacity, "work queue dispatcher started");

        Ok(Self {
            name,
            inner,
            consumers: Mutex::new(handles),
            consumer_ids,
        })
    }

    /// Returns the dispatcher name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the lifecycle state.
    #[must_use]
    pub fn state(&self) -> DispatcherState {
        self.inner.state()
    }

    /// Returns the queue capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Returns true if the calling thread is one of this queue's consumers.
    #[must_use]
    pub fn in_context(&self) -> bool {
        self.consumer_ids.contains(&thread::current().id())
    }

    /// Returns the number of tasks enqueued or executing.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    /// Enqueues a task, blocking while the queue is full (backpressure).
    ///
    /// Tasks are never silently dropped: the producer either enqueues or
    /// learns the dispatcher stopped. A task dispatched from one of this
    /// queue's own consumers executes inline, which also makes recursive
    /// dispatch against a full queue deadlock-free.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Rejected` if the dispatcher is not alive, or
    /// stops being alive while the producer is blocked.
    pub fn dispatch(&self, task: Task) -> Result<(), DispatchError> {
        let state = self.state();
        if state != DispatcherState::Alive {
            return Err(DispatchError::Rejected {
                name: self.name.clone(),
                state,
            });
        }

        if self.in_context() {
            task.execute();
            return Ok(());
        }

        let mut queue = self.inner.queue.lock();
        while queue.len() >= self.inner.capacity {
            let state = self.inner.state();
            if state != DispatcherState::Alive {
                return Err(DispatchError::Rejected {
                    name: self.name.clone(),
                    state,
                });
            }
            self.inner.not_full.wait(&mut queue);
        }
        self.inner.pending.fetch_add(1, Ordering::AcqRel);
        queue.push_back(task);
        drop(queue);
        self.inner.available.notify_one();
        Ok(())
    }

    /// Stops intake and drains already-enqueued tasks, waiting up to the
    /// default grace period.
    pub fn shutdown(&self) {
        self.shutdown_timeout(DEFAULT_SHUTDOWN_GRACE);
    }

    /// Stops intake and drains, waiting up to `grace`.
    ///
    /// Returns true if every pending task executed.
    pub fn shutdown_timeout(&self, grace: Duration) -> bool {
        if self
            .inner
            .state
            .compare_exchange(
                DispatcherState::Alive as u8,
                DispatcherState::ShuttingDown as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return self.pending() == 0;
        }
        self.inner.available.notify_all();
        self.inner.not_full.notify_all();

        let deadline = Instant::now() + grace;
        let mut queue = self.inner.queue.lock();
        while self.inner.pending.load(Ordering::Acquire) > 0 {
            if self
                .inner
                .drained
                .wait_until(&mut queue, deadline)
                .timed_out()
            {
                break;
            }
        }
        let leftover = queue.len();
        queue.clear();
        drop(queue);
        self.inner.pending.fetch_sub(leftover, Ordering::AcqRel);

        let drained = leftover == 0 && self.pending() == 0;
        if !drained {
            tracing::warn!(name = %self.name, leftover, "shutdown grace expired before drain");
        }

        self.inner
            .state
            .store(DispatcherState::Terminated as u8, Ordering::Release);
        self.inner.available.notify_all();
        self.inner.not_full.notify_all();
        self.join_consumers();

        drained
    }

    /// Stops intake and discards not-yet-executing tasks. In-flight tasks
    /// complete.
    pub fn halt(&self) {
        self.inner
            .state
            .store(DispatcherState::Halted as u8, Ordering::Release);

        let discarded = {
            let mut queue = self.inner.queue.lock();
            let n = queue.len();
            queue.clear();
            n
        };
        self.inner.pending.fetch_sub(discarded, Ordering::AcqRel);
        if discarded > 0 {
            tracing::warn!(name = %self.name, discarded, "halt discarded pending tasks");
        }

        self.inner.available.notify_all();
        self.inner.not_full.notify_all();
        self.join_consumers();
    }

    fn join_consumers(&self) {
        if self.in_context() {
            return;
        }
        let handles: Vec<_> = self.consumers.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkQueueDispatcher {
    fn drop(&mut self) {
        if self.state() == DispatcherState::Alive {
            self.halt();
        }
    }
}

impl std::fmt::Debug for WorkQueueDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueueDispatcher")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("capacity", &self.inner.capacity)
            .field("pending", &self.pending())
            .finish()
    }
}

fn consumer_loop(inner: &QueueInner) {
    loop {
        let task = {
            let mut queue = inner.queue.lock();
            loop {
                if let Some(task) = queue.pop_front() {
                    inner.not_full.notify_one();
                    break Some(task);
                }
                if inner.state() != DispatcherState::Alive {
                    break None;
                }
                inner.available.wait(&mut queue);
            }
        };

        match task {
            Some(task) => {
                task.execute();
                inner.finish_task();
            }
            None => return,
        }
    }
}
