//! Pooled dispatcher over an unbounded shared queue.
//!
//! N workers pull from one unbounded queue; `dispatch` never blocks. No
//! ordering guarantee is made across tasks from different producers, and
//! back-to-back tasks from one producer may interleave with others', but
//! each individual task executes atomically on exactly one worker. This is
//! the strategy to pick when ordering does not matter and maximum CPU
//! utilization does.

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

struct PoolInner {
    state: AtomicU8,
    queue: Mutex<VecDeque<Task>>,
    /// Signaled when work arrives or the lifecycle state changes.
    available: Condvar,
    /// Signaled when the pending count reaches zero.
    drained: Condvar,
    /// Tasks enqueued but not yet finished executing.
    pending: AtomicUsize,
}

impl PoolInner {
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

/// A dispatcher backed by a pool of worker threads.
pub struct ThreadPoolDispatcher {
    name: String,
    inner: Arc<PoolInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_ids: Vec<ThreadId>,
}

impl ThreadPoolDispatcher {
    /// Spawns a pool with the given number of worker threads.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::SpawnFailed` if a worker thread cannot be
    /// created.
    pub fn new(name: impl Into<String>, threads: usize) -> Result<Self, DispatchError> {
        let name = name.into();
        let threads = threads.max(1);

        let inner = Arc::new(PoolInner {
            state: AtomicU8::new(DispatcherState::Alive as u8),
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            drained: Condvar::new(),
            pending: AtomicUsize::new(0),
        });

        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads {
            let worker_inner = Arc::clone(&inner);
            let handle = thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || worker_loop(&worker_inner))
                .map_err(|e| DispatchError::SpawnFailed {
                    name: name.clone(),
                    message: e.to_string(),
                })?;
            workers.push(handle);
        }
        let worker_ids = workers.iter().map(|h| h.thread().id()).collect();

        tracing::debug!(%name, threads, "thread pool dispatcher started");

        Ok(Self {
            name,
            inner,
            workers: Mutex::new(workers),
            worker_ids,
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

    /// Returns true if the calling thread is one of this pool's workers.
    #[must_use]
    pub fn in_context(&self) -> bool {
        self.worker_ids.contains(&thread::current().id())
    }

    /// Returns the number of tasks enqueued or executing.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    /// Enqueues a task for execution. Never blocks.
    ///
    /// A task dispatched from one of this pool's own workers executes inline
    /// to avoid a redundant round trip through the queue.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Rejected` if the dispatcher is not alive.
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

        self.inner.pending.fetch_add(1, Ordering::AcqRel);
        self.inner.queue.lock().push_back(task);
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
    /// Returns true if every pending task executed, false on partial drain
    /// (remaining tasks are discarded so workers can exit).
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
        self.inner
            .pending
            .fetch_sub(leftover, Ordering::AcqRel);

        let drained = leftover == 0 && self.pending() == 0;
        if !drained {
            tracing::warn!(name = %self.name, leftover, "shutdown grace expired before drain");
        }

        self.inner
            .state
            .store(DispatcherState::Terminated as u8, Ordering::Release);
        self.inner.available.notify_all();
        self.join_workers();

        tracing::debug!(name = %self.name, drained, "thread pool dispatcher terminated");
        drained
    }

    /// Stops intake and discards not-yet-executing tasks. The in-flight task
    /// on each worker completes.
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
        self.join_workers();
    }

    fn join_workers(&self) {
        if self.in_context() {
            // A worker cannot join its own pool.
            return;
        }
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Drop for ThreadPoolDispatcher {
    fn drop(&mut self) {
        if self.state() == DispatcherState::Alive {
            self.halt();
        }
    }
}

impl std::fmt::Debug for ThreadPoolDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPoolDispatcher")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("pending", &self.pending())
            .finish()
    }
}

fn worker_loop(inner: &PoolInner) {
    loop {
        let task = {
            let mut queue = inner.queue.lock();
            loop {
                if let Some(task) = queue.pop_front() {
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    fn wait_for(counter: &AtomicU64, expected: u64, budget: Duration) {
        let deadline = Instant::now() + budget;
        while counter.load(Ordering::Acquire) < expected {
            assert!(Instant::now() < deadline, "tasks did not drain in time");
            thread::yield_now();
        }
    }

    #[test]
    fn test_executes_every_task() {
        let pool = ThreadPoolDispatcher::new("pool", 4).unwrap();
        let count = Arc::new(AtomicU64::new(0));

        for _ in 0..1_000 {
            let count = Arc::clone(&count);
            pool.dispatch(Task::new(move || {
                count.fetch_add(1, Ordering::AcqRel);
            }))
            .unwrap();
        }

        wait_for(&count, 1_000, Duration::from_secs(5));
        pool.shutdown();
        assert_eq!(count.load(Ordering::Acquire), 1_000);
    }

    #[test]
    fn test_shutdown_drains_pending() {
        let pool = ThreadPoolDispatcher::new("drain", 2).unwrap();
        let count = Arc::new(AtomicU64::new(0));

        for _ in 0..100 {
            let count = Arc::clone(&count);
            pool.dispatch(Task::new(move || {
                thread::sleep(Duration::from_micros(100));
                count.fetch_add(1, Ordering::AcqRel);
            }))
            .unwrap();
        }

        assert!(pool.shutdown_timeout(Duration::from_secs(10)));
        assert_eq!(count.load(Ordering::Acquire), 100);
        assert_eq!(pool.state(), DispatcherState::Terminated);
    }

    #[test]
    fn test_dispatch_after_shutdown_rejected() {
        let pool = ThreadPoolDispatcher::new("closed", 1).unwrap();
        pool.shutdown();

        let result = pool.dispatch(Task::new(|| {}));
        assert!(matches!(result, Err(DispatchError::Rejected { .. })));
    }

    #[test]
    fn test_halt_discards_pending() {
        let pool = ThreadPoolDispatcher::new("halt", 1).unwrap();
        let count = Arc::new(AtomicU64::new(0));

        // Stall the single worker so the rest of the queue stays pending.
        pool.dispatch(Task::new(|| thread::sleep(Duration::from_millis(100))))
            .unwrap();
        for _ in 0..50 {
            let count = Arc::clone(&count);
            pool.dispatch(Task::new(move || {
                count.fetch_add(1, Ordering::AcqRel);
            }))
            .unwrap();
        }

        pool.halt();
        assert!(count.load(Ordering::Acquire) < 50);
        assert_eq!(pool.state(), DispatcherState::Halted);
    }

    #[test]
    fn test_in_context() {
        let pool = Arc::new(ThreadPoolDispatcher::new("ctx", 2).unwrap());
        assert!(!pool.in_context());

        let observed = Arc::new(AtomicU64::new(0));
        let inner_pool = Arc::clone(&pool);
        let inner_observed = Arc::clone(&observed);
        pool.dispatch(Task::new(move || {
            if inner_pool.in_context() {
                inner_observed.store(1, Ordering::Release);
            }
        }))
        .unwrap();

        wait_for(&observed, 1, Duration::from_secs(5));
        pool.shutdown();
    }

    #[test]
    fn test_concurrent_producers_no_loss() {
        let pool = Arc::new(ThreadPoolDispatcher::new("mp", 4).unwrap());
        let count = Arc::new(AtomicU64::new(0));

        let mut producers = Vec::new();
        for _ in 0..4 {
            let pool = Arc::clone(&pool);
            let count = Arc::clone(&count);
            producers.push(thread::spawn(move || {
                for _ in 0..1_000 {
                    let count = Arc::clone(&count);
                    pool.dispatch(Task::new(move || {
                        count.fetch_add(1, Ordering::AcqRel);
                    }))
                    .unwrap();
                }
            }));
        }
        for p in producers {
            p.join().unwrap();
        }

        wait_for(&count, 4_000, Duration::from_secs(10));
        pool.shutdown();
        assert_eq!(count.load(Ordering::Acquire), 4_000);
    }
}
