//! Pre-allocated ring dispatcher with a single consumer thread.
//!
//! A fixed arena of power-of-two slots is allocated once at construction;
//! dispatch moves the task into a claimed slot and publishes it to the one
//! consumer thread, so the steady state allocates nothing per task. Slot
//! claiming uses a per-slot sequence counter: producers claim a slot by
//! advancing the write cursor, publish by bumping the slot sequence, and the
//! consumer frees the slot one full lap ahead. In single-producer mode the
//! write cursor advances with plain stores; in multi-producer mode with a
//! compare-and-advance.
//!
//! FIFO execution order is guaranteed in single-producer mode. The consumer
//! executes slots strictly in publish order either way.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::config::{OverflowPolicy, ProducerMode, RingConfig, WaitStrategy, DEFAULT_SHUTDOWN_GRACE};
use super::error::DispatchError;
use super::task::Task;
use super::DispatcherState;

/// Pads a value to a cache line boundary to prevent false sharing between
/// the producer and consumer cursors.
#[repr(C, align(64))]
struct CachePadded<T> {
    value: T,
}

impl<T> CachePadded<T> {
    const fn new(value: T) -> Self {
        Self { value }
    }
}

impl<T> Deref for CachePadded<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

/// One arena slot. The sequence encodes the slot's lap state:
/// `index` = free for the producer claiming `index`, `index + 1` = published,
/// `index + capacity` = free for the next lap.
struct Slot {
    sequence: AtomicU64,
    task: UnsafeCell<MaybeUninit<Task>>,
}

/// Spins briefly before yielding to the scheduler.
const SPINS_BEFORE_YIELD: u32 = 128;

struct RingInner {
    name: String,
    state: AtomicU8,
    slots: Box<[Slot]>,
    mask: u64,
    producer_mode: ProducerMode,
    wait_strategy: WaitStrategy,
    overflow: OverflowPolicy,

    /// Next slot index to claim. Cache-padded against the consumer cursor.
    tail: CachePadded<AtomicU64>,

    /// Next slot index to consume. Written only by the consumer thread.
    head: CachePadded<AtomicU64>,

    /// Tasks fully executed. Drives shutdown drain accounting.
    executed: CachePadded<AtomicU64>,

    /// Parking support for [`WaitStrategy::Blocking`].
    wait_lock: Mutex<()>,
    consumer_wake: Condvar,
    producer_wake: Condvar,
}

// SAFETY: the slot arena is UnsafeCell<MaybeUninit<Task>> and Task is Send.
// The sequence protocol hands each slot to exactly one thread at a time: a
// producer owns a slot between claim and publish, the consumer owns it
// between observing the published sequence and freeing it.
#[allow(unsafe_code)]
unsafe impl Send for RingInner {}

// SAFETY: see the Send rationale above; slot contents are never aliased.
#[allow(unsafe_code)]
unsafe impl Sync for RingInner {}

impl RingInner {
    fn state(&self) -> DispatcherState {
        DispatcherState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    fn capacity(&self) -> u64 {
        self.mask + 1
    }

    /// Claims a slot, writes the task, and publishes it.
    #[allow(unsafe_code)]
    fn publish(&self, task: Task) -> Result<(), DispatchError> {
        let mut tail = self.tail.load(Ordering::Relaxed);
        let mut spins = 0_u32;
        loop {
            #[allow(clippy::cast_possible_truncation)]
            let slot = &self.slots[(tail & self.mask) as usize];
            let sequence = slot.sequence.load(Ordering::Acquire);
            #[allow(clippy::cast_possible_wrap)]
            let lap = sequence.wrapping_sub(tail) as i64;

            if lap == 0 {
                // Slot is free for this cursor position; claim it.
                let claimed = match self.producer_mode {
                    ProducerMode::Single => {
                        self.tail.store(tail.wrapping_add(1), Ordering::Relaxed);
                        true
                    }
                    ProducerMode::Multi => self
                        .tail
                        .compare_exchange_weak(
                            tail,
                            tail.wrapping_add(1),
                            Ordering::AcqRel,
                            Ordering::Relaxed,
                        )
                        .is_ok(),
                };
                if claimed {
                    // SAFETY: the cursor advance above grants this thread
                    // exclusive ownership of the slot until the sequence
                    // store publishes it.
                    unsafe {
                        (*slot.task.get()).write(task);
                    }
                    slot.sequence
                        .store(tail.wrapping_add(1), Ordering::Release);
                    if self.wait_strategy == WaitStrategy::Blocking {
                        let _guard = self.wait_lock.lock();
                        self.consumer_wake.notify_one();
                    }
                    return Ok(());
                }
                tail = self.tail.load(Ordering::Relaxed);
            } else if lap < 0 {
                // The consumer has not freed this slot yet: the ring is full.
                if self.overflow == OverflowPolicy::Reject {
                    return Err(DispatchError::BufferFull {
                        name: self.name.clone(),
                    });
                }
                let state = self.state();
                if state != DispatcherState::Alive {
                    return Err(DispatchError::Rejected {
                        name: self.name.clone(),
                        state,
                    });
                }
                self.producer_wait(&mut spins);
                tail = self.tail.load(Ordering::Relaxed);
            } else {
                // Another producer claimed this slot first.
                tail = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    fn producer_wait(&self, spins: &mut u32) {
        match self.wait_strategy {
            WaitStrategy::BusySpin => std::hint::spin_loop(),
            WaitStrategy::Yielding => {
                if *spins < SPINS_BEFORE_YIELD {
                    *spins += 1;
                    std::hint::spin_loop();
                } else {
                    thread::yield_now();
                }
            }
            WaitStrategy::Blocking => {
                let mut guard = self.wait_lock.lock();
                // Bounded wait so a missed wakeup cannot strand the producer.
                self.producer_wake
                    .wait_for(&mut guard, Duration::from_millis(10));
            }
        }
    }

    fn consumer_wait(&self, spins: &mut u32) {
        match self.wait_strategy {
            WaitStrategy::BusySpin => std::hint::spin_loop(),
            WaitStrategy::Yielding => {
                if *spins < SPINS_BEFORE_YIELD {
                    *spins += 1;
                    std::hint::spin_loop();
                } else {
                    thread::yield_now();
                }
            }
            WaitStrategy::Blocking => {
                let mut guard = self.wait_lock.lock();
                let head = self.head.load(Ordering::Relaxed);
                #[allow(clippy::cast_possible_truncation)]
                let slot = &self.slots[(head & self.mask) as usize];
                if slot.sequence.load(Ordering::Acquire) != head.wrapping_add(1) {
                    self.consumer_wake
                        .wait_for(&mut guard, Duration::from_millis(10));
                }
            }
        }
    }

    fn wake_all(&self) {
        let _guard = self.wait_lock.lock();
        self.consumer_wake.notify_all();
        self.producer_wake.notify_all();
    }

    /// Published-but-unconsumed slot count. Approximate outside the consumer.
    fn backlog(&self) -> u64 {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }
}

impl Drop for RingInner {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        // Drop any tasks published but never consumed (halt, or an expired
        // shutdown grace period).
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        for index in head..tail {
            #[allow(clippy::cast_possible_truncation)]
            let slot = &self.slots[(index & self.mask) as usize];
            if slot.sequence.load(Ordering::Relaxed) == index.wrapping_add(1) {
                // SAFETY: sequence == index + 1 means the slot holds a
                // published task nothing else will touch; we have &mut self.
                unsafe {
                    (*slot.task.get()).assume_init_drop();
                }
            }
        }
    }
}

/// A dispatcher over a pre-allocated slot ring and one consumer thread.
pub struct RingDispatcher {
    name: String,
    inner: Arc<RingInner>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    consumer_id: ThreadId,
}

impl RingDispatcher {
    /// Allocates the slot arena and spawns the consumer thread.
    ///
    /// The configured capacity is clamped and rounded up to a power of two.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::SpawnFailed` if the consumer thread cannot be
    /// created.
    pub fn new(name: impl Into<String>, config: RingConfig) -> Result<Self, DispatchError> {
        let name = name.into();
        let capacity = config.effective_capacity();

        let slots: Vec<Slot> = (0..capacity)
            .map(|i| Slot {
                sequence: AtomicU64::new(i as u64),
                task: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();

        let inner = Arc::new(RingInner {
            name: name.clone(),
            state: AtomicU8::new(DispatcherState::Alive as u8),
            slots: slots.into_boxed_slice(),
            mask: capacity as u64 - 1,
            producer_mode: config.producer_mode,
            wait_strategy: config.wait_strategy,
            overflow: config.overflow,
            tail: CachePadded::new(AtomicU64::new(0)),
            head: CachePadded::new(AtomicU64::new(0)),
            executed: CachePadded::new(AtomicU64::new(0)),
            wait_lock: Mutex::new(()),
            consumer_wake: Condvar::new(),
            producer_wake: Condvar::new(),
        });

        let consumer_inner = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name(format!("{name}-consumer"))
            .spawn(move || consumer_loop(&consumer_inner))
            .map_err(|e| DispatchError::SpawnFailed {
                name: name.clone(),
                message: e.to_string(),
            })?;
        let consumer_id = handle.thread().id();

        tracing::debug!(
            %name,
            capacity,
            producer_mode = ?config.producer_mode,
            wait_strategy = ?config.wait_strategy,
            "ring dispatcher started"
        );

        Ok(Self {
            name,
            inner,
            consumer: Mutex::new(Some(handle)),
            consumer_id,
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

    /// Returns the effective slot capacity.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn capacity(&self) -> usize {
        self.inner.capacity() as usize
    }

    /// Returns true if the calling thread is this ring's consumer.
    #[must_use]
    pub fn in_context(&self) -> bool {
        thread::current().id() == self.consumer_id
    }

    /// Returns the number of published tasks not yet consumed.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn pending(&self) -> usize {
        self.inner.backlog() as usize
    }

    /// Moves a task into a ring slot for the consumer thread.
    ///
    /// When the ring is full, behavior follows the configured
    /// [`OverflowPolicy`]: block until a slot frees, or fail fast. A task
    /// dispatched from the consumer thread itself executes inline; parking
    /// the consumer on its own full ring would deadlock, and inline
    /// execution also keeps a single-producer ring single-producer when a
    /// stage re-dispatches downstream work.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Rejected` if the dispatcher is not alive, or
    /// `DispatchError::BufferFull` under [`OverflowPolicy::Reject`].
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

        self.inner.publish(task)
    }

    /// Stops intake and drains published tasks, waiting up to the default
    /// grace period.
    pub fn shutdown(&self) {
        self.shutdown_timeout(DEFAULT_SHUTDOWN_GRACE);
    }

    /// Stops intake and drains, waiting up to `grace`.
    ///
    /// Returns true if every published task executed.
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
            return self.inner.backlog() == 0;
        }
        self.inner.wake_all();

        let deadline = Instant::now() + grace;
        loop {
            let tail = self.inner.tail.load(Ordering::Acquire);
            if self.inner.executed.load(Ordering::Acquire) >= tail {
                break;
            }
            if Instant::now() >= deadline {
                break;
            }
            thread::yield_now();
        }

        let leftover = self.inner.backlog();
        let drained = leftover == 0;
        if !drained {
            tracing::warn!(name = %self.name, leftover, "shutdown grace expired before drain");
        }

        self.inner
            .state
            .store(DispatcherState::Terminated as u8, Ordering::Release);
        self.inner.wake_all();
        self.join_consumer();

        drained
    }

    /// Stops intake and discards published-but-unconsumed tasks. The task
    /// in flight on the consumer completes.
    pub fn halt(&self) {
        self.inner
            .state
            .store(DispatcherState::Halted as u8, Ordering::Release);
        self.inner.wake_all();
        self.join_consumer();

        let discarded = self.inner.backlog();
        if discarded > 0 {
            tracing::warn!(name = %self.name, discarded, "halt discarded pending tasks");
        }
    }

    fn join_consumer(&self) {
        if self.in_context() {
            return;
        }
        if let Some(handle) = self.consumer.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RingDispatcher {
    fn drop(&mut self) {
        if self.state() == DispatcherState::Alive {
            self.halt();
        }
    }
}

impl std::fmt::Debug for RingDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingDispatcher")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("capacity", &self.capacity())
            .field("pending", &self.pending())
            .finish()
    }
}

#[allow(unsafe_code)]
fn consumer_loop(inner: &RingInner) {
    let mut spins = 0_u32;
    loop {
        let head = inner.head.load(Ordering::Relaxed);
        #[allow(clippy::cast_possible_truncation)]
        let slot = &inner.slots[(head & inner.mask) as usize];

        if slot.sequence.load(Ordering::Acquire) == head.wrapping_add(1) {
            // SAFETY: the published sequence hands the slot to the consumer;
            // the task is moved out before the slot is freed below.
            let task = unsafe { (*slot.task.get()).assume_init_read() };
            inner.head.store(head.wrapping_add(1), Ordering::Release);
            // Free the slot for the producer one lap ahead.
            slot.sequence
                .store(head.wrapping_add(inner.capacity()), Ordering::Release);
            if inner.wait_strategy == WaitStrategy::Blocking {
                let _guard = inner.wait_lock.lock();
                inner.producer_wake.notify_all();
            }

            task.execute();
            inner.executed.fetch_add(1, Ordering::AcqRel);
            spins = 0;
            continue;
        }

        match inner.state() {
            DispatcherState::Alive => inner.consumer_wait(&mut spins),
            DispatcherState::ShuttingDown => {
                // Keep draining until the claimed cursor is fully consumed.
                if inner.backlog() == 0 {
                    return;
                }
                inner.consumer_wait(&mut spins);
            }
            DispatcherState::Terminated | DispatcherState::Halted => return,
        }
    }
}
