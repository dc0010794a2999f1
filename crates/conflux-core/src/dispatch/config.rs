//! Dispatcher configuration types.

use std::time::Duration;

/// Default ring capacity (entries, power of two).
pub const DEFAULT_RING_CAPACITY: usize = 2048;

/// Minimum ring capacity.
pub const MIN_RING_CAPACITY: usize = 4;

/// Maximum ring capacity (prevent excessive memory usage).
pub const MAX_RING_CAPACITY: usize = 1 << 20;

/// Default grace period for [`shutdown`](crate::dispatch::Dispatcher::shutdown).
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// What a waiting thread does when it has nothing to do.
///
/// Governs the ring consumer when no slot is published and a blocked
/// producer when the buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitStrategy {
    /// Spin-loop without yielding (lowest latency, highest CPU).
    BusySpin,

    /// Spin briefly, then yield to the OS scheduler (balanced).
    #[default]
    Yielding,

    /// Park on a condition variable until signaled (lowest CPU).
    Blocking,
}

/// Who is allowed to publish into a ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProducerMode {
    /// Exactly one thread ever calls `dispatch`. The write cursor advances
    /// with plain loads and stores, no read-modify-write on the hot path.
    Single,

    /// Any number of threads may call `dispatch`; slots are claimed with an
    /// atomic compare-and-advance.
    #[default]
    Multi,
}

/// What `dispatch` does when a bounded ring is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Block the producer until a slot frees.
    #[default]
    Block,

    /// Fail fast with `DispatchError::BufferFull`.
    Reject,
}

/// Configuration for a ring dispatcher.
#[derive(Debug, Clone)]
pub struct RingConfig {
    /// Requested capacity (clamped and rounded up to a power of two).
    pub capacity: usize,

    /// Producer mode.
    pub producer_mode: ProducerMode,

    /// Consumer wait strategy.
    pub wait_strategy: WaitStrategy,

    /// Full-buffer policy.
    pub overflow: OverflowPolicy,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_RING_CAPACITY,
            producer_mode: ProducerMode::default(),
            wait_strategy: WaitStrategy::default(),
            overflow: OverflowPolicy::default(),
        }
    }
}

impl RingConfig {
    /// Creates a configuration with the given capacity and defaults elsewhere.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    /// Sets the producer mode.
    #[must_use]
    pub fn producer_mode(mut self, mode: ProducerMode) -> Self {
        self.producer_mode = mode;
        self
    }

    /// Sets the consumer wait strategy.
    #[must_use]
    pub fn wait_strategy(mut self, strategy: WaitStrategy) -> Self {
        self.wait_strategy = strategy;
        self
    }

    /// Sets the full-buffer policy.
    #[must_use]
    pub fn overflow(mut self, policy: OverflowPolicy) -> Self {
        self.overflow = policy;
        self
    }

    /// Returns the effective capacity (clamped, rounded to a power of two).
    #[must_use]
    pub fn effective_capacity(&self) -> usize {
        self.capacity
            .clamp(MIN_RING_CAPACITY, MAX_RING_CAPACITY)
            .next_power_of_two()
    }
}
