//! Pipeline stage composition.
//!
//! A [`Composable`] is a cheap-clone handle on one pipeline stage: a bound
//! dispatcher, the downstream adapters attached by operators, and the
//! stage's terminal phase. Operators (`map`, `filter`, `reduce`,
//! `map_many`) create a new downstream stage and register an adapter on the
//! upstream one; each value hop between stages goes through the downstream
//! stage's dispatcher, executing inline when the caller is already on it.
//!
//! Attachment must happen before values flow: operators attach their
//! adapters synchronously at call time, so building the whole pipeline
//! before accepting the first value (which every builder in this crate
//! enforces) guarantees no value can slip past an adapter.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;

use crate::dispatch::{Dispatcher, StageError, Task};

use super::promise::Promise;

/// What flows between stages.
#[derive(Debug)]
pub enum Signal<T> {
    /// A data value.
    Value(T),

    /// A stage failure; terminal for the receiving stage.
    Error(StageError),

    /// End of input; terminal for the receiving stage.
    Complete,
}

/// Terminal phase of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    /// Accepting values.
    Open = 0,

    /// Received `Complete`.
    Completed = 1,

    /// Received an `Error`.
    Failed = 2,
}

impl From<u8> for Phase {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Open,
            1 => Self::Completed,
            _ => Self::Failed,
        }
    }
}

type Adapter<T> = Box<dyn Fn(Signal<T>) + Send + Sync>;
type ValueConsumer<T> = Box<dyn Fn(T) + Send + Sync>;
type ErrorConsumer = Box<dyn Fn(&StageError) + Send + Sync>;

struct StageInner<T> {
    dispatcher: Arc<Dispatcher>,
    batch_size: Option<usize>,
    /// Operator links: forward every signal to a downstream stage.
    adapters: RwLock<SmallVec<[Adapter<T>; 2]>>,
    /// Terminal sinks: receive values only, never terminal signals.
    value_consumers: RwLock<SmallVec<[ValueConsumer<T>; 1]>>,
    error_consumers: RwLock<SmallVec<[ErrorConsumer; 1]>>,
    accepted: AtomicU64,
    phase: AtomicU8,
}

/// A handle on one pipeline stage.
pub struct Composable<T> {
    inner: Arc<StageInner<T>>,
}

impl<T> Clone for Composable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Dispatches `body` on `stage`'s dispatcher, routing a panic into the
/// stage's error channel. A rejected dispatch (dispatcher shut down under
/// the pipeline) drops the signal with a warning.
fn hop<R: Clone + Send + 'static>(stage: &Composable<R>, body: impl FnOnce() + Send + 'static) {
    let sink = stage.clone();
    let outcome = stage.inner.dispatcher.dispatch(
        Task::new(body).with_error_sink(move |error| sink.notify(Signal::Error(error))),
    );
    if let Err(error) = outcome {
        tracing::warn!(%error, "downstream dispatch rejected; signal dropped");
    }
}

impl<T: Clone + Send + 'static> Composable<T> {
    pub(crate) fn new(dispatcher: Arc<Dispatcher>, batch_size: Option<usize>) -> Self {
        Self {
            inner: Arc::new(StageInner {
                dispatcher,
                batch_size,
                adapters: RwLock::new(SmallVec::new()),
                value_consumers: RwLock::new(SmallVec::new()),
                error_consumers: RwLock::new(SmallVec::new()),
                accepted: AtomicU64::new(0),
                phase: AtomicU8::new(Phase::Open as u8),
            }),
        }
    }

    /// Returns the dispatcher this stage runs on.
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.inner.dispatcher
    }

    /// Returns the configured batch size, if any.
    #[must_use]
    pub fn batch_size(&self) -> Option<usize> {
        self.inner.batch_size
    }

    /// Returns the stage's terminal phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        Phase::from(self.inner.phase.load(Ordering::Acquire))
    }

    /// Returns how many values this stage has accepted.
    #[must_use]
    pub fn accepted(&self) -> u64 {
        self.inner.accepted.load(Ordering::Acquire)
    }

    pub(crate) fn attach(&self, adapter: impl Fn(Signal<T>) + Send + Sync + 'static) {
        self.inner.adapters.write().push(Box::new(adapter));
    }

    /// Routes a signal through this stage's own dispatcher.
    pub(crate) fn dispatch_signal(
        &self,
        signal: Signal<T>,
    ) -> Result<(), crate::dispatch::DispatchError> {
        let stage = self.clone();
        let sink = self.clone();
        self.inner.dispatcher.dispatch(
            Task::new(move || stage.notify(signal))
                .with_error_sink(move |error| sink.notify(Signal::Error(error))),
        )
    }

    /// Applies a signal to this stage on the current thread.
    ///
    /// Values after a terminal signal are dropped. Error and Complete each
    /// take effect at most once.
    pub(crate) fn notify(&self, signal: Signal<T>) {
        match signal {
            Signal::Value(value) => {
                if self.phase() != Phase::Open {
                    tracing::trace!("value dropped after terminal signal");
                    return;
                }
                self.inner.accepted.fetch_add(1, Ordering::AcqRel);
                let adapters = self.inner.adapters.read();
                let consumers = self.inner.value_consumers.read();
                // The last recipient takes the value by move.
                if let Some((last, rest)) = adapters.split_last() {
                    for consumer in consumers.iter() {
                        consumer(value.clone());
                    }
                    for adapter in rest {
                        adapter(Signal::Value(value.clone()));
                    }
                    last(Signal::Value(value));
                } else if let Some((last, rest)) = consumers.split_last() {
                    for consumer in rest {
                        consumer(value.clone());
                    }
                    last(value);
                }
            }
            Signal::Error(error) => {
                if self
                    .inner
                    .phase
                    .compare_exchange(
                        Phase::Open as u8,
                        Phase::Failed as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_err()
                {
                    return;
                }
                let consumers = self.inner.error_consumers.read();
                let adapters = self.inner.adapters.read();
                // Value consumers ignore the error channel, so a stage with
                // only `consume` sinks still counts as unhandled here.
                if consumers.is_empty() && adapters.is_empty() {
                    tracing::error!(%error, "unhandled pipeline error");
                }
                for consumer in consumers.iter() {
                    consumer(&error);
                }
                for adapter in adapters.iter() {
                    adapter(Signal::Error(error.clone()));
                }
            }
            Signal::Complete => {
                if self
                    .inner
                    .phase
                    .compare_exchange(
                        Phase::Open as u8,
                        Phase::Completed as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_err()
                {
                    return;
                }
                let adapters = self.inner.adapters.read();
                for adapter in adapters.iter() {
                    adapter(Signal::Complete);
                }
            }
        }
    }

    fn next_stage<R: Clone + Send + 'static>(&self) -> Composable<R> {
        Composable::new(Arc::clone(&self.inner.dispatcher), self.inner.batch_size)
    }

    /// Forwards a terminal signal to a downstream stage through its
    /// dispatcher, keeping it ordered behind in-flight value hops on FIFO
    /// dispatchers.
    fn forward_terminal<R: Clone + Send + 'static>(next: &Composable<R>, signal: Signal<R>) {
        let target = next.clone();
        hop(next, move || target.notify(signal));
    }

    /// Adds a transformation stage.
    ///
    /// `f` runs on the downstream stage's dispatcher. A panicking `f` is
    /// captured and routed down the error channel as a [`StageError`].
    pub fn map<R, F>(&self, f: F) -> Composable<R>
    where
        R: Clone + Send + 'static,
        F: Fn(T) -> R + Send + Sync + 'static,
    {
        let downstream = self.next_stage::<R>();
        let next = downstream.clone();
        let f = Arc::new(f);
        self.attach(move |signal| match signal {
            Signal::Value(value) => {
                let f = Arc::clone(&f);
                let target = next.clone();
                hop(&next, move || target.notify(Signal::Value(f(value))));
            }
            Signal::Error(error) => Self::forward_terminal(&next, Signal::Error(error)),
            Signal::Complete => Self::forward_terminal(&next, Signal::Complete),
        });
        downstream
    }

    /// Adds a predicate stage. Values failing the predicate are dropped
    /// silently; a panicking predicate is an error.
    pub fn filter<F>(&self, predicate: F) -> Composable<T>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let downstream = self.next_stage::<T>();
        let next = downstream.clone();
        let predicate = Arc::new(predicate);
        self.attach(move |signal| match signal {
            Signal::Value(value) => {
                let predicate = Arc::clone(&predicate);
                let target = next.clone();
                hop(&next, move || {
                    if predicate(&value) {
                        target.notify(Signal::Value(value));
                    }
                });
            }
            Signal::Error(error) => Self::forward_terminal(&next, Signal::Error(error)),
            Signal::Complete => Self::forward_terminal(&next, Signal::Complete),
        });
        downstream
    }

    /// Adds a windowed fold stage.
    ///
    /// The accumulator starts at `initial` and folds every arriving value.
    /// With `Some(window)` the accumulator is emitted and reset every
    /// `window` values; `None` falls back to the stage's batch size, and
    /// with neither the fold only emits on `Complete`. A partial final
    /// window is emitted at completion before `Complete` is forwarded.
    pub fn reduce<R, F>(&self, f: F, initial: R, window: Option<usize>) -> Composable<R>
    where
        R: Clone + Send + 'static,
        F: Fn(R, T) -> R + Send + Sync + 'static,
    {
        let downstream = self.next_stage::<R>();
        let next = downstream.clone();
        let f = Arc::new(f);
        let window = window.or(self.inner.batch_size);
        // `initial` lives inside the mutex so the adapter stays `Sync` for
        // accumulators that are only `Send`.
        let fold = Arc::new(Mutex::new(FoldState::<R> {
            initial,
            accumulator: None,
            count: 0,
        }));

        self.attach(move |signal| match signal {
            Signal::Value(value) => {
                let f = Arc::clone(&f);
                let fold = Arc::clone(&fold);
                let target = next.clone();
                hop(&next, move || {
                    let emitted = {
                        let mut state = fold.lock();
                        let seed = state.accumulator.take();
                        let accumulator =
                            f(seed.unwrap_or_else(|| state.initial.clone()), value);
                        state.count += 1;
                        if window.is_some_and(|w| state.count >= w) {
                            state.count = 0;
                            Some(accumulator)
                        } else {
                            state.accumulator = Some(accumulator);
                            None
                        }
                    };
                    if let Some(accumulator) = emitted {
                        target.notify(Signal::Value(accumulator));
                    }
                });
            }
            Signal::Error(error) => Self::forward_terminal(&next, Signal::Error(error)),
            Signal::Complete => {
                let fold = Arc::clone(&fold);
                let target = next.clone();
                hop(&next, move || {
                    let partial = {
                        let mut state = fold.lock();
                        state.count = 0;
                        state.accumulator.take()
                    };
                    if let Some(accumulator) = partial {
                        target.notify(Signal::Value(accumulator));
                    }
                    target.notify(Signal::Complete);
                });
            }
        });
        downstream
    }

    /// Adds a flat-map stage: `f` returns a [`Promise`] whose resolution is
    /// flattened into the downstream stage.
    ///
    /// Each nested promise may resolve on any thread (typically another
    /// pipeline's dispatcher); resolution order across promises is not
    /// constrained. A rejected promise flows down the error channel.
    /// `Complete` is held back until every nested promise in flight has
    /// resolved, so late resolutions are never dropped by a downstream
    /// stage that already saw end of input.
    pub fn map_many<R, F>(&self, f: F) -> Composable<R>
    where
        R: Clone + Send + 'static,
        F: Fn(T) -> Promise<R> + Send + Sync + 'static,
    {
        let downstream = self.next_stage::<R>();
        let next = downstream.clone();
        let f = Arc::new(f);
        let flights = Arc::new(FlightTracker::new());
        self.attach(move |signal| match signal {
            Signal::Value(value) => {
                // Counted before the hop so a racing `Complete` on another
                // worker cannot observe zero in flight.
                flights.launch();
                let f = Arc::clone(&f);
                let flights = Arc::clone(&flights);
                let outer = next.clone();
                hop(&next, move || {
                    let promise = f(value);
                    let resolved = outer.clone();
                    promise.on_resolve(move |result| {
                        let target = resolved.clone();
                        match result {
                            Ok(value) => {
                                hop(&resolved, move || {
                                    target.notify(Signal::Value(value));
                                    if flights.settle() {
                                        target.notify(Signal::Complete);
                                    }
                                });
                            }
                            Err(error) => {
                                hop(&resolved, move || {
                                    target.notify(Signal::Error(error));
                                    if flights.settle() {
                                        target.notify(Signal::Complete);
                                    }
                                });
                            }
                        }
                    });
                });
            }
            Signal::Error(error) => Self::forward_terminal(&next, Signal::Error(error)),
            Signal::Complete => {
                if flights.complete() {
                    Self::forward_terminal(&next, Signal::Complete);
                }
            }
        });
        downstream
    }

    /// Attaches a terminal value consumer, invoked once per value reaching
    /// this stage, on this stage's dispatcher thread.
    pub fn consume<F>(&self, consumer: F) -> Composable<T>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        self.inner.value_consumers.write().push(Box::new(consumer));
        self.clone()
    }

    /// Attaches an error-channel consumer for failures reaching this stage.
    pub fn consume_error<F>(&self, consumer: F) -> Composable<T>
    where
        F: Fn(&StageError) + Send + Sync + 'static,
    {
        self.inner.error_consumers.write().push(Box::new(consumer));
        self.clone()
    }
}

struct FoldState<R> {
    initial: R,
    accumulator: Option<R>,
    count: usize,
}

/// Tracks nested promises still in flight through a `map_many` stage.
///
/// SeqCst on both fields: `complete` and the final `settle` may race on
/// different workers, and exactly one of them must observe the state that
/// makes it forward `Complete` (a duplicate forward is a no-op downstream).
struct FlightTracker {
    in_flight: AtomicU64,
    completed: AtomicBool,
}

impl FlightTracker {
    fn new() -> Self {
        Self {
            in_flight: AtomicU64::new(0),
            completed: AtomicBool::new(false),
        }
    }

    fn launch(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    /// Records one resolution; true when this was the last one in flight
    /// after end of input.
    fn settle(&self) -> bool {
        self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 && self.completed.load(Ordering::SeqCst)
    }

    /// Records end of input; true when nothing is in flight.
    fn complete(&self) -> bool {
        self.completed.store(true, Ordering::SeqCst);
        self.in_flight.load(Ordering::SeqCst) == 0
    }
}

impl<T> std::fmt::Debug for Composable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Composable")
            .field("dispatcher", &self.inner.dispatcher.name())
            .field("phase", &Phase::from(self.inner.phase.load(Ordering::Acquire)))
            .field("accepted", &self.inner.accepted.load(Ordering::Acquire))
            .field("batch_size", &self.inner.batch_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::RingConfig;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::{Duration, Instant};

    fn ring() -> Arc<Dispatcher> {
        Dispatcher::ring("stage-ring", RingConfig::with_capacity(256)).unwrap()
    }

    fn wait_until(budget: Duration, condition: impl Fn() -> bool) {
        let deadline = Instant::now() + budget;
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met in time");
            thread::yield_now();
        }
    }

    #[test]
    fn test_map_transforms_values() {
        let dispatcher = ring();
        let root: Composable<u64> = Composable::new(Arc::clone(&dispatcher), None);
        let sum = Arc::new(AtomicU64::new(0));

        let sink = Arc::clone(&sum);
        root.map(|v| v * 2).consume(move |v| {
            sink.fetch_add(v, Ordering::AcqRel);
        });

        for v in 1..=10 {
            root.dispatch_signal(Signal::Value(v)).unwrap();
        }

        wait_until(Duration::from_secs(5), || {
            sum.load(Ordering::Acquire) == 110
        });
        dispatcher.shutdown();
    }

    #[test]
    fn test_filter_drops_values() {
        let dispatcher = ring();
        let root: Composable<u64> = Composable::new(Arc::clone(&dispatcher), None);
        let kept = Arc::new(AtomicUsize::new(0));

        let sink = Arc::clone(&kept);
        root.filter(|v| v % 2 == 0).consume(move |_| {
            sink.fetch_add(1, Ordering::AcqRel);
        });

        for v in 0..10_u64 {
            root.dispatch_signal(Signal::Value(v)).unwrap();
        }

        wait_until(Duration::from_secs(5), || kept.load(Ordering::Acquire) == 5);
        dispatcher.shutdown();
    }

    #[test]
    fn test_reduce_emits_full_windows() {
        let dispatcher = ring();
        let root: Composable<u64> = Composable::new(Arc::clone(&dispatcher), None);
        let emissions = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&emissions);
        root.reduce(|acc, v| acc + v, 0_u64, Some(5)).consume(move |total| {
            sink.lock().push(total);
        });

        // 0..15 in windows of 5: 10, 35, 60.
        for v in 0..15_u64 {
            root.dispatch_signal(Signal::Value(v)).unwrap();
        }

        wait_until(Duration::from_secs(5), || emissions.lock().len() == 3);
        assert_eq!(*emissions.lock(), vec![10, 35, 60]);
        dispatcher.shutdown();
    }

    #[test]
    fn test_reduce_emits_partial_window_on_complete() {
        let dispatcher = ring();
        let root: Composable<u64> = Composable::new(Arc::clone(&dispatcher), None);
        let emissions = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&emissions);
        root.reduce(|acc, v| acc + v, 0_u64, Some(4)).consume(move |total| {
            sink.lock().push(total);
        });

        // 6 values with window 4: one full window then a partial of 2.
        for v in 1..=6_u64 {
            root.dispatch_signal(Signal::Value(v)).unwrap();
        }
        root.dispatch_signal(Signal::Complete).unwrap();

        wait_until(Duration::from_secs(5), || emissions.lock().len() == 2);
        assert_eq!(*emissions.lock(), vec![10, 11]);
        dispatcher.shutdown();
    }

    #[test]
    fn test_reduce_without_window_emits_on_complete() {
        let dispatcher = ring();
        let root: Composable<u64> = Composable::new(Arc::clone(&dispatcher), None);
        let emissions = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&emissions);
        root.reduce(|acc, v| acc + v, 0_u64, None).consume(move |total| {
            sink.lock().push(total);
        });

        for v in 0..500_u64 {
            root.dispatch_signal(Signal::Value(v)).unwrap();
        }
        root.dispatch_signal(Signal::Complete).unwrap();

        wait_until(Duration::from_secs(5), || emissions.lock().len() == 1);
        assert_eq!(*emissions.lock(), vec![124_750]);
        dispatcher.shutdown();
    }

    #[test]
    fn test_map_many_flattens_promises() {
        let dispatcher = ring();
        let root: Composable<u64> = Composable::new(Arc::clone(&dispatcher), None);
        let seen = Arc::new(AtomicUsize::new(0));

        let sink = Arc::clone(&seen);
        root.map_many(|v| Promise::fulfilled(v + 100)).consume(move |v| {
            assert!(v >= 100);
            sink.fetch_add(1, Ordering::AcqRel);
        });

        for v in 0..50_u64 {
            root.dispatch_signal(Signal::Value(v)).unwrap();
        }

        wait_until(Duration::from_secs(5), || seen.load(Ordering::Acquire) == 50);
        dispatcher.shutdown();
    }

    #[test]
    fn test_panicking_stage_routes_to_error_consumer() {
        let dispatcher = ring();
        let root: Composable<u64> = Composable::new(Arc::clone(&dispatcher), None);
        let failures = Arc::new(AtomicUsize::new(0));

        let sink = Arc::clone(&failures);
        let mapped = root.map(|v: u64| {
            assert!(v < 3, "value too large");
            v
        });
        mapped.consume_error(move |error| {
            assert!(error.message().contains("value too large"));
            sink.fetch_add(1, Ordering::AcqRel);
        });

        root.dispatch_signal(Signal::Value(10)).unwrap();

        wait_until(Duration::from_secs(5), || {
            failures.load(Ordering::Acquire) == 1
        });
        assert_eq!(mapped.phase(), Phase::Failed);
        dispatcher.shutdown();
    }

    #[test]
    fn test_values_after_complete_are_dropped() {
        let dispatcher = ring();
        let root: Composable<u64> = Composable::new(Arc::clone(&dispatcher), None);
        let seen = Arc::new(AtomicUsize::new(0));

        let sink = Arc::clone(&seen);
        root.consume(move |_| {
            sink.fetch_add(1, Ordering::AcqRel);
        });

        root.dispatch_signal(Signal::Value(1)).unwrap();
        root.dispatch_signal(Signal::Complete).unwrap();
        root.dispatch_signal(Signal::Value(2)).unwrap();

        wait_until(Duration::from_secs(5), || {
            root.phase() == Phase::Completed
        });
        dispatcher.shutdown();
        assert_eq!(seen.load(Ordering::Acquire), 1);
    }

    #[test]
    fn test_reduce_accepts_send_only_accumulator() {
        use std::cell::Cell;

        let dispatcher = ring();
        let root: Composable<u64> = Composable::new(Arc::clone(&dispatcher), None);
        let total = Arc::new(AtomicU64::new(0));

        // Cell is Send but not Sync; the fold must not require Sync of it.
        let sink = Arc::clone(&total);
        root.reduce(
            |acc: Cell<u64>, v| Cell::new(acc.get() + v),
            Cell::new(0),
            Some(5),
        )
        .consume(move |window: Cell<u64>| {
            sink.fetch_add(window.get(), Ordering::AcqRel);
        });

        for v in 0..10_u64 {
            root.dispatch_signal(Signal::Value(v)).unwrap();
        }

        wait_until(Duration::from_secs(5), || {
            total.load(Ordering::Acquire) == 45
        });
        dispatcher.shutdown();
    }

    #[test]
    fn test_map_many_defers_complete_until_promises_resolve() {
        let dispatcher = ring();
        let root: Composable<u64> = Composable::new(Arc::clone(&dispatcher), None);
        let pending: Arc<Mutex<Vec<Promise<u64>>>> = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::new(AtomicUsize::new(0));

        let held = Arc::clone(&pending);
        let flattened = root.map_many(move |_| {
            let promise = Promise::new();
            held.lock().push(promise.clone());
            promise
        });
        let sink = Arc::clone(&seen);
        flattened.consume(move |_| {
            sink.fetch_add(1, Ordering::AcqRel);
        });

        for v in 0..10_u64 {
            root.dispatch_signal(Signal::Value(v)).unwrap();
        }
        root.dispatch_signal(Signal::Complete).unwrap();

        // End of input with every promise still pending: downstream must
        // stay open and deliver nothing yet.
        wait_until(Duration::from_secs(5), || pending.lock().len() == 10);
        assert_eq!(flattened.phase(), Phase::Open);
        assert_eq!(seen.load(Ordering::Acquire), 0);

        for (i, promise) in pending.lock().drain(..).enumerate() {
            promise.fulfill(u64::try_from(i).unwrap());
        }

        wait_until(Duration::from_secs(5), || {
            seen.load(Ordering::Acquire) == 10 && flattened.phase() == Phase::Completed
        });
        dispatcher.shutdown();
    }

    #[test]
    fn test_error_reaching_consume_only_stage_still_fails_it() {
        let dispatcher = ring();
        let root: Composable<u64> = Composable::new(Arc::clone(&dispatcher), None);
        let seen = Arc::new(AtomicUsize::new(0));

        let sink = Arc::clone(&seen);
        let mapped = root.map(|v: u64| {
            assert!(v < 3, "value too large");
            v
        });
        mapped.consume(move |_| {
            sink.fetch_add(1, Ordering::AcqRel);
        });

        root.dispatch_signal(Signal::Value(10)).unwrap();

        wait_until(Duration::from_secs(5), || mapped.phase() == Phase::Failed);
        assert_eq!(seen.load(Ordering::Acquire), 0);
        dispatcher.shutdown();
    }

    #[test]
    fn test_fan_out_to_multiple_consumers() {
        let dispatcher = ring();
        let root: Composable<u64> = Composable::new(Arc::clone(&dispatcher), None);
        let first = Arc::new(AtomicU64::new(0));
        let second = Arc::new(AtomicU64::new(0));

        let sink = Arc::clone(&first);
        root.consume(move |v| {
            sink.fetch_add(v, Ordering::AcqRel);
        });
        let sink = Arc::clone(&second);
        root.consume(move |v| {
            sink.fetch_add(v, Ordering::AcqRel);
        });

        for v in 1..=10_u64 {
            root.dispatch_signal(Signal::Value(v)).unwrap();
        }

        wait_until(Duration::from_secs(5), || {
            first.load(Ordering::Acquire) == 55 && second.load(Ordering::Acquire) == 55
        });
        dispatcher.shutdown();
    }
}
