//! Error-channel fallback behavior.
//!
//! Runs in its own binary so it can own the process-global tracing
//! subscriber and count error events emitted by the pipeline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use conflux_core::compose::{Deferred, Phase};
use conflux_core::dispatch::{Dispatcher, RingConfig};
use tracing::span;
use tracing::{Event, Level, Metadata, Subscriber};

/// Counts ERROR-level events from this crate.
struct ErrorCounter {
    errors: Arc<AtomicU64>,
}

impl Subscriber for ErrorCounter {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        *metadata.level() == Level::ERROR && metadata.target().starts_with("conflux_core")
    }

    fn new_span(&self, _attrs: &span::Attributes<'_>) -> span::Id {
        span::Id::from_u64(1)
    }

    fn record(&self, _id: &span::Id, _values: &span::Record<'_>) {}

    fn record_follows_from(&self, _id: &span::Id, _follows: &span::Id) {}

    fn event(&self, _event: &Event<'_>) {
        self.errors.fetch_add(1, Ordering::AcqRel);
    }

    fn enter(&self, _id: &span::Id) {}

    fn exit(&self, _id: &span::Id) {}
}

fn wait_until(budget: Duration, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + budget;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        thread::yield_now();
    }
}

#[test]
fn stage_panic_without_error_consumer_is_logged_not_lost() {
    let errors = Arc::new(AtomicU64::new(0));
    tracing::subscriber::set_global_default(ErrorCounter {
        errors: Arc::clone(&errors),
    })
    .unwrap();

    let dispatcher = Dispatcher::ring("err-ring", RingConfig::with_capacity(64)).unwrap();
    let deferred: Deferred<u64> = Deferred::builder()
        .dispatcher(Arc::clone(&dispatcher))
        .build()
        .unwrap();

    // The terminal stage has a value consumer but no error consumer, so a
    // stage panic has nowhere to go but the log.
    let delivered = Arc::new(AtomicU64::new(0));
    let sink = Arc::clone(&delivered);
    let mapped = deferred.compose().map(|v: u64| {
        assert!(v != 7, "poison value");
        v
    });
    mapped.consume(move |_| {
        sink.fetch_add(1, Ordering::AcqRel);
    });

    deferred.accept(7).unwrap();

    wait_until(Duration::from_secs(10), || mapped.phase() == Phase::Failed);
    wait_until(Duration::from_secs(10), || {
        errors.load(Ordering::Acquire) >= 1
    });
    assert_eq!(delivered.load(Ordering::Acquire), 0);

    // A handled failure on a fresh pipeline must not hit the fallback.
    let logged_so_far = errors.load(Ordering::Acquire);
    let handled: Deferred<u64> = Deferred::builder()
        .dispatcher(Arc::clone(&dispatcher))
        .build()
        .unwrap();
    let failures = Arc::new(AtomicU64::new(0));
    let sink = Arc::clone(&failures);
    let checked = handled.compose().map(|v: u64| {
        assert!(v != 7, "poison value");
        v
    });
    checked.consume(|_| {});
    checked.consume_error(move |_| {
        sink.fetch_add(1, Ordering::AcqRel);
    });

    handled.accept(7).unwrap();

    wait_until(Duration::from_secs(10), || {
        failures.load(Ordering::Acquire) == 1
    });
    assert_eq!(errors.load(Ordering::Acquire), logged_so_far);
    dispatcher.shutdown();
}
