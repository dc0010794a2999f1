//! # Composition API
//!
//! Reactive pipelines over the dispatch layer.
//!
//! ## Overview
//!
//! - **Composable**: one pipeline stage; operators (`map`, `filter`,
//!   `reduce`, `map_many`) attach downstream stages
//! - **Deferred**: producer handle for an unbounded pipeline
//!   (`accept` / `complete` / `fail`)
//! - **Promise**: single-value, resolve-once pipeline
//! - **Stream**: bounded pipeline with a construction-time value source
//!
//! ## Key Design Principles
//!
//! 1. **Attach before feeding** - stages are wired synchronously at build
//!    time, before any value can flow
//! 2. **Stages run on dispatcher threads** - never on the producer
//! 3. **Errors flow, they don't unwind** - a panicking stage closure
//!    becomes a [`StageError`](crate::dispatch::StageError) on the error
//!    channel
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use conflux_core::compose::Deferred;
//! use conflux_core::dispatch::{Dispatcher, RingConfig};
//!
//! let ring = Dispatcher::ring("events", RingConfig::default())?;
//! let deferred: Deferred<u64> = Deferred::builder().dispatcher(ring).build()?;
//!
//! deferred
//!     .compose()
//!     .map(|v| v * 2)
//!     .reduce(|acc, v| acc + v, 0, Some(100))
//!     .consume(|window_sum| println!("{window_sum}"));
//!
//! for v in 0..1_000 {
//!     deferred.accept(v)?;
//! }
//! deferred.complete()?;
//! ```

mod composable;
mod deferred;
mod error;
mod promise;
mod stream;

pub use composable::{Composable, Phase, Signal};
pub use deferred::{Deferred, DeferredBuilder};
pub use error::{AcceptError, ComposeError};
pub use promise::Promise;
pub use stream::{Stream, StreamBuilder};
