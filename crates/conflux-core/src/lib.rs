//! # Conflux Core
//!
//! A reactive dispatch and composition engine: named dispatcher strategies
//! feeding composable value pipelines.
//!
//! This crate provides:
//! - **Dispatch**: four task execution strategies (thread pool, bounded
//!   work queue, pre-allocated ring, key-sharded actor) behind one
//!   lifecycle contract
//! - **Compose**: `Deferred`/`Promise`/`Stream` pipelines with `map`,
//!   `filter`, windowed `reduce`, and promise-flattening `map_many`
//! - **Environment**: an explicit, shareable registry of named dispatchers
//!
//! ## Design Principles
//!
//! 1. **No global state** - dispatchers live in an [`Environment`] the
//!    caller owns and passes around
//! 2. **Exactly-once execution** - accepted tasks run once; rejection is
//!    explicit and synchronous, never a silent drop
//! 3. **Errors flow downstream** - stage panics become error-channel
//!    signals instead of unwinding dispatcher threads
//!
//! ## Example
//!
//! ```rust,ignore
//! use conflux_core::{Deferred, Environment};
//!
//! let env = Environment::with_defaults()?;
//! let deferred: Deferred<u64> = Deferred::builder()
//!     .env(&env)
//!     .dispatcher_name("ringBuffer")
//!     .build()?;
//!
//! deferred.compose().consume(|v| println!("{v}"));
//! deferred.accept(42)?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)] // Selectively allowed in the ring's slot arena
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod compose;
pub mod dispatch;
pub mod environment;

// Re-export key types
pub use compose::{Composable, Deferred, Promise, Stream};
pub use dispatch::{Dispatcher, DispatcherState, Task};
pub use environment::Environment;

/// Result type for conflux-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for conflux-core.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Dispatch-layer errors.
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] dispatch::DispatchError),

    /// Dispatcher registry errors.
    #[error("Environment error: {0}")]
    Environment(#[from] environment::EnvError),

    /// Pipeline construction errors.
    #[error("Compose error: {0}")]
    Compose(#[from] compose::ComposeError),

    /// Producer-side pipeline errors.
    #[error("Accept error: {0}")]
    Accept(#[from] compose::AcceptError),

    /// A captured stage failure.
    #[error("Stage error: {0}")]
    Stage(#[from] dispatch::StageError),
}
