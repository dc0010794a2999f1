//! Composition error types.

use crate::dispatch::DispatchError;
use crate::environment::EnvError;

/// Errors returned by the producer-side entry points (`accept`,
/// `complete`, `fail`, `propagate`).
#[derive(Debug, Clone, thiserror::Error)]
pub enum AcceptError {
    /// The pipeline already received a terminal signal.
    #[error("pipeline is closed to new values")]
    Closed,

    /// The backing dispatcher refused the task.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Errors surfaced synchronously while building a pipeline.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ComposeError {
    /// A bounded stream was built without a value source.
    #[error("bounded stream requires a value source")]
    NoValueSource,

    /// No dispatcher was given and the environment has no default.
    #[error("no dispatcher provided for pipeline")]
    NoDispatcher,

    /// A named dispatcher lookup failed.
    #[error(transparent)]
    Environment(#[from] EnvError),

    /// The backing dispatcher could not be constructed or used.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(
            AcceptError::Closed.to_string(),
            "pipeline is closed to new values"
        );
        assert_eq!(
            ComposeError::NoValueSource.to_string(),
            "bounded stream requires a value source"
        );
        let err = ComposeError::from(EnvError::UnknownDispatcher("rb".to_string()));
        assert!(err.to_string().contains("rb"));
    }
}
