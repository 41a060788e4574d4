use thiserror::Error;

/// Canonical Quarry error taxonomy used across crates.
///
/// Classification guidance:
/// - [`QuarryError::OutOfMemory`]: a reservation would exceed a query limit or the pool ceiling
/// - [`QuarryError::TypeMismatch`]: incompatible operand types in an expression
/// - [`QuarryError::WorkerUnreachable`]: a destination or assigned worker cannot be reached
/// - [`QuarryError::TaskFailed`]: one task attempt failed on a worker
/// - [`QuarryError::QueryFailed`]: the scheduler gave up on a query
/// - [`QuarryError::Cancelled`]: the query's cancellation flag was observed
/// - [`QuarryError::Planning`]: plan shape/name issues discovered before execution
/// - [`QuarryError::Execution`]: runtime operator, decode/encode or data-shape failures
/// - [`QuarryError::InvalidConfig`]: config/environment contract violations
/// - [`QuarryError::Unsupported`]: valid but intentionally unimplemented behavior
/// - [`QuarryError::Io`]: raw IO failures from std APIs
#[derive(Debug, Error)]
pub enum QuarryError {
    /// A memory reservation could not be granted.
    ///
    /// The pool is left unchanged; the caller decides whether to spill or
    /// reject.
    #[error("out of memory: requested {requested} bytes, {available} bytes available ({scope})")]
    OutOfMemory {
        /// Bytes the caller asked for.
        requested: usize,
        /// Bytes still available in the exhausted scope.
        available: usize,
        /// Which limit was hit, e.g. `query 7` or `pool`.
        scope: String,
    },

    /// Operand types are incompatible for an operator.
    ///
    /// Examples:
    /// - `Utf8 + Int64`
    /// - `NOT` applied to a non-boolean
    /// - join keys of different types
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// A worker did not answer or its channel is closed.
    #[error("worker unreachable: {0}")]
    WorkerUnreachable(String),

    /// A task attempt failed. Retryable by the scheduler.
    #[error("task failed: {0}")]
    TaskFailed(String),

    /// A query failed after the retry policy was exhausted.
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Execution stopped because the query was cancelled.
    #[error("query cancelled: {0}")]
    Cancelled(String),

    /// Invalid or inconsistent configuration state.
    ///
    /// Examples:
    /// - zero partitions or zero in-flight capacity
    /// - unparsable `QUARRY_*` environment override
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Planning failures.
    ///
    /// Examples:
    /// - unknown table/column
    /// - malformed plan JSON
    /// - exchange without a stage boundary
    #[error("planning error: {0}")]
    Planning(String),

    /// Runtime execution failures after planning succeeded.
    ///
    /// Examples:
    /// - arrow kernel failures
    /// - exchange frame decode failures
    /// - division by zero
    #[error("execution error: {0}")]
    Execution(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Valid request for a feature/shape not implemented in current version.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl QuarryError {
    /// Whether the scheduler may retry the task that produced this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::WorkerUnreachable(_) | Self::TaskFailed(_) | Self::Io(_)
        )
    }
}

/// Standard Quarry result alias.
pub type Result<T> = std::result::Result<T, QuarryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(QuarryError::TaskFailed("boom".to_string()).is_retryable());
        assert!(QuarryError::WorkerUnreachable("w1".to_string()).is_retryable());
        assert!(!QuarryError::TypeMismatch("a".to_string()).is_retryable());
        assert!(!QuarryError::Cancelled("q1".to_string()).is_retryable());
    }

    #[test]
    fn out_of_memory_message_names_scope() {
        let err = QuarryError::OutOfMemory {
            requested: 10,
            available: 4,
            scope: "query 3".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "out of memory: requested 10 bytes, 4 bytes available (query 3)"
        );
    }
}
