use thiserror::Error;

/// Errors surfaced by pool construction and pool-level operations.
///
/// Per-task failures are not represented here: a panicking task is caught at
/// the worker loop boundary, counted, and reported through the configured
/// panic handler. It never reaches the caller of `submit`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// `min_threads` exceeds `max_threads`, or `max_threads` is zero.
    #[error("invalid configuration: min_threads ({min_threads}) must be <= max_threads ({max_threads}) and max_threads must be non-zero")]
    InvalidConfiguration {
        min_threads: usize,
        max_threads: usize,
    },

    /// The pool has begun shutting down; no new tasks are accepted.
    #[error("thread pool is shut down")]
    Shutdown,

    /// `create_thread` was requested while already at `max_threads`.
    #[error("thread pool is at its maximum size ({max_threads})")]
    AtCapacity { max_threads: usize },

    /// `destroy_thread` was requested while already at `min_threads`.
    #[error("thread pool is at its minimum size ({min_threads})")]
    AtMinimum { min_threads: usize },
}
