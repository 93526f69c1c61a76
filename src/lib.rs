//! Elastic work-stealing thread pool over OS threads.
//!
//! # Features
//! - Per-worker deques with work stealing for load balancing
//! - Shared overflow queue feeding workers in batches
//! - Worker count floats between configured min/max bounds: sustained
//!   backlog grows the pool, sustained idleness shrinks it back
//! - Graceful shutdown drains every accepted task; forced shutdown reports
//!   the number of tasks it discarded
//! - Per-task panic isolation with an optional error callback
//! - Activity metrics and worker-state snapshots
//!
//! # Example
//! ```
//! use stealpool::ThreadPool;
//!
//! let pool = ThreadPool::with_bounds(2, 8).unwrap();
//! pool.submit(|| println!("hello from a worker")).unwrap();
//! pool.shutdown();
//! ```

pub mod errors;
pub mod metrics;
pub mod pool;
pub mod task;
mod worker;

pub use errors::PoolError;
pub use metrics::PoolMetrics;
pub use pool::{Config, PanicHandler, ThreadPool};
pub use task::Task;
pub use worker::WorkerState;
