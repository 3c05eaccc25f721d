//! Parallel training.
//!
//! - [`pool`]: one master store, persistent workers, adaptive timeouts and
//!   respawn on failure
//! - [`worker`]: the loop every worker runs, on a thread or in a process
//! - [`transport`] / [`message`]: the frames workers and coordinator exchange
//! - [`instance`]: several independent pools side by side

pub mod instance;
pub mod message;
pub mod pool;
pub mod transport;
pub mod worker;

pub use instance::{InstanceSpec, InstanceSummary, MultiInstanceCoordinator};
pub use message::{BatchResult, Report, Task};
pub use pool::{ExecutionContext, PoolCoordinator, SpawnMode};
pub use worker::{serve, serve_stdio};
