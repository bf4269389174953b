//! Single-host parallel execution: process and thread pools, framed
//! connections and queues between processes, named shared memory,
//! cross-process locks and events, and a manager process that owns shared objects.
//!
//! Binaries that start a [`ProcessPool`] or a [`Manager`] must call
//! [`bootstrap`] first thing in `main`; the same executable is re-run as
//! the worker.

pub mod config;
pub mod connection;
pub mod errors;
pub mod manager;
pub mod pool;
pub mod process;
pub mod protocol;
pub mod queue;
pub mod reduction;
pub mod shm;
pub mod sync;

#[cfg(test)]
mod tests;

pub use crate::config::{LaunchConfig, ManagerConfig, PoolConfig};
pub use crate::connection::{Connection, Listener};
pub use crate::errors::{HyperError, Result};
pub use crate::manager::{Managed, Manager, Proxy, ProxyRef};
pub use crate::pool::{
    as_completed, Future, PoolState, ProcessPool, TaskId, ThreadPool, WorkerInfo, WorkerState,
};
pub use crate::process::bootstrap;
pub use crate::queue::{ConnectionQueue, TaskQueue};
pub use crate::reduction::{Callable, LocalObject, Registry, Value};
pub use crate::shm::{SharedMemoryBlock, SharedMemoryManager, ShmHandle};
pub use crate::sync::{Barrier, Condition, Event, Lock, Semaphore, SyncHandle};
