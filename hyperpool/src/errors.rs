use std::io;

use thiserror::Error;

use crate::pool::TaskId;

/// Errors surfaced by every layer of the runtime.
///
/// Transport and worker-death errors are retried once at the pool level.
/// Payload and misuse errors (`Unserializable`, `NotOwner`, `QueueClosed`,
/// `PoolClosed`) are reported synchronously and never retried.
#[derive(Debug, Error)]
pub enum HyperError {
    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    #[error("pool is degraded: no worker could be spawned ({0})")]
    PoolDegraded(String),

    #[error("payload cannot cross a process boundary: {0}")]
    Unserializable(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("operation timed out")]
    Timeout,

    #[error("worker crashed while running task {task_id} ({attempts} attempts)")]
    WorkerCrashed { task_id: TaskId, attempts: u32 },

    #[error("lock released by a caller that does not hold it")]
    NotOwner,

    #[error("queue is closed")]
    QueueClosed,

    #[error("queue is full")]
    QueueFull,

    #[error("pool is not accepting submissions")]
    PoolClosed,

    #[error("shared object '{0}' not found")]
    NotFound(String),

    #[error("task failed: {0}")]
    TaskFailed(String),

    #[error("remote call failed: {0}")]
    Remote(String),

    #[error("task was cancelled")]
    Cancelled,

    #[error("semaphore released more times than acquired")]
    SemaphoreOverflow,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("shared memory error: {0}")]
    SharedMemory(#[from] shared_memory::ShmemError),

    // raw_sync hands back `Box<dyn Error>` which is neither Send nor Sync,
    // so only its message is kept.
    #[error("lock error: {0}")]
    Lock(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, HyperError>;

impl HyperError {
    pub(crate) fn lock(err: Box<dyn std::error::Error>) -> Self {
        HyperError::Lock(err.to_string())
    }

    /// Transport-level failures that make a worker unusable.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            HyperError::ConnectionClosed | HyperError::Io(_) | HyperError::Protocol(_)
        )
    }
}

impl From<confy::ConfyError> for HyperError {
    fn from(err: confy::ConfyError) -> Self {
        HyperError::Config(err.to_string())
    }
}
