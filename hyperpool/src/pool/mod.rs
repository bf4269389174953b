//! Process and thread pools sharing one submission contract: submit
//! returns a [`Future`], `map` preserves input order, and `shutdown`
//! either drains or cancels what is still queued.

use std::any::Any;
use std::fmt;
use std::time::Instant;

use serde_derive::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::{HyperError, Result};

mod future;
mod process;
mod thread;

pub use self::future::{as_completed, collect_ordered, AsCompleted, Future};
pub use self::process::ProcessPool;
pub use self::thread::ThreadPool;

pub(crate) use self::future::{gather, pair, Abort, Promise};

/// Monotonic per pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Created,
    Running,
    ShuttingDown,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Idle,
    Busy,
    Dead,
}

/// Snapshot of one worker slot.
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub slot: usize,
    pub pid: Option<u32>,
    pub thread_name: Option<String>,
    pub state: WorkerState,
    pub last_heartbeat: Option<Instant>,
    pub tasks_completed: u64,
}

impl WorkerInfo {
    pub(crate) fn new(slot: usize) -> WorkerInfo {
        WorkerInfo {
            slot,
            pid: None,
            thread_name: None,
            state: WorkerState::Starting,
            last_heartbeat: None,
            tasks_completed: 0,
        }
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}

/// Run `attempt` until it succeeds, at most `retries + 1` times. The
/// attempt number is passed in; the last error is returned.
pub(crate) fn with_retries<T, F>(what: &str, retries: u32, mut attempt: F) -> Result<T>
where
    F: FnMut(u32) -> Result<T>,
{
    let mut last_error = None;
    for n in 0..=retries {
        match attempt(n) {
            Ok(v) => return Ok(v),
            Err(e) => {
                warn!(what = %what, attempt = n, retries, error = %e, "attempt failed");
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| HyperError::Spawn(format!("{}: no attempt made", what))))
}
