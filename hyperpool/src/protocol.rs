//! Messages exchanged between a parent and its worker or manager process.

use std::time::SystemTime;

use serde_derive::{Deserialize, Serialize};

use crate::pool::TaskId;
use crate::reduction::{Callable, Value};

/// First frame on every child connection, whatever the role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ready {
    pub pid: u32,
}

/// Settings the parent hands a worker right after the handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerOptions {
    pub slot: usize,
    pub heartbeat_interval_ms: u64,
    pub initializer: Option<Callable>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub callable: Callable,
    pub args: Vec<Value>,
    pub submitted_at: SystemTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub outcome: Result<Value, String>,
    pub completed_at: SystemTime,
}

impl TaskOutcome {
    pub fn success(&self) -> bool {
        self.outcome.is_ok()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkerMessage {
    Start(WorkerOptions),
    Started,
    InitFailed(String),
    Task(Task),
    Outcome(TaskOutcome),
    Heartbeat,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ManagerRequest {
    Create { type_name: String, args: Vec<Value> },
    Call { object_id: u64, method_id: u16, args: Vec<Value> },
    Incref { object_id: u64 },
    Decref { object_id: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ManagerReply {
    Created { object_id: u64 },
    Value(Value),
    Error(String),
    Ack,
}

/// Control channel between the parent and its manager process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ManagerControl {
    Listening { address: String },
    Shutdown,
}
