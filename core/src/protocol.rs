//! Wire messages exchanged on the task, result and announcement channels.
//!
//! Every message is one length-prefixed JSON frame (see
//! `weft_common::codec`). The task channel carries [`Task`] frames from
//! master to worker and [`TaskChannelFrame`] frames back; the result
//! channel carries [`ResultChannelFrame`] frames from worker to master; the
//! announcement channel broadcasts [`Announcement`] frames.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Identifies one master instance.
pub type MasterId = Uuid;

/// Unique identifier for tasks, unique for the lifetime of a master.
pub type TaskId = Uuid;

/// Identifier a worker announces on connect.
pub type WorkerId = String;

/// Keyword arguments of a task.
pub type Kwargs = serde_json::Map<String, Value>;

/// A unit of work addressed to a named handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub master_id: MasterId,
    pub task_id: TaskId,
    /// Name of the handler in the worker's registry.
    pub callable: String,
    pub args: Vec<Value>,
    pub kwargs: Kwargs,
}

/// Exception raised by a task handler, carried back to the master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct RemoteException {
    /// Error class, e.g. `ValueError` or `HandlerNotFound`.
    pub kind: String,
    pub message: String,
    /// Cause chain and origin, outermost first.
    #[serde(default)]
    pub traceback: Vec<String>,
}

impl RemoteException {
    pub fn new<K: Into<String>, M: Into<String>>(kind: K, message: M) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            traceback: Vec::new(),
        }
    }

    pub fn with_traceback(mut self, traceback: Vec<String>) -> Self {
        self.traceback = traceback;
        self
    }

    /// Exception used for tasks still unresolved when their master stops.
    pub fn abandoned(task_id: &TaskId) -> Self {
        Self::new(
            "TaskAbandoned",
            format!("task {} was abandoned at shutdown", task_id),
        )
    }

    /// Render the exception with its traceback, one frame per line.
    pub fn format_traceback(&self) -> String {
        let mut out = String::from("Remote traceback (most recent call last):\n");
        for frame in self.traceback.iter().rev() {
            out.push_str("  ");
            out.push_str(frame);
            out.push('\n');
        }
        out.push_str(&self.to_string());
        out
    }
}

/// What happened when a worker ran a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "payload", rename_all = "lowercase")]
pub enum Outcome {
    Result(Value),
    Exception(RemoteException),
}

/// The answer to one [`Task`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub master_id: MasterId,
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub outcome: Outcome,
}

/// Worker-to-master frames on the task channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskChannelFrame {
    /// First frame on a new task connection; grants `slots` credits.
    Hello { worker_id: WorkerId, slots: u32 },
    /// Grants more credits after tasks finish.
    Credit { slots: u32 },
}

/// Worker-to-master frames on the result channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResultChannelFrame {
    Result(TaskResult),
    Heartbeat {
        worker_id: WorkerId,
        outstanding: Vec<TaskId>,
    },
}

/// Control messages broadcast by the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Announcement {
    Ping,
    Shutdown,
}

impl fmt::Display for Announcement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Announcement::Ping => f.write_str("ping"),
            Announcement::Shutdown => f.write_str("shutdown"),
        }
    }
}
