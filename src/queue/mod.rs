mod command_queue;
mod lane;
mod lanes;

use std::fmt;
use std::io;
use std::time::Duration;

use serde::Serialize;

use crate::config::QueuesConfig;
use crate::events::QueueStateKind;
use crate::storage::StorageError;

pub use command_queue::{CommandQueue, QueueDependencies};
pub use lane::Lane;
pub use lanes::CommandQueues;

/// What a worker does when its lane has nothing left to run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdlePolicy {
    Poll,
    ExitWhenEmpty,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueSettings {
    pub pause_poll_interval: Duration,
    pub idle_interval: Duration,
    pub slow_command_warn: Duration,
    pub idle_policy: IdlePolicy,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self::from_config(&QueuesConfig::default())
    }
}

impl QueueSettings {
    pub fn from_config(config: &QueuesConfig) -> Self {
        Self {
            pause_poll_interval: Duration::from_millis(config.pause_poll_interval_ms),
            idle_interval: Duration::from_millis(config.idle_interval_ms),
            slow_command_warn: Duration::from_millis(config.slow_command_warn_ms),
            idle_policy: IdlePolicy::Poll,
        }
    }

    pub fn with_idle_policy(mut self, idle_policy: IdlePolicy) -> Self {
        self.idle_policy = idle_policy;
        self
    }
}

/// Result of one worker iteration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    Cancelled,
    Paused,
    Idle,
    /// Records are pending but all of them need a banned connection.
    WaitingForConnection,
    Executed {
        command_id: String,
        succeeded: bool,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub lane: Lane,
    pub depth: usize,
    pub paused: bool,
    pub current_description: String,
    pub state: QueueStateKind,
}

#[derive(Debug)]
pub enum QueueError {
    Storage(StorageError),
    WrongLane {
        command_id: String,
        expected: Lane,
        actual: Lane,
    },
    AlreadyRunning {
        lane: Lane,
    },
    WorkerSpawn {
        lane: Lane,
        source: io::Error,
    },
    JoinFailed {
        lane: Lane,
    },
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Storage(source) => write!(f, "lane storage failure: {source}"),
            Self::WrongLane {
                command_id,
                expected,
                actual,
            } => write!(
                f,
                "command '{command_id}' belongs to lane '{actual}', not '{expected}'"
            ),
            Self::AlreadyRunning { lane } => write!(f, "lane '{lane}' worker is already running"),
            Self::WorkerSpawn { lane, source } => {
                write!(f, "failed to spawn worker for lane '{lane}': {source}")
            }
            Self::JoinFailed { lane } => write!(f, "lane '{lane}' worker thread join failed"),
        }
    }
}

impl std::error::Error for QueueError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(source) => Some(source),
            Self::WorkerSpawn { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<StorageError> for QueueError {
    fn from(value: StorageError) -> Self {
        Self::Storage(value)
    }
}
