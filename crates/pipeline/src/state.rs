use std::fmt;

use cdc_core::SourcePosition;
use serde::Serialize;

/// Lifecycle of one partition worker.
///
/// `Idle → Resuming → Streaming (⇄ Blocked) → Draining → Stopped`, with
/// `Halted` reached from any state when the worker gives up on an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Resuming,
    Streaming,
    /// Waiting for an operator after a schema-change event
    Blocked {
        position: SourcePosition,
        table: Option<String>,
    },
    Draining,
    Stopped,
    Halted { reason: String },
}

impl WorkerState {
    /// The worker task has finished.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::Stopped | WorkerState::Halted { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Resuming => "resuming",
            WorkerState::Streaming => "streaming",
            WorkerState::Blocked { .. } => "blocked",
            WorkerState::Draining => "draining",
            WorkerState::Stopped => "stopped",
            WorkerState::Halted { .. } => "halted",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::Blocked { position, .. } => write!(f, "blocked at {position}"),
            WorkerState::Halted { reason } => write!(f, "halted: {reason}"),
            other => f.write_str(other.name()),
        }
    }
}
