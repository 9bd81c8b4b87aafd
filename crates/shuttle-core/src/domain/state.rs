//! Task state machine.
//!
//! This module is the single source of truth for which transitions are legal
//! and what the terminal flag of a state is. Stores call [`StateTransition::validate`]
//! before writing and never write `state` anywhere else.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Task state.
///
/// State transitions:
/// - Created -> Started -> Succeeded | Failed | Cancelled | Expired
/// - Created -> Cancelled | Expired
///
/// Terminal states have no outgoing transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Waiting to be dequeued.
    Created,

    /// Claimed by a worker.
    Started,

    Succeeded,
    Failed,
    Cancelled,

    /// Force-terminated by the expiry sweep.
    Expired,
}

impl TaskState {
    pub const ALL: [TaskState; 6] = [
        TaskState::Created,
        TaskState::Started,
        TaskState::Succeeded,
        TaskState::Failed,
        TaskState::Cancelled,
        TaskState::Expired,
    ];

    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled | TaskState::Expired
        )
    }

    /// Is this task eligible for dequeue?
    pub fn is_runnable(self) -> bool {
        matches!(self, TaskState::Created)
    }

    /// Storage / wire spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Created => "CREATED",
            TaskState::Started => "STARTED",
            TaskState::Succeeded => "SUCCEEDED",
            TaskState::Failed => "FAILED",
            TaskState::Cancelled => "CANCELLED",
            TaskState::Expired => "EXPIRED",
        }
    }

    /// Can a task move from `self` to `to`?
    pub fn can_transition_to(self, to: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, to),
            (Created, Started)
                | (Created, Cancelled)
                | (Created, Expired)
                | (Started, Succeeded)
                | (Started, Failed)
                | (Started, Cancelled)
                | (Started, Expired)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task state '{0}'")]
pub struct ParseStateError(pub String);

impl FromStr for TaskState {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseStateError(s.to_string()))
    }
}

/// A validated `(from, to)` pair. Only [`StateTransition::validate`] builds one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    from: TaskState,
    to: TaskState,
}

impl StateTransition {
    /// Check `(from, to)` against the transition table.
    ///
    /// Returns `None` for any pair outside the table, including every pair
    /// leaving a terminal state.
    pub fn validate(from: TaskState, to: TaskState) -> Option<Self> {
        from.can_transition_to(to).then_some(Self { from, to })
    }

    pub fn from(&self) -> TaskState {
        self.from
    }

    pub fn to(&self) -> TaskState {
        self.to
    }

    /// Value of the redundant `terminated` column after this transition.
    pub fn terminated(&self) -> bool {
        self.to.is_terminal()
    }

    /// Output to persist: `STARTED` never carries one.
    pub fn output(&self, output: Option<serde_json::Value>) -> Option<serde_json::Value> {
        if self.terminated() { output } else { None }
    }
}
