use serde::{Deserialize, Serialize};

use super::TaskState;

/// Number of tasks per state, for status displays and logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub created: usize,
    pub started: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub expired: usize,
}

impl TaskCounts {
    pub fn add(&mut self, state: TaskState, n: usize) {
        match state {
            TaskState::Created => self.created += n,
            TaskState::Started => self.started += n,
            TaskState::Succeeded => self.succeeded += n,
            TaskState::Failed => self.failed += n,
            TaskState::Cancelled => self.cancelled += n,
            TaskState::Expired => self.expired += n,
        }
    }

    pub fn get(&self, state: TaskState) -> usize {
        match state {
            TaskState::Created => self.created,
            TaskState::Started => self.started,
            TaskState::Succeeded => self.succeeded,
            TaskState::Failed => self.failed,
            TaskState::Cancelled => self.cancelled,
            TaskState::Expired => self.expired,
        }
    }

    pub fn total(&self) -> usize {
        TaskState::ALL.into_iter().map(|s| self.get(s)).sum()
    }
}
