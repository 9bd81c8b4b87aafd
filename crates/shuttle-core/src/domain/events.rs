//! Events - ドメインイベント
//!
//! Scheduler が状態変化を観測するたびに 1 件の `TaskEvent` を EventSink に送ります。

use super::{Task, TaskState};

/// A task observed in a new state, right after the write that put it there.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskEvent {
    pub task: Task,
}

impl TaskEvent {
    pub fn new(task: Task) -> Self {
        Self { task }
    }

    pub fn state(&self) -> TaskState {
        self.task.state
    }
}
