use serde::{Deserialize, Serialize};

use super::{ScheduleId, Task, TaskId, TaskState};

pub const DEFAULT_SEARCH_LIMIT: usize = 100;

/// Conjunctive filter for `TaskStore::search`. Unset fields do not filter.
///
/// `group_key` is an exact match here; wildcard matching is dequeue's business.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchParams {
    pub ids: Option<Vec<TaskId>>,
    pub group_key: Option<String>,
    pub states: Option<Vec<TaskState>>,
    pub schedule_id: Option<ScheduleId>,
    pub retry_key: Option<String>,
    pub owner_key: Option<String>,
    pub limit: Option<usize>,
}

impl SearchParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(mut self, ids: impl IntoIterator<Item = TaskId>) -> Self {
        self.ids = Some(ids.into_iter().collect());
        self
    }

    pub fn group_key(mut self, group_key: impl Into<String>) -> Self {
        self.group_key = Some(group_key.into());
        self
    }

    pub fn states(mut self, states: impl IntoIterator<Item = TaskState>) -> Self {
        self.states = Some(states.into_iter().collect());
        self
    }

    pub fn schedule_id(mut self, schedule_id: ScheduleId) -> Self {
        self.schedule_id = Some(schedule_id);
        self
    }

    pub fn retry_key(mut self, retry_key: impl Into<String>) -> Self {
        self.retry_key = Some(retry_key.into());
        self
    }

    pub fn owner_key(mut self, owner_key: impl Into<String>) -> Self {
        self.owner_key = Some(owner_key.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// `None` and `Some(0)` both mean [`DEFAULT_SEARCH_LIMIT`].
    pub fn effective_limit(&self) -> usize {
        match self.limit {
            Some(0) | None => DEFAULT_SEARCH_LIMIT,
            Some(n) => n,
        }
    }

    /// In-process evaluation of the filter against one task.
    pub fn matches(&self, task: &Task) -> bool {
        self.ids.as_ref().is_none_or(|ids| ids.contains(&task.id))
            && self.group_key.as_ref().is_none_or(|g| *g == task.group_key)
            && self.states.as_ref().is_none_or(|s| s.contains(&task.state))
            && self.schedule_id.is_none_or(|s| task.schedule_id == Some(s))
            && self.retry_key.as_ref().is_none_or(|k| *k == task.retry_key)
            && self
                .owner_key
                .as_ref()
                .is_none_or(|k| task.owner_key.as_ref() == Some(k))
    }
}
