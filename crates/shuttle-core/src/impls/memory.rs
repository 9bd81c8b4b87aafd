//! In-memory TaskStore implementation.
//!
//! One `tokio::sync::Mutex` guards the whole table, so every operation is
//! atomic. Dequeue additionally takes the per-group-key mutex first, the same
//! ordering the SQL store uses (group mutex, then table).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use super::group_lock::GroupLocks;
use crate::domain::{
    Candidate, GroupKeyPattern, ScheduleId, SchedulerError, SearchParams, StateTransition, Task,
    TaskCounts, TaskId, TaskProps, TaskState, admit,
};
use crate::ports::{Clock, IdGenerator, REAP_BATCH_SIZE, TaskStore, UlidGenerator, reap_cutoff};

#[derive(Default)]
struct MemoryState {
    /// Ordered by id, i.e. by creation time.
    tasks: BTreeMap<TaskId, Task>,

    /// schedule id -> most recently scheduled task
    schedule_heads: HashMap<ScheduleId, TaskId>,
}

pub struct InMemoryTaskStore {
    state: Mutex<MemoryState>,
    group_locks: GroupLocks,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl InMemoryTaskStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let ids = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        Self::with_id_generator(clock, ids)
    }

    pub fn with_id_generator(clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            group_locks: GroupLocks::new(),
            clock,
            ids,
        }
    }
}

/// Write one validated transition onto the record.
fn apply(
    task: &mut Task,
    transition: StateTransition,
    output: Option<serde_json::Value>,
    now: DateTime<Utc>,
) {
    task.state = transition.to();
    task.terminated = transition.terminated();
    task.output = transition.output(output);
    task.last_state_transition_at = now;
    if transition.to() == TaskState::Started {
        task.last_heartbeat_at = now;
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create(&self, props: TaskProps) -> Result<Task, SchedulerError> {
        let now = self.clock.now();
        let id = self.ids.generate_task_id();
        let retry_key = match props.retry_key.clone() {
            Some(key) => key,
            None => self.ids.generate_retry_key(),
        };
        let task = Task::new(id, props, retry_key, now);

        let mut state = self.state.lock().await;
        if let Some(schedule_id) = task.schedule_id {
            state.schedule_heads.insert(schedule_id, id);
        }
        state.tasks.insert(id, task.clone());
        Ok(task)
    }

    async fn get(&self, id: TaskId) -> Result<Task, SchedulerError> {
        let state = self.state.lock().await;
        state
            .tasks
            .get(&id)
            .cloned()
            .ok_or(SchedulerError::NotFound { id })
    }

    async fn search(&self, params: &SearchParams) -> Result<Vec<Task>, SchedulerError> {
        let state = self.state.lock().await;
        Ok(state
            .tasks
            .values()
            .filter(|t| params.matches(t))
            .take(params.effective_limit())
            .cloned()
            .collect())
    }

    async fn heartbeat(&self, id: TaskId) -> Result<Task, SchedulerError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or(SchedulerError::NotFound { id })?;
        task.last_heartbeat_at = now;
        Ok(task.clone())
    }

    async fn dequeue(
        &self,
        pattern: &GroupKeyPattern,
        limit: usize,
    ) -> Result<Vec<Task>, SchedulerError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let _group_guard = self.group_locks.lock(pattern.as_str()).await;
        let mut state = self.state.lock().await;
        let now = self.clock.now();

        let admitted = {
            let candidates: Vec<Candidate<'_>> = state
                .tasks
                .values()
                .filter(|t| {
                    t.state.is_runnable() && t.starts_after <= now && pattern.matches(&t.group_key)
                })
                .map(|t| Candidate {
                    id: t.id,
                    group_key: &t.group_key,
                    group_max_concurrency: t.group_max_concurrency,
                    created_at: t.created_at,
                })
                .collect();

            let groups: HashSet<&str> = candidates.iter().map(|c| c.group_key).collect();
            let mut running: HashMap<&str, usize> = HashMap::new();
            for task in state.tasks.values() {
                if task.state == TaskState::Started && groups.contains(task.group_key.as_str()) {
                    *running.entry(task.group_key.as_str()).or_insert(0) += 1;
                }
            }

            admit(candidates, &running, limit)
        };

        let mut started = Vec::with_capacity(admitted.len());
        for id in admitted {
            let Some(task) = state.tasks.get_mut(&id) else {
                continue;
            };
            let Some(transition) = StateTransition::validate(task.state, TaskState::Started)
            else {
                continue;
            };
            apply(task, transition, None, now);
            started.push(task.clone());
        }

        debug!(group_key = %pattern, count = started.len(), "dequeued tasks");
        Ok(started)
    }

    async fn transition_state(
        &self,
        id: TaskId,
        to: TaskState,
        output: Option<serde_json::Value>,
    ) -> Result<Task, SchedulerError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or(SchedulerError::NotFound { id })?;

        let transition =
            StateTransition::validate(task.state, to).ok_or(SchedulerError::InvalidTransition {
                id,
                from: task.state,
                to,
            })?;
        apply(task, transition, output, now);
        Ok(task.clone())
    }

    async fn expire_stale(&self) -> Result<Vec<Task>, SchedulerError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let mut expired = Vec::new();
        for task in state.tasks.values_mut() {
            let Some(reason) = task.expiry_reason(now) else {
                continue;
            };
            let Some(transition) = StateTransition::validate(task.state, TaskState::Expired)
            else {
                continue;
            };
            apply(task, transition, Some(reason.to_output()), now);
            expired.push(task.clone());
        }

        if !expired.is_empty() {
            debug!(count = expired.len(), "expired stale tasks");
        }
        Ok(expired)
    }

    async fn reap_older_than(&self, days: u32) -> Result<Vec<Task>, SchedulerError> {
        let Some(cutoff) = reap_cutoff(self.clock.now(), days) else {
            return Ok(Vec::new());
        };
        let mut state = self.state.lock().await;

        let heads: HashSet<TaskId> = state.schedule_heads.values().copied().collect();
        let doomed: Vec<TaskId> = state
            .tasks
            .values()
            .filter(|t| t.terminated && t.starts_after < cutoff && !heads.contains(&t.id))
            .take(REAP_BATCH_SIZE)
            .map(|t| t.id)
            .collect();

        let deleted: Vec<Task> = doomed
            .iter()
            .filter_map(|id| state.tasks.remove(id))
            .collect();

        if !deleted.is_empty() {
            debug!(days, count = deleted.len(), "reaped terminated tasks");
        }
        Ok(deleted)
    }

    async fn set_schedule_head(
        &self,
        schedule_id: ScheduleId,
        task_id: TaskId,
    ) -> Result<(), SchedulerError> {
        let mut state = self.state.lock().await;
        if !state.tasks.contains_key(&task_id) {
            return Err(SchedulerError::NotFound { id: task_id });
        }
        state.schedule_heads.insert(schedule_id, task_id);
        Ok(())
    }

    async fn counts_by_state(&self) -> Result<TaskCounts, SchedulerError> {
        let state = self.state.lock().await;
        let mut counts = TaskCounts::default();
        for task in state.tasks.values() {
            counts.add(task.state, 1);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::FixedClock;
    use chrono::{Duration, TimeZone};

    fn store() -> (InMemoryTaskStore, FixedClock) {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        (InMemoryTaskStore::new(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn create_then_get() {
        let (store, _) = store();
        let task = store
            .create(TaskProps::new("sync", "g", serde_json::json!({"a": 1})))
            .await
            .unwrap();

        assert_eq!(store.get(task.id).await.unwrap(), task);
    }

    #[tokio::test]
    async fn invalid_transition_leaves_task_unchanged() {
        let (store, clock) = store();
        let task = store
            .create(TaskProps::new("sync", "g", serde_json::json!({})))
            .await
            .unwrap();

        clock.advance(Duration::seconds(1));
        let err = store
            .transition_state(task.id, TaskState::Succeeded, Some(serde_json::json!({})))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::InvalidTransition {
                from: TaskState::Created,
                to: TaskState::Succeeded,
                ..
            }
        ));
        assert_eq!(store.get(task.id).await.unwrap(), task);
    }

    #[tokio::test]
    async fn dequeue_sets_heartbeat_and_transition_time() {
        let (store, clock) = store();
        let task = store
            .create(TaskProps::new("sync", "g", serde_json::json!({})))
            .await
            .unwrap();

        clock.advance(Duration::seconds(5));
        let started = store.dequeue(&"g".into(), 1).await.unwrap();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].id, task.id);
        assert_eq!(started[0].last_heartbeat_at, clock.now());
        assert_eq!(started[0].last_state_transition_at, clock.now());
    }

    #[tokio::test]
    async fn set_schedule_head_requires_existing_task() {
        let (store, _) = store();
        let schedule = ScheduleId::from_ulid(ulid::Ulid::new());
        let missing = TaskId::from_ulid(ulid::Ulid::new());
        assert!(matches!(
            store.set_schedule_head(schedule, missing).await,
            Err(SchedulerError::NotFound { .. })
        ));
    }
}
