//! Scheduler - TaskStore の上に乗るアプリケーション API
//!
//! store の操作をそのまま呼び、状態が変わった task を EventSink に流します。
//! 加えて失敗時のリトライ（同じ retry_key で task を作り直す）はここで行います。

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use super::config::SchedulerConfig;
use crate::domain::{
    GroupKeyPattern, SchedulerError, SearchParams, Task, TaskCounts, TaskEvent, TaskId, TaskProps,
    TaskState,
};
use crate::ports::{EventSink, TaskStore};

/// Result of [`Scheduler::fail`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailOutcome {
    pub task: Task,

    /// The follow-up attempt, when the retry budget allowed one and its
    /// creation succeeded.
    pub retry: Option<Task>,
}

/// Built with [`SchedulerBuilder`](super::SchedulerBuilder).
pub struct Scheduler<S: TaskStore + ?Sized> {
    store: Arc<S>,
    events: Arc<dyn EventSink>,
    config: SchedulerConfig,
}

impl<S: TaskStore + ?Sized> Clone for Scheduler<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            events: Arc::clone(&self.events),
            config: self.config.clone(),
        }
    }
}

impl<S: TaskStore + ?Sized> Scheduler<S> {
    pub(crate) fn new(store: Arc<S>, events: Arc<dyn EventSink>, config: SchedulerConfig) -> Self {
        Self {
            store,
            events,
            config,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn emit(&self, task: &Task) {
        self.events.emit(&TaskEvent::new(task.clone()));
    }

    pub async fn schedule(&self, props: TaskProps) -> Result<Task, SchedulerError> {
        let task = self.store.create(props).await?;
        self.emit(&task);
        Ok(task)
    }

    pub async fn get(&self, id: TaskId) -> Result<Task, SchedulerError> {
        self.store.get(id).await
    }

    pub async fn search(&self, params: &SearchParams) -> Result<Vec<Task>, SchedulerError> {
        self.store.search(params).await
    }

    pub async fn heartbeat(&self, id: TaskId) -> Result<Task, SchedulerError> {
        self.store.heartbeat(id).await
    }

    pub async fn dequeue(
        &self,
        pattern: impl Into<GroupKeyPattern>,
        limit: usize,
    ) -> Result<Vec<Task>, SchedulerError> {
        let tasks = self.store.dequeue(&pattern.into(), limit).await?;
        for task in &tasks {
            self.emit(task);
        }
        Ok(tasks)
    }

    pub async fn succeed(
        &self,
        id: TaskId,
        output: serde_json::Value,
    ) -> Result<Task, SchedulerError> {
        let task = self
            .store
            .transition_state(id, TaskState::Succeeded, Some(output))
            .await?;
        self.emit(&task);
        Ok(task)
    }

    /// STARTED -> FAILED, then schedule the next attempt while
    /// `retry_count < retry_max`.
    ///
    /// A failing retry creation is logged and leaves `retry` empty; the
    /// failed transition itself has already been persisted.
    pub async fn fail(
        &self,
        id: TaskId,
        error: serde_json::Value,
    ) -> Result<FailOutcome, SchedulerError> {
        let task = self
            .store
            .transition_state(id, TaskState::Failed, Some(error))
            .await?;
        self.emit(&task);

        if task.retry_count >= task.retry_max {
            return Ok(FailOutcome { task, retry: None });
        }

        let props = task.to_props().with_retry(task.retry_max, task.retry_count + 1);
        let retry = match self.store.create(props).await {
            Ok(retry) => {
                info!(
                    task_id = %task.id,
                    retry_id = %retry.id,
                    retry_count = retry.retry_count,
                    "scheduled retry"
                );
                self.emit(&retry);
                Some(retry)
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "failed to schedule retry");
                None
            }
        };
        Ok(FailOutcome { task, retry })
    }

    /// CREATED|STARTED -> CANCELLED with `{"reason": reason}` as output.
    pub async fn cancel(&self, id: TaskId, reason: impl Into<String>) -> Result<Task, SchedulerError> {
        let output = serde_json::json!({ "reason": reason.into() });
        let task = self
            .store
            .transition_state(id, TaskState::Cancelled, Some(output))
            .await?;
        self.emit(&task);
        Ok(task)
    }

    pub async fn expire(&self) -> Result<Vec<Task>, SchedulerError> {
        let tasks = self.store.expire_stale().await?;
        for task in &tasks {
            self.emit(task);
        }
        Ok(tasks)
    }

    /// One reaper batch. Deleted tasks are not reported to the event sink.
    pub async fn reap(&self, days: u32) -> Result<Vec<Task>, SchedulerError> {
        self.store.reap_older_than(days).await
    }

    pub async fn counts(&self) -> Result<TaskCounts, SchedulerError> {
        self.store.counts_by_state().await
    }
}
