//! TaskStore port - タスクの正本（source of truth）
//!
//! すべての書き込みは次のどれかに限られます：
//! - 追加（create）
//! - 検証済みの状態遷移（transition_state / dequeue / expire_stale）
//! - heartbeat タイムスタンプの更新
//! - 削除（reap_older_than）
//!
//! # 実装
//! - `InMemoryTaskStore`: テスト・開発用
//! - `SqliteTaskStore`: 永続化（window function による dequeue）

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::domain::{
    GroupKeyPattern, ScheduleId, SchedulerError, SearchParams, Task, TaskCounts, TaskId, TaskProps,
    TaskState,
};

/// Maximum rows deleted by one `reap_older_than` call.
pub const REAP_BATCH_SIZE: usize = 1000;

/// `now - days`, or `None` when that instant is not representable
/// (nothing can be old enough to reap).
pub fn reap_cutoff(now: DateTime<Utc>, days: u32) -> Option<DateTime<Utc>> {
    now.checked_sub_signed(Duration::days(i64::from(days)))
}

/// TaskStore は状態と履歴の正本
///
/// # 設計原則
/// - 各メソッドは 1 トランザクション（all-or-nothing）
/// - 状態は `StateTransition::validate` を通ったものだけが書かれる
/// - 期待される結果（空・not found・不正遷移）は `Result` の値として返す
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new `CREATED` task.
    async fn create(&self, props: TaskProps) -> Result<Task, SchedulerError>;

    async fn get(&self, id: TaskId) -> Result<Task, SchedulerError>;

    /// Ordered by id ascending, at most `params.effective_limit()` rows.
    async fn search(&self, params: &SearchParams) -> Result<Vec<Task>, SchedulerError>;

    /// Set `last_heartbeat_at = now` whatever the state.
    async fn heartbeat(&self, id: TaskId) -> Result<Task, SchedulerError>;

    /// Claim up to `limit` eligible `CREATED` tasks matching `pattern`,
    /// honouring each group's concurrency budget. Result ordered by id.
    async fn dequeue(
        &self,
        pattern: &GroupKeyPattern,
        limit: usize,
    ) -> Result<Vec<Task>, SchedulerError>;

    /// Apply one validated transition. `output` is dropped for `STARTED`.
    async fn transition_state(
        &self,
        id: TaskId,
        to: TaskState,
        output: Option<serde_json::Value>,
    ) -> Result<Task, SchedulerError>;

    /// Move every stalled task to `EXPIRED` with `{"reason": ...}`.
    async fn expire_stale(&self) -> Result<Vec<Task>, SchedulerError>;

    /// Delete up to [`REAP_BATCH_SIZE`] terminated tasks whose `starts_after`
    /// is more than `days` old, keeping every schedule's head. Returns the
    /// deleted rows; call again until empty.
    async fn reap_older_than(&self, days: u32) -> Result<Vec<Task>, SchedulerError>;

    /// Point `schedule_id`'s head at `task_id`. `create` already does this
    /// for tasks carrying a schedule id.
    async fn set_schedule_head(
        &self,
        schedule_id: ScheduleId,
        task_id: TaskId,
    ) -> Result<(), SchedulerError>;

    async fn counts_by_state(&self) -> Result<TaskCounts, SchedulerError>;
}
