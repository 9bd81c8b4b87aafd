//! Mapping between the `tasks` row shape and the domain `Task`.
//!
//! Pure translation: state text <-> enum, epoch millis <-> `DateTime<Utc>`,
//! JSON text <-> `serde_json::Value`. No behaviour lives here.

use chrono::{DateTime, Utc};

use super::SqliteError;
use crate::domain::{ScheduleId, Task, TaskId, TaskState};

/// Column list shared by every `SELECT` / `RETURNING` that builds a `TaskRow`.
pub(crate) const TASK_COLUMNS: &str = "id, name, payload, group_key, group_max_concurrency, \
     retry_max, retry_count, retry_key, starts_after, created_to_started_timeout_secs, \
     started_to_completed_timeout_secs, heartbeat_timeout_secs, created_at, state, \
     last_state_transition_at, last_heartbeat_at, output, terminated, schedule_id, owner_key";

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TaskRow {
    pub id: String,
    pub name: String,
    pub payload: String,
    pub group_key: String,
    pub group_max_concurrency: i64,
    pub retry_max: i64,
    pub retry_count: i64,
    pub retry_key: String,
    pub starts_after: i64,
    pub created_to_started_timeout_secs: i64,
    pub started_to_completed_timeout_secs: i64,
    pub heartbeat_timeout_secs: i64,
    pub created_at: i64,
    pub state: String,
    pub last_state_transition_at: i64,
    pub last_heartbeat_at: i64,
    pub output: Option<String>,
    pub terminated: bool,
    pub schedule_id: Option<String>,
    pub owner_key: Option<String>,
}

impl TaskRow {
    /// Read a row selected with [`TASK_COLUMNS`].
    pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            payload: row.get("payload")?,
            group_key: row.get("group_key")?,
            group_max_concurrency: row.get("group_max_concurrency")?,
            retry_max: row.get("retry_max")?,
            retry_count: row.get("retry_count")?,
            retry_key: row.get("retry_key")?,
            starts_after: row.get("starts_after")?,
            created_to_started_timeout_secs: row.get("created_to_started_timeout_secs")?,
            started_to_completed_timeout_secs: row.get("started_to_completed_timeout_secs")?,
            heartbeat_timeout_secs: row.get("heartbeat_timeout_secs")?,
            created_at: row.get("created_at")?,
            state: row.get("state")?,
            last_state_transition_at: row.get("last_state_transition_at")?,
            last_heartbeat_at: row.get("last_heartbeat_at")?,
            output: row.get("output")?,
            terminated: row.get("terminated")?,
            schedule_id: row.get("schedule_id")?,
            owner_key: row.get("owner_key")?,
        })
    }

    pub fn from_task(task: &Task) -> Result<Self, SqliteError> {
        Ok(Self {
            id: task.id.to_storage(),
            name: task.name.clone(),
            payload: serde_json::to_string(&task.payload)?,
            group_key: task.group_key.clone(),
            group_max_concurrency: i64::from(task.group_max_concurrency),
            retry_max: i64::from(task.retry_max),
            retry_count: i64::from(task.retry_count),
            retry_key: task.retry_key.clone(),
            starts_after: task.starts_after.timestamp_millis(),
            created_to_started_timeout_secs: i64::from(task.created_to_started_timeout_secs),
            started_to_completed_timeout_secs: i64::from(task.started_to_completed_timeout_secs),
            heartbeat_timeout_secs: i64::from(task.heartbeat_timeout_secs),
            created_at: task.created_at.timestamp_millis(),
            state: task.state.as_str().to_string(),
            last_state_transition_at: task.last_state_transition_at.timestamp_millis(),
            last_heartbeat_at: task.last_heartbeat_at.timestamp_millis(),
            output: task.output.as_ref().map(serde_json::to_string).transpose()?,
            terminated: task.terminated,
            schedule_id: task.schedule_id.map(|s| s.to_storage()),
            owner_key: task.owner_key.clone(),
        })
    }

    pub fn into_task(self) -> Result<Task, SqliteError> {
        Ok(Task {
            id: parse_id(&self.id)?,
            name: self.name,
            payload: serde_json::from_str(&self.payload)?,
            group_key: self.group_key,
            group_max_concurrency: to_u32("group_max_concurrency", self.group_max_concurrency)?,
            retry_max: to_u32("retry_max", self.retry_max)?,
            retry_count: to_u32("retry_count", self.retry_count)?,
            retry_key: self.retry_key,
            starts_after: from_millis(self.starts_after)?,
            created_to_started_timeout_secs: to_u32(
                "created_to_started_timeout_secs",
                self.created_to_started_timeout_secs,
            )?,
            started_to_completed_timeout_secs: to_u32(
                "started_to_completed_timeout_secs",
                self.started_to_completed_timeout_secs,
            )?,
            heartbeat_timeout_secs: to_u32("heartbeat_timeout_secs", self.heartbeat_timeout_secs)?,
            created_at: from_millis(self.created_at)?,
            state: self
                .state
                .parse::<TaskState>()
                .map_err(|e| SqliteError::Corrupt(e.to_string()))?,
            last_state_transition_at: from_millis(self.last_state_transition_at)?,
            last_heartbeat_at: from_millis(self.last_heartbeat_at)?,
            output: self
                .output
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            terminated: self.terminated,
            schedule_id: self
                .schedule_id
                .as_deref()
                .map(|s| {
                    s.parse::<ScheduleId>()
                        .map_err(|e| SqliteError::Corrupt(e.to_string()))
                })
                .transpose()?,
            owner_key: self.owner_key,
        })
    }
}

pub(crate) fn parse_id(s: &str) -> Result<TaskId, SqliteError> {
    s.parse::<TaskId>()
        .map_err(|e| SqliteError::Corrupt(e.to_string()))
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, SqliteError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| SqliteError::Corrupt(format!("timestamp out of range: {ms}")))
}

fn to_u32(column: &str, v: i64) -> Result<u32, SqliteError> {
    u32::try_from(v).map_err(|_| SqliteError::Corrupt(format!("{column} out of range: {v}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskProps;
    use chrono::TimeZone;
    use ulid::Ulid;

    #[test]
    fn task_survives_row_mapping() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 8, 30, 0).unwrap();
        let mut task = Task::new(
            TaskId::from_ulid(Ulid::new()),
            TaskProps::new("sync", "env:1", serde_json::json!({"nested": [1, "two", null]}))
                .with_group_max_concurrency(3)
                .with_schedule(ScheduleId::from_ulid(Ulid::new()))
                .with_owner_key("conn-42"),
            "retry".into(),
            now,
        );
        task.state = TaskState::Failed;
        task.terminated = true;
        task.output = Some(serde_json::json!("boom"));

        let row = TaskRow::from_task(&task).unwrap();
        assert_eq!(row.state, "FAILED");
        assert_eq!(row.starts_after, now.timestamp_millis());
        assert_eq!(row.into_task().unwrap(), task);
    }

    #[test]
    fn unknown_state_is_reported_as_corrupt() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 8, 30, 0).unwrap();
        let task = Task::new(
            TaskId::from_ulid(Ulid::new()),
            TaskProps::new("sync", "g", serde_json::json!({})),
            "retry".into(),
            now,
        );
        let mut row = TaskRow::from_task(&task).unwrap();
        row.state = "RUNNING".into();
        assert!(matches!(row.into_task(), Err(SqliteError::Corrupt(_))));
    }
}
