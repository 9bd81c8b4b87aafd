use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{ScheduleId, TaskId, TaskState};

pub const DEFAULT_CREATED_TO_STARTED_TIMEOUT_SECS: u32 = 3600;
pub const DEFAULT_STARTED_TO_COMPLETED_TIMEOUT_SECS: u32 = 3600;
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u32 = 300;

/// A unit of schedulable work, as persisted.
///
/// Fields maintained by the store (`id`, timestamps, `state`, `output`,
/// `terminated`) are never set by callers; they go through [`TaskProps`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,

    /// Opaque to the scheduler.
    pub payload: serde_json::Value,

    pub group_key: String,

    /// 0 means unbounded.
    pub group_max_concurrency: u32,

    pub retry_max: u32,
    pub retry_count: u32,
    pub retry_key: String,

    pub starts_after: DateTime<Utc>,
    pub created_to_started_timeout_secs: u32,
    pub started_to_completed_timeout_secs: u32,
    pub heartbeat_timeout_secs: u32,

    pub created_at: DateTime<Utc>,
    pub last_state_transition_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,

    pub state: TaskState,
    pub output: Option<serde_json::Value>,

    /// Always `state.is_terminal()`; stored so "is it done" is an index lookup.
    pub terminated: bool,

    pub schedule_id: Option<ScheduleId>,
    pub owner_key: Option<String>,
}

impl Task {
    /// Build the initial `CREATED` record for `props`.
    pub fn new(id: TaskId, props: TaskProps, retry_key: String, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name: props.name,
            payload: props.payload,
            group_key: props.group_key,
            group_max_concurrency: props.group_max_concurrency,
            retry_max: props.retry_max,
            retry_count: props.retry_count,
            retry_key,
            starts_after: props.starts_after.unwrap_or(now),
            created_to_started_timeout_secs: props.created_to_started_timeout_secs,
            started_to_completed_timeout_secs: props.started_to_completed_timeout_secs,
            heartbeat_timeout_secs: props.heartbeat_timeout_secs,
            created_at: now,
            last_state_transition_at: now,
            last_heartbeat_at: now,
            state: TaskState::Created,
            output: None,
            terminated: false,
            schedule_id: props.schedule_id,
            owner_key: props.owner_key,
        }
    }

    /// Which timeout, if any, this task has exceeded at `now`.
    ///
    /// Precedence follows the sweep: a never-started task can only miss its
    /// pickup deadline; a started task is checked for heartbeat silence before
    /// the total budget. Heartbeats do not move the total budget.
    ///
    /// A deadline past the representable range never elapses.
    pub fn expiry_reason(&self, now: DateTime<Utc>) -> Option<ExpiryReason> {
        match self.state {
            TaskState::Created => {
                elapsed(now, self.starts_after, self.created_to_started_timeout_secs)
                    .then_some(ExpiryReason::CreatedToStartedTimeout)
            }
            TaskState::Started => {
                if elapsed(now, self.last_heartbeat_at, self.heartbeat_timeout_secs) {
                    Some(ExpiryReason::HeartbeatTimeout)
                } else if elapsed(
                    now,
                    self.last_state_transition_at,
                    self.started_to_completed_timeout_secs,
                ) {
                    Some(ExpiryReason::StartedToCompletedTimeout)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// The creation props that would recreate this task (used for retries).
    pub fn to_props(&self) -> TaskProps {
        TaskProps {
            name: self.name.clone(),
            payload: self.payload.clone(),
            group_key: self.group_key.clone(),
            group_max_concurrency: self.group_max_concurrency,
            retry_max: self.retry_max,
            retry_count: self.retry_count,
            retry_key: Some(self.retry_key.clone()),
            starts_after: None,
            created_to_started_timeout_secs: self.created_to_started_timeout_secs,
            started_to_completed_timeout_secs: self.started_to_completed_timeout_secs,
            heartbeat_timeout_secs: self.heartbeat_timeout_secs,
            schedule_id: self.schedule_id,
            owner_key: self.owner_key.clone(),
        }
    }
}

/// `now` is strictly past `since + timeout_secs`.
fn elapsed(now: DateTime<Utc>, since: DateTime<Utc>, timeout_secs: u32) -> bool {
    since
        .checked_add_signed(Duration::seconds(i64::from(timeout_secs)))
        .is_some_and(|deadline| now > deadline)
}

/// Creation input for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskProps {
    pub name: String,
    pub payload: serde_json::Value,
    pub group_key: String,
    #[serde(default)]
    pub group_max_concurrency: u32,
    #[serde(default)]
    pub retry_max: u32,
    #[serde(default)]
    pub retry_count: u32,

    /// Fresh random key when `None`.
    #[serde(default)]
    pub retry_key: Option<String>,

    /// Creation time when `None`.
    #[serde(default)]
    pub starts_after: Option<DateTime<Utc>>,

    #[serde(default = "default_created_to_started")]
    pub created_to_started_timeout_secs: u32,
    #[serde(default = "default_started_to_completed")]
    pub started_to_completed_timeout_secs: u32,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_timeout_secs: u32,

    #[serde(default)]
    pub schedule_id: Option<ScheduleId>,
    #[serde(default)]
    pub owner_key: Option<String>,
}

fn default_created_to_started() -> u32 {
    DEFAULT_CREATED_TO_STARTED_TIMEOUT_SECS
}

fn default_started_to_completed() -> u32 {
    DEFAULT_STARTED_TO_COMPLETED_TIMEOUT_SECS
}

fn default_heartbeat() -> u32 {
    DEFAULT_HEARTBEAT_TIMEOUT_SECS
}

impl TaskProps {
    /// Convenience constructor; everything else takes its default.
    pub fn new(
        name: impl Into<String>,
        group_key: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            payload,
            group_key: group_key.into(),
            group_max_concurrency: 0,
            retry_max: 0,
            retry_count: 0,
            retry_key: None,
            starts_after: None,
            created_to_started_timeout_secs: DEFAULT_CREATED_TO_STARTED_TIMEOUT_SECS,
            started_to_completed_timeout_secs: DEFAULT_STARTED_TO_COMPLETED_TIMEOUT_SECS,
            heartbeat_timeout_secs: DEFAULT_HEARTBEAT_TIMEOUT_SECS,
            schedule_id: None,
            owner_key: None,
        }
    }

    pub fn with_group_max_concurrency(mut self, n: u32) -> Self {
        self.group_max_concurrency = n;
        self
    }

    pub fn with_retry(mut self, retry_max: u32, retry_count: u32) -> Self {
        self.retry_max = retry_max;
        self.retry_count = retry_count;
        self
    }

    pub fn with_retry_key(mut self, key: impl Into<String>) -> Self {
        self.retry_key = Some(key.into());
        self
    }

    pub fn with_starts_after(mut self, at: DateTime<Utc>) -> Self {
        self.starts_after = Some(at);
        self
    }

    pub fn with_timeouts(
        mut self,
        created_to_started_secs: u32,
        started_to_completed_secs: u32,
        heartbeat_secs: u32,
    ) -> Self {
        self.created_to_started_timeout_secs = created_to_started_secs;
        self.started_to_completed_timeout_secs = started_to_completed_secs;
        self.heartbeat_timeout_secs = heartbeat_secs;
        self
    }

    pub fn with_schedule(mut self, schedule_id: ScheduleId) -> Self {
        self.schedule_id = Some(schedule_id);
        self
    }

    pub fn with_owner_key(mut self, key: impl Into<String>) -> Self {
        self.owner_key = Some(key.into());
        self
    }
}

/// Machine-readable reason written to `output.reason` on expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExpiryReason {
    CreatedToStartedTimeout,
    HeartbeatTimeout,
    StartedToCompletedTimeout,
}

impl ExpiryReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ExpiryReason::CreatedToStartedTimeout => "createdToStartedTimeoutSecs_exceeded",
            ExpiryReason::HeartbeatTimeout => "heartbeatTimeoutSecs_exceeded",
            ExpiryReason::StartedToCompletedTimeout => "startedToCompletedTimeoutSecs_exceeded",
        }
    }

    /// The `output` value of an expired task.
    pub fn to_output(self) -> serde_json::Value {
        serde_json::json!({ "reason": self.as_str() })
    }
}

impl fmt::Display for ExpiryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
