//! SQLite TaskStore implementation.
//!
//! 1 つの `Connection` を `Arc<Mutex<_>>` で共有し、各操作は
//! `spawn_blocking` 上で 1 トランザクションとして実行します。
//!
//! # dequeue の排他
//! SQLite には行ロックも `SKIP LOCKED` もないので、次の 2 段で直列化します：
//! 1. プロセス内: group key 単位の `GroupLocks`
//! 2. DB: `BEGIN IMMEDIATE`（書き込みロックを先に取る）+ `WHERE state = 'CREATED'` の再確認
//!
//! タイムスタンプは UTC の epoch millis（INTEGER）で保存します。

mod row;

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params, params_from_iter};
use tracing::{debug, info};

use self::row::{TASK_COLUMNS, TaskRow};
use super::group_lock::GroupLocks;
use crate::domain::{
    GroupKeyPattern, ScheduleId, SchedulerError, SearchParams, StateTransition, Task, TaskCounts,
    TaskId, TaskProps, TaskState,
};
use crate::ports::{Clock, IdGenerator, REAP_BATCH_SIZE, TaskStore, UlidGenerator, reap_cutoff};

const BUSY_TIMEOUT: StdDuration = StdDuration::from_secs(5);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id                                TEXT PRIMARY KEY NOT NULL,
    name                              TEXT NOT NULL,
    payload                           TEXT NOT NULL,
    group_key                         TEXT NOT NULL,
    group_max_concurrency             INTEGER NOT NULL DEFAULT 0,
    retry_max                         INTEGER NOT NULL DEFAULT 0,
    retry_count                       INTEGER NOT NULL DEFAULT 0,
    retry_key                         TEXT NOT NULL,
    starts_after                      INTEGER NOT NULL,
    created_to_started_timeout_secs   INTEGER NOT NULL,
    started_to_completed_timeout_secs INTEGER NOT NULL,
    heartbeat_timeout_secs            INTEGER NOT NULL,
    created_at                        INTEGER NOT NULL,
    state                             TEXT NOT NULL CHECK (state IN
        ('CREATED', 'STARTED', 'SUCCEEDED', 'FAILED', 'CANCELLED', 'EXPIRED')),
    last_state_transition_at          INTEGER NOT NULL,
    last_heartbeat_at                 INTEGER NOT NULL,
    output                            TEXT,
    terminated                        INTEGER NOT NULL DEFAULT 0,
    schedule_id                       TEXT,
    owner_key                         TEXT
);

CREATE INDEX IF NOT EXISTS idx_tasks_state_group_key ON tasks (state, group_key);
CREATE INDEX IF NOT EXISTS idx_tasks_group_key ON tasks (group_key);
CREATE INDEX IF NOT EXISTS idx_tasks_terminated_starts_after ON tasks (terminated, starts_after);
CREATE INDEX IF NOT EXISTS idx_tasks_schedule_id ON tasks (schedule_id);
CREATE INDEX IF NOT EXISTS idx_tasks_retry_key ON tasks (retry_key);
CREATE INDEX IF NOT EXISTS idx_tasks_owner_key ON tasks (owner_key);

CREATE TABLE IF NOT EXISTS schedule_heads (
    schedule_id            TEXT PRIMARY KEY NOT NULL,
    last_scheduled_task_id TEXT NOT NULL
);
"#;

/// Eligible `CREATED` rows ranked inside their group, admitted against the
/// group's `STARTED` count. `?1` glob, `?2` now (ms), `?3` limit.
const DEQUEUE_CANDIDATES_SQL: &str = r#"
WITH candidates AS (
    SELECT id, group_key, group_max_concurrency, created_at,
           ROW_NUMBER() OVER (PARTITION BY group_key ORDER BY created_at, id) AS rank
    FROM tasks
    WHERE state = 'CREATED' AND group_key GLOB ?1 AND starts_after <= ?2
),
running AS (
    SELECT group_key, COUNT(*) AS running_count
    FROM tasks
    WHERE state = 'STARTED' AND group_key IN (SELECT group_key FROM candidates)
    GROUP BY group_key
)
SELECT c.id
FROM candidates c
LEFT JOIN running r ON r.group_key = c.group_key
WHERE c.group_max_concurrency = 0
   OR c.rank + COALESCE(r.running_count, 0) <= c.group_max_concurrency
ORDER BY c.created_at, c.id
LIMIT ?3
"#;

/// Backend failures, before they are tagged with the failing operation.
#[derive(Debug, thiserror::Error)]
pub enum SqliteError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("connection mutex poisoned")]
    Poisoned,

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Result of a single-row write that can lose its precondition.
enum Guarded {
    Applied(Task),
    Missing,
    Rejected(TaskState),
}

pub struct SqliteTaskStore {
    conn: Arc<Mutex<Connection>>,
    group_locks: GroupLocks,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl SqliteTaskStore {
    /// Open (or create) the database file and apply the schema.
    pub fn open(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self, SchedulerError> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|e| SchedulerError::storage("open", e))?;
        let store = Self::from_connection(conn, clock)?;
        info!(path = %path.display(), "opened sqlite task store");
        Ok(store)
    }

    pub fn open_in_memory(clock: Arc<dyn Clock>) -> Result<Self, SchedulerError> {
        let conn = Connection::open_in_memory().map_err(|e| SchedulerError::storage("open", e))?;
        Self::from_connection(conn, clock)
    }

    fn from_connection(conn: Connection, clock: Arc<dyn Clock>) -> Result<Self, SchedulerError> {
        init(&conn).map_err(|e| SchedulerError::storage("migrate", e))?;
        let ids = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            group_locks: GroupLocks::new(),
            clock,
            ids,
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T, SqliteError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, SqliteError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|_| SqliteError::Poisoned)?;
            f(&mut conn)
        })
        .await?
    }
}

fn init(conn: &Connection) -> Result<(), SqliteError> {
    // in-memory databases answer "memory" here, which is fine
    let _mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

fn select_task(conn: &Connection, id: &str) -> Result<Option<Task>, SqliteError> {
    conn.query_row(
        &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
        params![id],
        TaskRow::from_row,
    )
    .optional()?
    .map(TaskRow::into_task)
    .transpose()
}

/// Compare-and-set one transition: the row is written only while it is still
/// in `transition.from()`.
fn write_transition(
    conn: &Connection,
    id: &str,
    transition: StateTransition,
    output: Option<&serde_json::Value>,
    now: DateTime<Utc>,
) -> Result<Option<Task>, SqliteError> {
    let output = output.map(serde_json::to_string).transpose()?;
    let now = now.timestamp_millis();
    conn.query_row(
        &format!(
            "UPDATE tasks SET state = ?1, terminated = ?2, output = ?3, \
                 last_state_transition_at = ?4, \
                 last_heartbeat_at = CASE WHEN ?1 = 'STARTED' THEN ?4 ELSE last_heartbeat_at END \
             WHERE id = ?5 AND state = ?6 \
             RETURNING {TASK_COLUMNS}"
        ),
        params![
            transition.to().as_str(),
            transition.terminated(),
            output,
            now,
            id,
            transition.from().as_str(),
        ],
        TaskRow::from_row,
    )
    .optional()?
    .map(TaskRow::into_task)
    .transpose()
}

fn collect_tasks(
    stmt: &mut rusqlite::Statement<'_>,
    params: impl rusqlite::Params,
) -> Result<Vec<Task>, SqliteError> {
    let rows = stmt
        .query_map(params, TaskRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(TaskRow::into_task).collect()
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn create(&self, props: TaskProps) -> Result<Task, SchedulerError> {
        let name = props.name.clone();
        let now = self.clock.now();
        let id = self.ids.generate_task_id();
        let retry_key = match props.retry_key.clone() {
            Some(key) => key,
            None => self.ids.generate_retry_key(),
        };
        let task = Task::new(id, props, retry_key, now);
        let row = TaskRow::from_task(&task)
            .map_err(|e| SchedulerError::CreateFailed { name: name.clone(), source: e.into() })?;

        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                &format!(
                    "INSERT INTO tasks ({TASK_COLUMNS}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, \
                      ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)"
                ),
                params![
                    row.id,
                    row.name,
                    row.payload,
                    row.group_key,
                    row.group_max_concurrency,
                    row.retry_max,
                    row.retry_count,
                    row.retry_key,
                    row.starts_after,
                    row.created_to_started_timeout_secs,
                    row.started_to_completed_timeout_secs,
                    row.heartbeat_timeout_secs,
                    row.created_at,
                    row.state,
                    row.last_state_transition_at,
                    row.last_heartbeat_at,
                    row.output,
                    row.terminated,
                    row.schedule_id,
                    row.owner_key,
                ],
            )?;
            if let Some(schedule_id) = &row.schedule_id {
                upsert_head(&tx, schedule_id, &row.id)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
        .map_err(|e| SchedulerError::CreateFailed { name, source: e.into() })?;

        Ok(task)
    }

    async fn get(&self, id: TaskId) -> Result<Task, SchedulerError> {
        let key = id.to_storage();
        self.blocking(move |conn| select_task(conn, &key))
            .await
            .map_err(|e| SchedulerError::storage("get", e))?
            .ok_or(SchedulerError::NotFound { id })
    }

    async fn search(&self, params: &SearchParams) -> Result<Vec<Task>, SchedulerError> {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();

        fn in_list(
            column: &str,
            items: Vec<String>,
            clauses: &mut Vec<String>,
            values: &mut Vec<SqlValue>,
        ) {
            let start = values.len();
            let marks: Vec<String> = (0..items.len())
                .map(|i| format!("?{}", start + i + 1))
                .collect();
            clauses.push(format!("{column} IN ({})", marks.join(", ")));
            values.extend(items.into_iter().map(SqlValue::Text));
        }

        fn eq(column: &str, value: String, clauses: &mut Vec<String>, values: &mut Vec<SqlValue>) {
            values.push(SqlValue::Text(value));
            clauses.push(format!("{column} = ?{}", values.len()));
        }

        if let Some(ids) = &params.ids {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            let ids = ids.iter().map(|id| id.to_storage()).collect();
            in_list("id", ids, &mut clauses, &mut values);
        }
        if let Some(states) = &params.states {
            if states.is_empty() {
                return Ok(Vec::new());
            }
            let states = states.iter().map(|s| s.as_str().to_string()).collect();
            in_list("state", states, &mut clauses, &mut values);
        }
        if let Some(group_key) = &params.group_key {
            eq("group_key", group_key.clone(), &mut clauses, &mut values);
        }
        if let Some(schedule_id) = params.schedule_id {
            eq("schedule_id", schedule_id.to_storage(), &mut clauses, &mut values);
        }
        if let Some(retry_key) = &params.retry_key {
            eq("retry_key", retry_key.clone(), &mut clauses, &mut values);
        }
        if let Some(owner_key) = &params.owner_key {
            eq("owner_key", owner_key.clone(), &mut clauses, &mut values);
        }

        let limit = i64::try_from(params.effective_limit()).unwrap_or(i64::MAX);
        values.push(SqlValue::Integer(limit));

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks {where_clause} ORDER BY id LIMIT ?{}",
            values.len()
        );

        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            collect_tasks(&mut stmt, params_from_iter(values.iter()))
        })
        .await
        .map_err(|e| SchedulerError::storage("search", e))
    }

    async fn heartbeat(&self, id: TaskId) -> Result<Task, SchedulerError> {
        let key = id.to_storage();
        let now = self.clock.now().timestamp_millis();
        self.blocking(move |conn| {
            conn.query_row(
                &format!(
                    "UPDATE tasks SET last_heartbeat_at = ?1 WHERE id = ?2 \
                     RETURNING {TASK_COLUMNS}"
                ),
                params![now, key],
                TaskRow::from_row,
            )
            .optional()?
            .map(TaskRow::into_task)
            .transpose()
        })
        .await
        .map_err(|e| SchedulerError::storage("heartbeat", e))?
        .ok_or(SchedulerError::NotFound { id })
    }

    async fn dequeue(
        &self,
        pattern: &GroupKeyPattern,
        limit: usize,
    ) -> Result<Vec<Task>, SchedulerError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let Some(transition) = StateTransition::validate(TaskState::Created, TaskState::Started)
        else {
            return Ok(Vec::new());
        };

        let _group_guard = self.group_locks.lock(pattern.as_str()).await;
        let glob = pattern.to_glob();
        let now = self.clock.now();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let started = self
            .blocking(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let admitted: Vec<String> = {
                    let mut stmt = tx.prepare(DEQUEUE_CANDIDATES_SQL)?;
                    let ids = stmt
                        .query_map(params![glob, now.timestamp_millis(), limit], |row| {
                            row.get::<_, String>(0)
                        })?
                        .collect::<Result<Vec<_>, _>>()?;
                    ids
                };

                let mut started = Vec::with_capacity(admitted.len());
                for id in &admitted {
                    if let Some(task) = write_transition(&tx, id, transition, None, now)? {
                        started.push(task);
                    }
                }
                tx.commit()?;
                started.sort_by_key(|t| t.id);
                Ok(started)
            })
            .await
            .map_err(|e| SchedulerError::DequeueFailed {
                group_key: pattern.to_string(),
                source: e.into(),
            })?;

        debug!(group_key = %pattern, count = started.len(), "dequeued tasks");
        Ok(started)
    }

    async fn transition_state(
        &self,
        id: TaskId,
        to: TaskState,
        output: Option<serde_json::Value>,
    ) -> Result<Task, SchedulerError> {
        let key = id.to_storage();
        let now = self.clock.now();

        let outcome = self
            .blocking(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let current: Option<String> = tx
                    .query_row(
                        "SELECT state FROM tasks WHERE id = ?1",
                        params![key],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(current) = current else {
                    return Ok(Guarded::Missing);
                };
                let from = current
                    .parse::<TaskState>()
                    .map_err(|e| SqliteError::Corrupt(e.to_string()))?;
                let Some(transition) = StateTransition::validate(from, to) else {
                    return Ok(Guarded::Rejected(from));
                };

                let output = transition.output(output);
                let outcome = match write_transition(&tx, &key, transition, output.as_ref(), now)? {
                    Some(task) => Guarded::Applied(task),
                    None => Guarded::Rejected(from),
                };
                tx.commit()?;
                Ok(outcome)
            })
            .await
            .map_err(|e| SchedulerError::storage("transition_state", e))?;

        match outcome {
            Guarded::Applied(task) => Ok(task),
            Guarded::Missing => Err(SchedulerError::NotFound { id }),
            Guarded::Rejected(from) => Err(SchedulerError::InvalidTransition { id, from, to }),
        }
    }

    async fn expire_stale(&self) -> Result<Vec<Task>, SchedulerError> {
        let now = self.clock.now();

        let expired = self
            .blocking(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let stale = {
                    let mut stmt = tx.prepare(&format!(
                        "SELECT {TASK_COLUMNS} FROM tasks \
                         WHERE (state = 'CREATED' \
                                AND starts_after + created_to_started_timeout_secs * 1000 < ?1) \
                            OR (state = 'STARTED' \
                                AND (last_heartbeat_at + heartbeat_timeout_secs * 1000 < ?1 \
                                     OR last_state_transition_at \
                                        + started_to_completed_timeout_secs * 1000 < ?1)) \
                         ORDER BY id"
                    ))?;
                    collect_tasks(&mut stmt, params![now.timestamp_millis()])?
                };

                let mut expired = Vec::with_capacity(stale.len());
                for task in stale {
                    let Some(reason) = task.expiry_reason(now) else {
                        continue;
                    };
                    let Some(transition) =
                        StateTransition::validate(task.state, TaskState::Expired)
                    else {
                        continue;
                    };
                    let key = task.id.to_storage();
                    let output = reason.to_output();
                    if let Some(task) = write_transition(&tx, &key, transition, Some(&output), now)?
                    {
                        expired.push(task);
                    }
                }
                tx.commit()?;
                Ok(expired)
            })
            .await
            .map_err(|e| SchedulerError::SweepFailed { source: e.into() })?;

        if !expired.is_empty() {
            debug!(count = expired.len(), "expired stale tasks");
        }
        Ok(expired)
    }

    async fn reap_older_than(&self, days: u32) -> Result<Vec<Task>, SchedulerError> {
        let Some(cutoff) = reap_cutoff(self.clock.now(), days) else {
            return Ok(Vec::new());
        };
        let cutoff = cutoff.timestamp_millis();
        let batch = i64::try_from(REAP_BATCH_SIZE).unwrap_or(i64::MAX);

        let mut deleted = self
            .blocking(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let deleted = {
                    let mut stmt = tx.prepare(&format!(
                        "DELETE FROM tasks WHERE id IN ( \
                             SELECT t.id FROM tasks t \
                             LEFT JOIN schedule_heads h ON h.last_scheduled_task_id = t.id \
                             WHERE t.terminated = 1 AND t.starts_after < ?1 \
                               AND h.schedule_id IS NULL \
                             ORDER BY t.id LIMIT ?2 \
                         ) RETURNING {TASK_COLUMNS}"
                    ))?;
                    collect_tasks(&mut stmt, params![cutoff, batch])?
                };
                tx.commit()?;
                Ok(deleted)
            })
            .await
            .map_err(|e| SchedulerError::ReapFailed { days, source: e.into() })?;

        deleted.sort_by_key(|t| t.id);
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
        let schedule = schedule_id.to_storage();
        let key = task_id.to_storage();

        let found = self
            .blocking(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let exists = tx
                    .query_row("SELECT 1 FROM tasks WHERE id = ?1", params![key], |_| Ok(()))
                    .optional()?
                    .is_some();
                if exists {
                    upsert_head(&tx, &schedule, &key)?;
                }
                tx.commit()?;
                Ok(exists)
            })
            .await
            .map_err(|e| SchedulerError::storage("set_schedule_head", e))?;

        if found {
            Ok(())
        } else {
            Err(SchedulerError::NotFound { id: task_id })
        }
    }

    async fn counts_by_state(&self) -> Result<TaskCounts, SchedulerError> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM tasks GROUP BY state")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;

            let mut counts = TaskCounts::default();
            for (state, n) in rows {
                let state = state
                    .parse::<TaskState>()
                    .map_err(|e| SqliteError::Corrupt(e.to_string()))?;
                let n = usize::try_from(n).map_err(|_| SqliteError::Corrupt(n.to_string()))?;
                counts.add(state, n);
            }
            Ok(counts)
        })
        .await
        .map_err(|e| SchedulerError::storage("counts_by_state", e))
    }
}

fn upsert_head(conn: &Connection, schedule_id: &str, task_id: &str) -> Result<(), SqliteError> {
    conn.execute(
        "INSERT INTO schedule_heads (schedule_id, last_scheduled_task_id) VALUES (?1, ?2) \
         ON CONFLICT (schedule_id) DO UPDATE SET \
             last_scheduled_task_id = excluded.last_scheduled_task_id",
        params![schedule_id, task_id],
    )?;
    Ok(())
}
