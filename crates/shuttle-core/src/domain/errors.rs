//! Errors - エラー型と分類
//!
//! 期待される結果（not found, invalid transition, 空の結果）はすべて型付きの値として返し、
//! panic しません。ストレージ障害だけが「想定外」で、原因（source）と
//! 操作名・キーを付けて呼び出し側に伝播します。

use super::{TaskId, TaskState};

/// Backend cause carried by storage failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// ErrorKind は実行エラーの分類
///
/// - Permanent: リトライしても結果は変わらない（not found, invalid transition）
/// - Infrastructure: ストレージ障害（backoff の後にリトライしてよい）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Permanent,
    Infrastructure,
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("task {id} not found")]
    NotFound { id: TaskId },

    /// The pair is outside the transition table, or the persisted state moved
    /// away from `from` before the write landed.
    #[error("invalid state transition for task {id}: {from} -> {to}")]
    InvalidTransition {
        id: TaskId,
        from: TaskState,
        to: TaskState,
    },

    #[error("error creating task '{name}': {source}")]
    CreateFailed {
        name: String,
        #[source]
        source: BoxError,
    },

    #[error("error dequeuing tasks for group key '{group_key}': {source}")]
    DequeueFailed {
        group_key: String,
        #[source]
        source: BoxError,
    },

    #[error("error expiring tasks: {source}")]
    SweepFailed {
        #[source]
        source: BoxError,
    },

    #[error("error hard deleting tasks older than {days} days: {source}")]
    ReapFailed {
        days: u32,
        #[source]
        source: BoxError,
    },

    /// Storage failure on a point operation (get, search, heartbeat, transition).
    #[error("storage error during {operation}: {source}")]
    Storage {
        operation: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SchedulerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SchedulerError::NotFound { .. }
            | SchedulerError::InvalidTransition { .. }
            | SchedulerError::Config(_) => ErrorKind::Permanent,
            SchedulerError::CreateFailed { .. }
            | SchedulerError::DequeueFailed { .. }
            | SchedulerError::SweepFailed { .. }
            | SchedulerError::ReapFailed { .. }
            | SchedulerError::Storage { .. } => ErrorKind::Infrastructure,
        }
    }

    /// Storage failures are safe to retry blindly after a backoff.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Infrastructure
    }

    pub(crate) fn storage(operation: &'static str, source: impl Into<BoxError>) -> Self {
        SchedulerError::Storage {
            operation,
            source: source.into(),
        }
    }
}
