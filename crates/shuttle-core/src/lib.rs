//! shuttle-core
//!
//! Durable task scheduler: tasks are created, claimed per group key under a
//! concurrency budget, heartbeated, completed, expired when they stall and
//! finally reaped.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, state, task, group, admission, search, errors, events）
//! - **ports**: 抽象化レイヤー（TaskStore, Clock, IdGenerator, EventSink）
//! - **app**: アプリケーションロジック（Scheduler, builder, config, reaper_loop, gc_loop）
//! - **impls**: 実装（InMemoryTaskStore, SqliteTaskStore）

pub mod app;
pub mod domain;
pub mod impls;
pub mod ports;

pub use crate::app::{GcLoop, ReaperLoop, Scheduler, SchedulerBuilder, SchedulerConfig};
pub use crate::domain::{
    GroupKeyPattern, ScheduleId, SchedulerError, SearchParams, Task, TaskId, TaskProps, TaskState,
};
pub use crate::impls::{InMemoryTaskStore, SqliteTaskStore};
pub use crate::ports::TaskStore;
