//! Ports - 抽象化レイヤー
//!
//! 各 trait は外部システム（データベース、時計、通知先）へのインターフェースを提供し、
//! 実装の詳細を隠蔽します。実装は `impls` にあります。

pub mod clock;
pub mod event_sink;
pub mod id_generator;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::event_sink::{EventSink, FnEventSink, NoopEventSink, TracingEventSink};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::task_store::{REAP_BATCH_SIZE, TaskStore, reap_cutoff};
