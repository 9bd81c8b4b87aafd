//! App - アプリケーション層
//!
//! ports を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **SchedulerBuilder**: 設定の検証とワイヤリング
//! - **Scheduler**: schedule / dequeue / succeed / fail / cancel などの API
//! - **ReaperLoop**: 停滞した task の期限切れ処理
//! - **GcLoop**: 保持期間を過ぎた task の削除

pub mod builder;
pub mod config;
pub mod gc_loop;
pub mod reaper_loop;
pub mod scheduler;

pub use self::builder::SchedulerBuilder;
pub use self::config::SchedulerConfig;
pub use self::gc_loop::{GcLoop, reap_all};
pub use self::reaper_loop::ReaperLoop;
pub use self::scheduler::{FailOutcome, Scheduler};
