//! Impls - TaskStore の実装
//!
//! # 含まれる実装
//! - **InMemoryTaskStore**: テスト・開発用（プロセス内のみ）
//! - **SqliteTaskStore**: 永続化（rusqlite, window function による dequeue）
//! - **GroupLocks**: 両方の store が使う group key 単位の mutex

pub mod group_lock;
pub mod memory;
pub mod sqlite;

pub use self::group_lock::GroupLocks;
pub use self::memory::InMemoryTaskStore;
pub use self::sqlite::{SqliteError, SqliteTaskStore};
