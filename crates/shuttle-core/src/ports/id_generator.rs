//! IdGenerator port - ID 生成の抽象化
//!
//! # 実装
//! - **UlidGenerator**: 単調増加 ULID（同じミリ秒内でも生成順に並ぶ）

use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use rand::Rng;
use rand::distributions::Alphanumeric;
use ulid::{Generator, Ulid};

use crate::domain::TaskId;
use crate::ports::Clock;

const RETRY_KEY_LEN: usize = 32;

/// IdGenerator は task id と retry key を生成
///
/// # Thread Safety
/// - `Send + Sync` を要求（複数の dequeue / create から同時に使われる）
pub trait IdGenerator: Send + Sync {
    /// Task ID を生成（生成順 = ソート順）
    fn generate_task_id(&self) -> TaskId;

    /// 呼び出し側が retry key を指定しなかったときのランダム値
    fn generate_retry_key(&self) -> String;
}

/// UlidGenerator は Clock ベースの単調 ULID 生成器
///
/// FixedClock と組み合わせても、同じタイムスタンプ内でランダム部が 1 ずつ増えるので
/// 「古い task ほど id が小さい」が保たれます。
pub struct UlidGenerator {
    clock: Arc<dyn Clock>,
    generator: Mutex<Generator>,
}

impl UlidGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            generator: Mutex::new(Generator::new()),
        }
    }
}

impl IdGenerator for UlidGenerator {
    fn generate_task_id(&self) -> TaskId {
        let now = SystemTime::from(self.clock.now());
        let mut generator = self.generator.lock().unwrap_or_else(|e| e.into_inner());
        match generator.generate_from_datetime(now) {
            Ok(ulid) => TaskId::from(ulid),
            // Random part overflowed within one millisecond (2^80 ids); the
            // next millisecond's ids still sort after this one.
            Err(_) => TaskId::from(Ulid::from_datetime(now)),
        }
    }

    fn generate_retry_key(&self) -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(RETRY_KEY_LEN)
            .map(char::from)
            .collect()
    }
}
