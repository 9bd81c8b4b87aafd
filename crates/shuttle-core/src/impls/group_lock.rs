//! GroupLocks - group key 単位の名前付き mutex
//!
//! dequeue は「同じ group key に対する dequeue」だけを直列化します。
//! group key をハッシュして固定数のストライプに割り当てるので、メモリは有界です。
//! ハッシュが衝突した別々の key は余計に直列化されるだけで、正しさには影響しません。

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

const DEFAULT_STRIPES: usize = 64;

pub struct GroupLocks {
    stripes: Vec<Arc<Mutex<()>>>,
}

impl GroupLocks {
    pub fn new() -> Self {
        Self::with_stripes(DEFAULT_STRIPES)
    }

    pub fn with_stripes(n: usize) -> Self {
        let n = n.max(1);
        Self {
            stripes: (0..n).map(|_| Arc::new(Mutex::new(()))).collect(),
        }
    }

    /// Hold the mutex for `group_key` until the guard is dropped.
    pub async fn lock(&self, group_key: &str) -> OwnedMutexGuard<()> {
        let stripe = &self.stripes[self.stripe_of(group_key)];
        Arc::clone(stripe).lock_owned().await
    }

    fn stripe_of(&self, group_key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        group_key.hash(&mut hasher);
        (hasher.finish() % self.stripes.len() as u64) as usize
    }
}

impl Default for GroupLocks {
    fn default() -> Self {
        Self::new()
    }
}
