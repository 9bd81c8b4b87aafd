//! Concurrency-aware admission: which `CREATED` candidates may start now.
//!
//! Candidates are ranked per group key, oldest first (rank starts at 1). A
//! candidate is admitted iff its group is unbounded (`group_max_concurrency ==
//! 0`) or `rank + running <= group_max_concurrency`, where `running` is the
//! number of `STARTED` tasks already in that group. The globally oldest
//! `limit` admitted candidates win.
//!
//! The SQLite store expresses the same rule with `ROW_NUMBER() OVER
//! (PARTITION BY group_key ...)`; this is the in-process rendition.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use super::TaskId;

/// The fields of a `CREATED` task the admission rule looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate<'a> {
    pub id: TaskId,
    pub group_key: &'a str,
    pub group_max_concurrency: u32,
    pub created_at: DateTime<Utc>,
}

/// Select the ids to start, in ascending id order.
///
/// `running` maps a group key to its `STARTED` count; absent groups count 0.
pub fn admit(
    mut candidates: Vec<Candidate<'_>>,
    running: &HashMap<&str, usize>,
    limit: usize,
) -> Vec<TaskId> {
    if limit == 0 {
        return Vec::new();
    }

    candidates.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));

    let mut ranks: HashMap<&str, usize> = HashMap::new();
    let mut admitted: Vec<TaskId> = Vec::new();
    for candidate in &candidates {
        let rank = ranks.entry(candidate.group_key).or_insert(0);
        *rank += 1;

        let max = candidate.group_max_concurrency as usize;
        let already_running = running.get(candidate.group_key).copied().unwrap_or(0);
        if max == 0 || *rank + already_running <= max {
            admitted.push(candidate.id);
        }
    }

    // Candidates are in age order, so the first `limit` are the globally oldest.
    admitted.truncate(limit);
    admitted.sort();
    admitted
}
