//! Behaviour every TaskStore must share, run against each backend.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;
use shuttle_core::domain::{
    ExpiryReason, GroupKeyPattern, ScheduleId, SchedulerError, SearchParams, TaskId, TaskProps,
    TaskState,
};
use shuttle_core::impls::{InMemoryTaskStore, SqliteTaskStore};
use shuttle_core::ports::{Clock, FixedClock, REAP_BATCH_SIZE, TaskStore};
use ulid::Ulid;

fn clock() -> FixedClock {
    FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
}

fn memory() -> (Arc<InMemoryTaskStore>, FixedClock) {
    let clock = clock();
    let store = InMemoryTaskStore::new(Arc::new(clock.clone()) as Arc<dyn Clock>);
    (Arc::new(store), clock)
}

fn sqlite() -> (Arc<SqliteTaskStore>, FixedClock) {
    let clock = clock();
    let store = SqliteTaskStore::open_in_memory(Arc::new(clock.clone())).unwrap();
    (Arc::new(store), clock)
}

fn props(group_key: &str) -> TaskProps {
    TaskProps::new("sync", group_key, json!({}))
}

async fn start<S: TaskStore + ?Sized>(store: &S, clock: &FixedClock, p: TaskProps) -> TaskId {
    let task = store.create(p.clone()).await.unwrap();
    clock.advance(Duration::milliseconds(1));
    let started = store
        .dequeue(&GroupKeyPattern::new(task.group_key.clone()), 1)
        .await
        .unwrap();
    assert_eq!(started.len(), 1, "expected {} to start", task.id);
    task.id
}

async fn group_scenario<S: TaskStore + ?Sized>(store: Arc<S>, clock: FixedClock) {
    let a = store
        .create(props("g").with_group_max_concurrency(1))
        .await
        .unwrap();
    clock.advance(Duration::seconds(1));
    let b = store
        .create(props("g").with_group_max_concurrency(1))
        .await
        .unwrap();

    let first = store.dequeue(&"g".into(), 2).await.unwrap();
    assert_eq!(first.iter().map(|t| t.id).collect::<Vec<_>>(), vec![a.id]);
    assert_eq!(first[0].state, TaskState::Started);

    assert!(store.dequeue(&"g".into(), 2).await.unwrap().is_empty());

    store
        .transition_state(a.id, TaskState::Succeeded, Some(json!({"done": true})))
        .await
        .unwrap();
    let second = store.dequeue(&"g".into(), 2).await.unwrap();
    assert_eq!(second.iter().map(|t| t.id).collect::<Vec<_>>(), vec![b.id]);
}

async fn concurrency_cap<S: TaskStore + ?Sized>(store: Arc<S>, clock: FixedClock) {
    // R = 1 running, N = 3, M = 5 waiting
    start(store.as_ref(), &clock, props("g").with_group_max_concurrency(3)).await;
    let mut waiting = Vec::new();
    for _ in 0..5 {
        clock.advance(Duration::seconds(1));
        let task = store
            .create(props("g").with_group_max_concurrency(3))
            .await
            .unwrap();
        waiting.push(task.id);
    }

    let started = store.dequeue(&"g".into(), 10).await.unwrap();
    let ids: Vec<TaskId> = started.iter().map(|t| t.id).collect();
    assert_eq!(ids, waiting[..2].to_vec(), "oldest two fill the headroom");

    assert!(store.dequeue(&"g".into(), 10).await.unwrap().is_empty());
}

async fn unbounded_group<S: TaskStore + ?Sized>(store: Arc<S>, clock: FixedClock) {
    for _ in 0..3 {
        start(store.as_ref(), &clock, props("g")).await;
    }
    for _ in 0..6 {
        store.create(props("g")).await.unwrap();
    }

    assert_eq!(store.dequeue(&"g".into(), 4).await.unwrap().len(), 4);
    assert_eq!(store.dequeue(&"g".into(), 4).await.unwrap().len(), 2);
}

async fn dequeue_result_ordered_by_id<S: TaskStore + ?Sized>(store: Arc<S>, clock: FixedClock) {
    for group in ["b", "a", "c", "a"] {
        store.create(props(group)).await.unwrap();
        clock.advance(Duration::milliseconds(5));
    }

    let started = store.dequeue(&"*".into(), 10).await.unwrap();
    assert_eq!(started.len(), 4);
    assert!(started.windows(2).all(|w| w[0].id < w[1].id));
}

async fn limit_takes_globally_oldest<S: TaskStore + ?Sized>(store: Arc<S>, clock: FixedClock) {
    let oldest = store.create(props("x:2")).await.unwrap();
    clock.advance(Duration::seconds(1));
    let middle = store.create(props("x:1")).await.unwrap();
    clock.advance(Duration::seconds(1));
    store.create(props("x:2")).await.unwrap();

    let started = store.dequeue(&"x:*".into(), 2).await.unwrap();
    let ids: HashSet<TaskId> = started.iter().map(|t| t.id).collect();
    assert_eq!(ids, HashSet::from([oldest.id, middle.id]));
}

async fn no_double_claim<S: TaskStore + ?Sized + 'static>(store: Arc<S>, clock: FixedClock) {
    const CAP: usize = 4;
    for _ in 0..40 {
        store
            .create(props("hot").with_group_max_concurrency(CAP as u32))
            .await
            .unwrap();
        clock.advance(Duration::milliseconds(1));
    }

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store.dequeue(&"hot".into(), 3).await.unwrap()
        }));
    }

    let mut claimed = Vec::new();
    for handle in handles {
        claimed.extend(handle.await.unwrap().into_iter().map(|t| t.id));
    }
    let unique: HashSet<TaskId> = claimed.iter().copied().collect();
    assert_eq!(unique.len(), claimed.len(), "a task was claimed twice");
    assert_eq!(claimed.len(), CAP);

    let running = store
        .search(&SearchParams::new().states([TaskState::Started]))
        .await
        .unwrap();
    assert_eq!(running.len(), CAP);
}

async fn wildcard_dequeue<S: TaskStore + ?Sized>(store: Arc<S>, _clock: FixedClock) {
    store.create(props("env:1:sync")).await.unwrap();
    store.create(props("env:2:sync")).await.unwrap();
    store.create(props("env:2:action")).await.unwrap();
    store.create(props("other:sync")).await.unwrap();

    let started = store.dequeue(&"env:*:sync".into(), 10).await.unwrap();
    let mut keys: Vec<String> = started.into_iter().map(|t| t.group_key).collect();
    keys.sort();
    assert_eq!(keys, vec!["env:1:sync", "env:2:sync"]);
}

async fn future_tasks_wait<S: TaskStore + ?Sized>(store: Arc<S>, clock: FixedClock) {
    let later = clock.now() + Duration::minutes(5);
    let task = store
        .create(props("g").with_starts_after(later))
        .await
        .unwrap();

    assert!(store.dequeue(&"g".into(), 1).await.unwrap().is_empty());
    clock.set(later);
    let started = store.dequeue(&"g".into(), 1).await.unwrap();
    assert_eq!(started[0].id, task.id);
}

async fn transition_closure<S: TaskStore + ?Sized>(store: Arc<S>, clock: FixedClock) {
    let created = store.create(props("g")).await.unwrap();
    let started_id = start(store.as_ref(), &clock, props("h")).await;
    let started = store.get(started_id).await.unwrap();
    let finished_id = start(store.as_ref(), &clock, props("i")).await;
    let finished = store
        .transition_state(finished_id, TaskState::Failed, Some(json!("boom")))
        .await
        .unwrap();

    for task in [&created, &started, &finished] {
        for to in TaskState::ALL {
            if task.state.can_transition_to(to) {
                continue;
            }
            let err = store
                .transition_state(task.id, to, Some(json!({})))
                .await
                .unwrap_err();
            assert!(
                matches!(err, SchedulerError::InvalidTransition { from, .. } if from == task.state),
                "{} -> {to} must be rejected",
                task.state
            );
            assert_eq!(&store.get(task.id).await.unwrap(), task);
        }
    }
}

async fn transition_on_missing_task<S: TaskStore + ?Sized>(store: Arc<S>, _clock: FixedClock) {
    let missing = TaskId::from_ulid(Ulid::new());
    assert!(matches!(
        store
            .transition_state(missing, TaskState::Cancelled, None)
            .await,
        Err(SchedulerError::NotFound { id }) if id == missing
    ));
    assert!(matches!(
        store.heartbeat(missing).await,
        Err(SchedulerError::NotFound { .. })
    ));
    assert!(matches!(
        store.get(missing).await,
        Err(SchedulerError::NotFound { .. })
    ));
}

async fn expiry_reasons<S: TaskStore + ?Sized>(store: Arc<S>, clock: FixedClock) {
    let never_started = store
        .create(props("a").with_timeouts(10, 3600, 3600))
        .await
        .unwrap();
    let silent = start(store.as_ref(), &clock, props("b").with_timeouts(3600, 3600, 10)).await;
    let slow = start(store.as_ref(), &clock, props("c").with_timeouts(3600, 20, 10)).await;

    // keep `slow` alive past its total budget
    for _ in 0..3 {
        clock.advance(Duration::seconds(8));
        store.heartbeat(slow).await.unwrap();
    }
    // 24s elapsed: a and b have missed their 10s windows; c heartbeated but
    // exceeded its 20s budget
    let expired = store.expire_stale().await.unwrap();
    let reasons: Vec<(TaskId, serde_json::Value)> = expired
        .iter()
        .map(|t| (t.id, t.output.clone().unwrap()))
        .collect();

    assert_eq!(expired.len(), 3);
    assert!(expired.iter().all(|t| t.state == TaskState::Expired && t.terminated));
    assert!(expired.iter().all(|t| t.last_state_transition_at == clock.now()));
    assert!(reasons.contains(&(
        never_started.id,
        ExpiryReason::CreatedToStartedTimeout.to_output()
    )));
    assert!(reasons.contains(&(silent, ExpiryReason::HeartbeatTimeout.to_output())));
    assert!(reasons.contains(&(slow, ExpiryReason::StartedToCompletedTimeout.to_output())));

    assert!(store.expire_stale().await.unwrap().is_empty());
}

async fn heartbeat_keeps_task_alive<S: TaskStore + ?Sized>(store: Arc<S>, clock: FixedClock) {
    let id = start(store.as_ref(), &clock, props("g").with_timeouts(3600, 3600, 10)).await;
    for _ in 0..5 {
        clock.advance(Duration::seconds(9));
        let task = store.heartbeat(id).await.unwrap();
        assert_eq!(task.last_heartbeat_at, clock.now());
        assert!(store.expire_stale().await.unwrap().is_empty());
    }
}

async fn reap_keeps_schedule_head<S: TaskStore + ?Sized>(store: Arc<S>, clock: FixedClock) {
    let schedule = ScheduleId::from_ulid(Ulid::new());
    let mut ids = Vec::new();
    for _ in 0..3 {
        let task = store
            .create(props("s").with_schedule(schedule))
            .await
            .unwrap();
        store
            .transition_state(task.id, TaskState::Cancelled, Some(json!({"reason": "x"})))
            .await
            .unwrap();
        ids.push(task.id);
        clock.advance(Duration::hours(1));
    }
    let unrelated = store.create(props("t")).await.unwrap();
    store
        .transition_state(unrelated.id, TaskState::Cancelled, Some(json!({})))
        .await
        .unwrap();

    // nothing is old enough yet
    assert!(store.reap_older_than(10).await.unwrap().is_empty());

    clock.advance(Duration::days(11));
    let deleted: HashSet<TaskId> = store
        .reap_older_than(10)
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(deleted, HashSet::from([ids[0], ids[1], unrelated.id]));
    assert!(store.get(ids[2]).await.is_ok(), "schedule head must survive");
    assert!(store.reap_older_than(10).await.unwrap().is_empty());
}

async fn explicit_schedule_head<S: TaskStore + ?Sized>(store: Arc<S>, clock: FixedClock) {
    let schedule = ScheduleId::from_ulid(Ulid::new());
    let pinned = store.create(props("s")).await.unwrap();
    store
        .transition_state(pinned.id, TaskState::Cancelled, None)
        .await
        .unwrap();
    store.set_schedule_head(schedule, pinned.id).await.unwrap();

    clock.advance(Duration::days(30));
    assert!(store.reap_older_than(10).await.unwrap().is_empty());
}

async fn reap_skips_live_tasks<S: TaskStore + ?Sized>(store: Arc<S>, clock: FixedClock) {
    let created = store
        .create(props("g").with_timeouts(u32::MAX, 3600, 300))
        .await
        .unwrap();
    clock.advance(Duration::days(20));
    assert!(store.reap_older_than(10).await.unwrap().is_empty());
    assert!(store.get(created.id).await.is_ok());
}

async fn retry_key_defaulting<S: TaskStore + ?Sized>(store: Arc<S>, _clock: FixedClock) {
    let a = store.create(props("g")).await.unwrap();
    let b = store.create(props("g")).await.unwrap();
    assert!(!a.retry_key.is_empty());
    assert!(!b.retry_key.is_empty());
    assert_ne!(a.retry_key, b.retry_key);

    let c = store
        .create(props("g").with_retry_key(a.retry_key.clone()))
        .await
        .unwrap();
    assert_eq!(c.retry_key, a.retry_key);
}

async fn search_filters<S: TaskStore + ?Sized>(store: Arc<S>, clock: FixedClock) {
    let schedule = ScheduleId::from_ulid(Ulid::new());
    let a = store
        .create(props("g1").with_owner_key("conn-1").with_schedule(schedule))
        .await
        .unwrap();
    let b = store.create(props("g2").with_owner_key("conn-1")).await.unwrap();
    let c_id = start(store.as_ref(), &clock, props("g3")).await;

    let ids = |tasks: Vec<shuttle_core::domain::Task>| -> Vec<TaskId> {
        tasks.into_iter().map(|t| t.id).collect()
    };

    assert_eq!(
        ids(store.search(&SearchParams::new()).await.unwrap()),
        vec![a.id, b.id, c_id]
    );
    assert_eq!(
        ids(store.search(&SearchParams::new().group_key("g1")).await.unwrap()),
        vec![a.id]
    );
    assert_eq!(
        ids(store
            .search(&SearchParams::new().owner_key("conn-1").group_key("g2"))
            .await
            .unwrap()),
        vec![b.id]
    );
    assert_eq!(
        ids(store
            .search(&SearchParams::new().states([TaskState::Started]))
            .await
            .unwrap()),
        vec![c_id]
    );
    assert_eq!(
        ids(store
            .search(&SearchParams::new().schedule_id(schedule))
            .await
            .unwrap()),
        vec![a.id]
    );
    assert_eq!(
        ids(store
            .search(&SearchParams::new().ids([c_id, a.id]))
            .await
            .unwrap()),
        vec![a.id, c_id]
    );
    assert_eq!(
        ids(store
            .search(&SearchParams::new().retry_key(b.retry_key.clone()))
            .await
            .unwrap()),
        vec![b.id]
    );
    assert_eq!(
        ids(store.search(&SearchParams::new().limit(2)).await.unwrap()),
        vec![a.id, b.id]
    );
    // group_key in search is exact, never a pattern
    assert!(store
        .search(&SearchParams::new().group_key("g*"))
        .await
        .unwrap()
        .is_empty());
    assert!(store
        .search(&SearchParams::new().ids(Vec::new()))
        .await
        .unwrap()
        .is_empty());
}

async fn counts<S: TaskStore + ?Sized>(store: Arc<S>, clock: FixedClock) {
    store.create(props("g")).await.unwrap();
    let started = start(store.as_ref(), &clock, props("h")).await;
    store
        .transition_state(started, TaskState::Succeeded, Some(json!({})))
        .await
        .unwrap();

    let counts = store.counts_by_state().await.unwrap();
    assert_eq!(counts.get(TaskState::Created), 1);
    assert_eq!(counts.get(TaskState::Succeeded), 1);
    assert_eq!(counts.get(TaskState::Started), 0);
    assert_eq!(counts.total(), 2);
}

async fn zero_search_limit_uses_default<S: TaskStore + ?Sized>(store: Arc<S>, _clock: FixedClock) {
    for _ in 0..3 {
        store.create(props("g")).await.unwrap();
    }
    let found = store
        .search(&SearchParams::new().group_key("g").limit(0))
        .await
        .unwrap();
    assert_eq!(found.len(), 3);
}

async fn far_future_start_never_expires<S: TaskStore + ?Sized>(store: Arc<S>, clock: FixedClock) {
    let task = store
        .create(props("g").with_starts_after(DateTime::<Utc>::MAX_UTC))
        .await
        .unwrap();

    clock.advance(Duration::days(365));
    assert!(store.expire_stale().await.unwrap().is_empty());
    assert_eq!(store.get(task.id).await.unwrap().state, TaskState::Created);
}

async fn reap_with_unrepresentable_cutoff<S: TaskStore + ?Sized>(
    store: Arc<S>,
    clock: FixedClock,
) {
    let task = store.create(props("g")).await.unwrap();
    store
        .transition_state(task.id, TaskState::Cancelled, Some(json!({})))
        .await
        .unwrap();
    clock.advance(Duration::days(30));

    assert!(store.reap_older_than(u32::MAX).await.unwrap().is_empty());
    assert!(store.reap_older_than(200_000_000).await.unwrap().is_empty());
    assert!(store.get(task.id).await.is_ok());
}

async fn reap_batch_is_bounded<S: TaskStore + ?Sized>(store: Arc<S>, clock: FixedClock) {
    let mut ids = Vec::with_capacity(REAP_BATCH_SIZE + 1);
    for _ in 0..REAP_BATCH_SIZE + 1 {
        let task = store.create(props("g")).await.unwrap();
        store
            .transition_state(task.id, TaskState::Cancelled, Some(json!({})))
            .await
            .unwrap();
        ids.push(task.id);
    }
    clock.advance(Duration::days(11));

    let first = store.reap_older_than(10).await.unwrap();
    assert_eq!(first.len(), REAP_BATCH_SIZE);
    assert_eq!(
        first.iter().map(|t| t.id).collect::<Vec<_>>(),
        ids[..REAP_BATCH_SIZE].to_vec()
    );

    let second = store.reap_older_than(10).await.unwrap();
    assert_eq!(second.iter().map(|t| t.id).collect::<Vec<_>>(), vec![ids[REAP_BATCH_SIZE]]);
    assert!(store.reap_older_than(10).await.unwrap().is_empty());
}

macro_rules! contract_tests {
    ($backend:ident) => {
        mod $backend {
            use super::*;

            contract_tests!(@cases $backend;
                group_scenario,
                concurrency_cap,
                unbounded_group,
                dequeue_result_ordered_by_id,
                limit_takes_globally_oldest,
                no_double_claim,
                wildcard_dequeue,
                future_tasks_wait,
                transition_closure,
                transition_on_missing_task,
                expiry_reasons,
                heartbeat_keeps_task_alive,
                reap_keeps_schedule_head,
                explicit_schedule_head,
                reap_skips_live_tasks,
                retry_key_defaulting,
                search_filters,
                counts,
                zero_search_limit_uses_default,
                far_future_start_never_expires,
                reap_with_unrepresentable_cutoff,
                reap_batch_is_bounded,
            );
        }
    };
    (@cases $backend:ident; $($case:ident),* $(,)?) => {
        $(
            #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
            async fn $case() {
                let (store, clock) = super::$backend();
                super::$case(store, clock).await;
            }
        )*
    };
}

contract_tests!(memory);
contract_tests!(sqlite);
