//! GcLoop - 保持期間を過ぎた task の物理削除
//!
//! `gc_interval` ごとに `Scheduler::reap(retention_days)` をバッチが空になるまで繰り返します。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::scheduler::Scheduler;
use crate::domain::SchedulerError;
use crate::ports::TaskStore;

/// Handle to the spawned retention loop. Stops like [`ReaperLoop`](super::ReaperLoop).
pub struct GcLoop {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl GcLoop {
    pub fn spawn<S>(scheduler: Arc<Scheduler<S>>) -> Self
    where
        S: TaskStore + ?Sized + 'static,
    {
        let interval = scheduler.config().gc_interval();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            gc_loop(scheduler, interval, &mut shutdown_rx).await;
        });
        Self { shutdown_tx, join }
    }

    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        let _ = self.join.await;
    }
}

/// Reap batches until one comes back empty. Returns the number of deleted tasks.
///
/// A failing batch aborts the run; batches already committed stay deleted
/// and their count is logged.
pub async fn reap_all<S>(scheduler: &Scheduler<S>, days: u32) -> Result<usize, SchedulerError>
where
    S: TaskStore + ?Sized,
{
    let mut total = 0;
    loop {
        match scheduler.reap(days).await {
            Ok(batch) if batch.is_empty() => return Ok(total),
            Ok(batch) => total += batch.len(),
            Err(e) => {
                warn!(days, deleted = total, error = %e, "reap aborted");
                return Err(e);
            }
        }
    }
}

async fn gc_loop<S>(
    scheduler: Arc<Scheduler<S>>,
    interval: Duration,
    shutdown_rx: &mut watch::Receiver<bool>,
) where
    S: TaskStore + ?Sized,
{
    let days = scheduler.config().retention_days;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(retention_days = days, "gc loop started");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            _ = ticker.tick() => {}
        }

        match reap_all(&scheduler, days).await {
            Ok(0) => {}
            Ok(deleted) => {
                info!(count = deleted, retention_days = days, "reaped terminated tasks");
            }
            Err(e) => {
                warn!(retention_days = days, error = %e, "gc pass failed");
            }
        }
    }

    debug!("gc loop stopped");
}
