//! ReaperLoop - 停滞した task の期限切れ処理
//!
//! `expiry_interval` ごとに `Scheduler::expire` を呼びます。
//! sweep の失敗はログに出して次の tick で再試行します（ストレージ障害は retryable）。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::scheduler::Scheduler;
use crate::ports::TaskStore;

/// Handle to the spawned expiry loop.
/// - `request_shutdown()` で次の tick の前に止まる
/// - `shutdown_and_join()` で終了を待てる
pub struct ReaperLoop {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ReaperLoop {
    pub fn spawn<S>(scheduler: Arc<Scheduler<S>>) -> Self
    where
        S: TaskStore + ?Sized + 'static,
    {
        let interval = scheduler.config().expiry_interval();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            reaper_loop(scheduler, interval, &mut shutdown_rx).await;
        });
        Self { shutdown_tx, join }
    }

    pub fn request_shutdown(&self) {
        // receiver may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        let _ = self.join.await;
    }
}

async fn reaper_loop<S>(
    scheduler: Arc<Scheduler<S>>,
    interval: Duration,
    shutdown_rx: &mut watch::Receiver<bool>,
) where
    S: TaskStore + ?Sized,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(interval_ms = interval.as_millis() as u64, "reaper loop started");

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

        match scheduler.expire().await {
            Ok(expired) if !expired.is_empty() => {
                info!(count = expired.len(), "expired tasks");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "expiry sweep failed");
            }
        }
    }

    debug!("reaper loop stopped");
}
