//! EventSink port - 状態変化の通知
//!
//! Scheduler は状態が変わった task を 1 件ずつ `emit` します（CREATED / STARTED /
//! SUCCEEDED / FAILED / CANCELLED / EXPIRED）。通知は fire-and-forget で、
//! 実装はブロックしてはいけません。

use std::sync::Arc;

use tracing::info;

use crate::domain::TaskEvent;

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &TaskEvent);
}

/// 何もしない（デフォルト）
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: &TaskEvent) {}
}

/// 状態変化を tracing のログとして出す
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: &TaskEvent) {
        let task = &event.task;
        info!(
            task_id = %task.id,
            name = %task.name,
            group_key = %task.group_key,
            state = %task.state,
            "task state changed"
        );
    }
}

/// Closure sink, e.g. one callback that switches on `event.state()`.
pub struct FnEventSink {
    f: Arc<dyn Fn(&TaskEvent) + Send + Sync>,
}

impl FnEventSink {
    pub fn new(f: impl Fn(&TaskEvent) + Send + Sync + 'static) -> Self {
        Self { f: Arc::new(f) }
    }
}

impl EventSink for FnEventSink {
    fn emit(&self, event: &TaskEvent) {
        (self.f)(event)
    }
}
