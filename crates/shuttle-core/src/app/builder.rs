//! SchedulerBuilder - Scheduler の構築とワイヤリング
//!
//! 設定は build() の時点で検証します（Fail-fast）。不正な設定で
//! 監視ループが起動することはありません。

use std::sync::Arc;

use super::config::SchedulerConfig;
use super::scheduler::Scheduler;
use crate::domain::SchedulerError;
use crate::ports::{EventSink, NoopEventSink, TaskStore};

/// # 使用例
/// ```ignore
/// let scheduler = SchedulerBuilder::new(Arc::new(store))
///     .event_sink(Arc::new(TracingEventSink))
///     .config(config)
///     .build()?;
/// ```
pub struct SchedulerBuilder<S: TaskStore + ?Sized> {
    store: Arc<S>,
    events: Arc<dyn EventSink>,
    config: SchedulerConfig,
}

impl<S: TaskStore + ?Sized> SchedulerBuilder<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            events: Arc::new(NoopEventSink),
            config: SchedulerConfig::default(),
        }
    }

    pub fn event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Scheduler<S>, SchedulerError> {
        self.config.validate()?;
        Ok(Scheduler::new(self.store, self.events, self.config))
    }
}
