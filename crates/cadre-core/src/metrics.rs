//! Counters for conditions the runtime recovers from without surfacing an error
//!
//! The dispatcher drops events when its buffer is full and swallows handler
//! panics; retry and timeout helpers absorb failures. Each of those bumps a
//! named counter on the injected `MetricsSink` so the losses stay observable.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counter names emitted by the runtime
pub mod counters {
    pub const EVENTS_DISPATCHED: &str = "events.dispatched";
    pub const EVENTS_DROPPED: &str = "events.dropped";
    pub const HANDLER_PANICS: &str = "events.handler_panics";
    pub const BUFFERED_HANDLER_DROPPED: &str = "buffered_handler.dropped";
    pub const AGENT_RETRIES: &str = "agent.retries";
    pub const AGENT_TIMEOUTS: &str = "agent.timeouts";
}

/// Destination for runtime counters
pub trait MetricsSink: Send + Sync {
    fn incr_counter(&self, name: &str, by: u64);
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn incr_counter(&self, _name: &str, _by: u64) {}
}

/// Shared no-op sink
pub fn noop() -> Arc<dyn MetricsSink> {
    Arc::new(NoopMetrics)
}

/// In-process counters, readable at any time
#[derive(Debug, Default)]
pub struct AtomicMetrics {
    counters: DashMap<String, AtomicU64>,
}

impl AtomicMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter (0 if never incremented)
    pub fn get(&self, name: &str) -> u64 {
        self.counters
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.counters
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect()
    }

    pub fn reset(&self) {
        self.counters.clear();
    }
}

impl MetricsSink for AtomicMetrics {
    fn incr_counter(&self, name: &str, by: u64) {
        if let Some(counter) = self.counters.get(name) {
            counter.fetch_add(by, Ordering::Relaxed);
            return;
        }
        self.counters
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(by, Ordering::Relaxed);
    }
}
