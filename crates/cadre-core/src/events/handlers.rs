//! Event handler capability and its combinators

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{matches_all, Event, EventFilter};
use crate::error::{AgentRuntimeError, MultiError, Result};
use crate::metrics::{self, counters, MetricsSink};

/// Observer of events
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: &Event) -> Result<()>;
}

/// Handler backed by a plain closure
pub struct EventHandlerFn<F>(pub F);

#[async_trait]
impl<F> EventHandler for EventHandlerFn<F>
where
    F: Fn(&Event) -> Result<()> + Send + Sync,
{
    async fn handle_event(&self, event: &Event) -> Result<()> {
        (self.0)(event)
    }
}

/// Wrap a closure as a shareable handler
pub fn handler_fn<F>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(EventHandlerFn(f))
}

// ============================================================================
// Buffered
// ============================================================================

/// Queues events into its own bounded buffer and forwards them from a
/// background task. Overflow drops the event, like the dispatcher does.
pub struct BufferedEventHandler {
    tx: Mutex<Option<mpsc::Sender<Event>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<dyn MetricsSink>,
}

impl BufferedEventHandler {
    pub fn new(inner: Arc<dyn EventHandler>, buffer_size: usize) -> Self {
        Self::with_metrics(inner, buffer_size, metrics::noop())
    }

    pub fn with_metrics(
        inner: Arc<dyn EventHandler>,
        buffer_size: usize,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<Event>(buffer_size.max(1));
        let worker = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = inner.handle_event(&event).await {
                    tracing::debug!(event = %event.event_type, error = %e, "Buffered handler failed");
                }
            }
        });

        Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            metrics,
        }
    }

    /// Stop accepting events and wait for the buffer to drain
    pub async fn close(&self) {
        drop(self.tx.lock().take());
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

#[async_trait]
impl EventHandler for BufferedEventHandler {
    async fn handle_event(&self, event: &Event) -> Result<()> {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(AgentRuntimeError::EventDispatch("handler closed".into()));
        };
        match tx.try_send(event.clone()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.metrics
                    .incr_counter(counters::BUFFERED_HANDLER_DROPPED, 1);
                Err(AgentRuntimeError::EventDispatch("buffer full".into()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(AgentRuntimeError::EventDispatch("handler closed".into()))
            }
        }
    }
}

// ============================================================================
// Composite and filtered
// ============================================================================

/// Fans each event out to every inner handler, collecting their failures
#[derive(Default)]
pub struct CompositeEventHandler {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl CompositeEventHandler {
    pub fn new(handlers: Vec<Arc<dyn EventHandler>>) -> Self {
        Self { handlers }
    }

    pub fn add(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }
}

#[async_trait]
impl EventHandler for CompositeEventHandler {
    async fn handle_event(&self, event: &Event) -> Result<()> {
        let mut errors = MultiError::new();
        for handler in &self.handlers {
            if let Err(e) = handler.handle_event(event).await {
                errors.push(e);
            }
        }
        errors.into_result()
    }
}

/// Forwards only events that pass every filter
pub struct FilteredEventHandler {
    inner: Arc<dyn EventHandler>,
    filters: Vec<EventFilter>,
}

impl FilteredEventHandler {
    pub fn new(inner: Arc<dyn EventHandler>, filters: Vec<EventFilter>) -> Self {
        Self { inner, filters }
    }
}

#[async_trait]
impl EventHandler for FilteredEventHandler {
    async fn handle_event(&self, event: &Event) -> Result<()> {
        if matches_all(&self.filters, event) {
            self.inner.handle_event(event).await
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::events::{by_type, EventType};
    use crate::metrics::AtomicMetrics;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_handler() -> (Arc<dyn EventHandler>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let handler = handler_fn(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (handler, count)
    }

    fn event(t: EventType) -> Event {
        Event::new(t, "agent-1", "tester", Value::Null)
    }

    #[tokio::test]
    async fn test_composite_aggregates_errors() {
        let (ok, count) = counting_handler();
        let failing = handler_fn(|_| Err(AgentRuntimeError::other("nope")));
        let composite = CompositeEventHandler::new(vec![failing.clone(), ok, failing]);

        let err = composite
            .handle_event(&event(EventType::Message))
            .await
            .unwrap_err();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(err.code(), ErrorCode::MultipleErrors);
        assert_eq!(err.to_string(), "multiple errors occurred (2 errors)");
    }

    #[tokio::test]
    async fn test_filtered_skips_non_matching() {
        let (inner, count) = counting_handler();
        let filtered = FilteredEventHandler::new(inner, vec![by_type([EventType::ToolCall])]);

        filtered.handle_event(&event(EventType::Message)).await.unwrap();
        filtered.handle_event(&event(EventType::ToolCall)).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_buffered_drops_on_overflow_and_rejects_after_close() {
        let (inner, count) = counting_handler();
        let metrics = Arc::new(AtomicMetrics::new());
        let buffered = BufferedEventHandler::with_metrics(inner, 2, metrics.clone());

        // the worker cannot run until we yield, so the third event overflows
        buffered.handle_event(&event(EventType::Progress)).await.unwrap();
        buffered.handle_event(&event(EventType::Progress)).await.unwrap();
        let err = buffered
            .handle_event(&event(EventType::Progress))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentRuntimeError::EventDispatch(ref m) if m == "buffer full"));
        assert_eq!(metrics.get(counters::BUFFERED_HANDLER_DROPPED), 1);

        buffered.close().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        let err = buffered
            .handle_event(&event(EventType::Progress))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentRuntimeError::EventDispatch(ref m) if m == "handler closed"));
    }
}
