//! Asynchronous publish/subscribe broker
//!
//! `dispatch` never blocks: events go into a bounded queue and are dropped
//! when it is full or the dispatcher is closed. A single drain task pulls
//! events in FIFO order and spawns one task per matching subscriber, so a slow
//! or panicking handler cannot hold up the others. Drops and recovered panics
//! are counted on the `MetricsSink`.

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use super::{matches_all, Event, EventFilter, EventHandler};
use crate::metrics::{self, counters, MetricsSink};

/// Default capacity of the dispatch queue
pub const DEFAULT_BUFFER_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub buffer_size: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

pub type SubscriptionId = String;

struct Subscription {
    handler: Arc<dyn EventHandler>,
    filters: Vec<EventFilter>,
}

type Subscribers = Arc<RwLock<HashMap<SubscriptionId, Arc<Subscription>>>>;

pub struct EventDispatcher {
    tx: RwLock<Option<mpsc::Sender<Event>>>,
    subscribers: Subscribers,
    cancel: CancellationToken,
    drain: Mutex<Option<JoinHandle<()>>>,
    tracker: TaskTracker,
    metrics: Arc<dyn MetricsSink>,
}

impl EventDispatcher {
    /// Start a dispatcher. Must be called inside a tokio runtime.
    pub fn new(config: DispatcherConfig) -> Self {
        Self::with_metrics(config, metrics::noop())
    }

    pub fn with_metrics(config: DispatcherConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        let (tx, rx) = mpsc::channel(config.buffer_size.max(1));
        let subscribers: Subscribers = Arc::new(RwLock::new(HashMap::new()));
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let drain = tokio::spawn(drain_loop(
            rx,
            subscribers.clone(),
            tracker.clone(),
            metrics.clone(),
            cancel.clone(),
        ));

        Self {
            tx: RwLock::new(Some(tx)),
            subscribers,
            cancel,
            drain: Mutex::new(Some(drain)),
            tracker,
            metrics,
        }
    }

    /// Register a handler. It sees an event only if every filter accepts it.
    pub fn subscribe(
        &self,
        handler: Arc<dyn EventHandler>,
        filters: Vec<EventFilter>,
    ) -> SubscriptionId {
        let id = Uuid::new_v4().to_string();
        self.subscribers
            .write()
            .insert(id.clone(), Arc::new(Subscription { handler, filters }));
        id
    }

    /// Returns false if the id was not subscribed
    pub fn unsubscribe(&self, id: &str) -> bool {
        self.subscribers.write().remove(id).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Enqueue an event without blocking. Returns false if it was dropped.
    pub fn dispatch(&self, event: Event) -> bool {
        let guard = self.tx.read();
        let Some(tx) = guard.as_ref() else {
            tracing::debug!(event = %event.event_type, "Dispatcher closed, dropping event");
            self.metrics.incr_counter(counters::EVENTS_DROPPED, 1);
            return false;
        };

        match tx.try_send(event) {
            Ok(()) => {
                self.metrics.incr_counter(counters::EVENTS_DISPATCHED, 1);
                true
            }
            Err(e) => {
                tracing::debug!(event = %e.into_inner().event_type, "Dispatch queue full, dropping event");
                self.metrics.incr_counter(counters::EVENTS_DROPPED, 1);
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.read().is_none()
    }

    /// Stop accepting events, deliver what is already queued and wait for
    /// every handler task started so far.
    pub async fn close(&self) {
        drop(self.tx.write().take());
        self.cancel.cancel();

        let drain = self.drain.lock().take();
        if let Some(drain) = drain {
            let _ = drain.await;
        }

        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn drain_loop(
    mut rx: mpsc::Receiver<Event>,
    subscribers: Subscribers,
    tracker: TaskTracker,
    metrics: Arc<dyn MetricsSink>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            event = rx.recv() => match event {
                Some(event) => deliver(event, &subscribers, &tracker, &metrics),
                None => break,
            },
            _ = cancel.cancelled() => {
                rx.close();
                while let Some(event) = rx.recv().await {
                    deliver(event, &subscribers, &tracker, &metrics);
                }
                break;
            }
        }
    }
}

fn deliver(
    event: Event,
    subscribers: &Subscribers,
    tracker: &TaskTracker,
    metrics: &Arc<dyn MetricsSink>,
) {
    let matching: Vec<Arc<Subscription>> = subscribers
        .read()
        .values()
        .filter(|sub| matches_all(&sub.filters, &event))
        .cloned()
        .collect();

    let event = Arc::new(event);
    for sub in matching {
        let event = event.clone();
        let metrics = metrics.clone();
        tracker.spawn(async move {
            let outcome = AssertUnwindSafe(sub.handler.handle_event(&event))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!(event = %event.event_type, error = %e, "Event handler failed");
                }
                Err(_) => {
                    tracing::warn!(event = %event.event_type, "Event handler panicked");
                    metrics.incr_counter(counters::HANDLER_PANICS, 1);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::handlers::handler_fn;
    use crate::events::{by_agent, EventType};
    use crate::metrics::AtomicMetrics;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn event(agent: &str) -> Event {
        Event::new(EventType::Message, agent, "tester", Value::Null)
    }

    fn counter() -> (Arc<dyn EventHandler>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (
            handler_fn(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
            count,
        )
    }

    struct SlowHandler {
        done: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EventHandler for SlowHandler {
        async fn handle_event(&self, _event: &Event) -> crate::error::Result<()> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            self.done.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct ReportingHandler {
        tx: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl EventHandler for ReportingHandler {
        async fn handle_event(&self, event: &Event) -> crate::error::Result<()> {
            let _ = self.tx.send(event.id.clone());
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_handler_does_not_block_fast_subscribers() {
        let dispatcher = EventDispatcher::new(DispatcherConfig::default());
        let slow_done = Arc::new(AtomicUsize::new(0));
        dispatcher.subscribe(
            Arc::new(SlowHandler {
                done: slow_done.clone(),
            }),
            vec![],
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        for _ in 0..3 {
            dispatcher.subscribe(Arc::new(ReportingHandler { tx: tx.clone() }), vec![]);
        }

        for _ in 0..5 {
            assert!(dispatcher.dispatch(event("a")));
        }

        let received = tokio::time::timeout(Duration::from_secs(1), async {
            let mut n = 0;
            while n < 15 {
                rx.recv().await;
                n += 1;
            }
            n
        })
        .await
        .expect("fast subscribers were blocked");

        assert_eq!(received, 15);
        assert_eq!(slow_done.load(Ordering::SeqCst), 0);

        // close waits for the slow handlers too
        dispatcher.close().await;
        assert_eq!(slow_done.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_filters_select_subscribers() {
        let dispatcher = EventDispatcher::new(DispatcherConfig::default());
        let (all, all_count) = counter();
        let (only_b, b_count) = counter();
        dispatcher.subscribe(all, vec![]);
        dispatcher.subscribe(only_b, vec![by_agent("b")]);

        dispatcher.dispatch(event("a"));
        dispatcher.dispatch(event("b"));
        dispatcher.close().await;

        assert_eq!(all_count.load(Ordering::SeqCst), 2);
        assert_eq!(b_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_full_queue_drops_events() {
        let metrics = Arc::new(AtomicMetrics::new());
        let dispatcher =
            EventDispatcher::with_metrics(DispatcherConfig { buffer_size: 2 }, metrics.clone());
        let (handler, count) = counter();
        dispatcher.subscribe(handler, vec![]);

        // drain task cannot run until we yield, so only two fit
        let accepted = (0..5).filter(|_| dispatcher.dispatch(event("a"))).count();
        assert_eq!(accepted, 2);
        assert_eq!(metrics.get(counters::EVENTS_DROPPED), 3);
        assert_eq!(metrics.get(counters::EVENTS_DISPATCHED), 2);

        dispatcher.close().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dispatch_after_close_is_dropped() {
        let metrics = Arc::new(AtomicMetrics::new());
        let dispatcher =
            EventDispatcher::with_metrics(DispatcherConfig::default(), metrics.clone());
        dispatcher.close().await;

        assert!(dispatcher.is_closed());
        assert!(!dispatcher.dispatch(event("a")));
        assert_eq!(metrics.get(counters::EVENTS_DROPPED), 1);
    }

    #[tokio::test]
    async fn test_handler_panic_is_contained() {
        let metrics = Arc::new(AtomicMetrics::new());
        let dispatcher =
            EventDispatcher::with_metrics(DispatcherConfig::default(), metrics.clone());
        dispatcher.subscribe(handler_fn(|_| panic!("handler bug")), vec![]);
        let (healthy, count) = counter();
        dispatcher.subscribe(healthy, vec![]);

        dispatcher.dispatch(event("a"));
        dispatcher.dispatch(event("a"));
        dispatcher.close().await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(metrics.get(counters::HANDLER_PANICS), 2);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let dispatcher = EventDispatcher::new(DispatcherConfig::default());
        let (handler, count) = counter();
        let id = dispatcher.subscribe(handler, vec![]);
        assert_eq!(dispatcher.subscriber_count(), 1);
        assert!(dispatcher.unsubscribe(&id));
        assert!(!dispatcher.unsubscribe(&id));

        dispatcher.dispatch(event("a"));
        dispatcher.close().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
