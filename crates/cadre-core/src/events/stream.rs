//! Pull-based event stream over a bounded channel

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::Event;
use crate::error::{AgentRuntimeError, Result};

pub struct EventStream {
    tx: Option<mpsc::Sender<Event>>,
    rx: mpsc::Receiver<Event>,
}

impl EventStream {
    pub fn new(buffer_size: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer_size.max(1));
        Self { tx: Some(tx), rx }
    }

    /// Wrap a receiver produced elsewhere, such as `run_async`
    pub fn from_receiver(rx: mpsc::Receiver<Event>) -> Self {
        Self { tx: None, rx }
    }

    /// A producer handle for this stream, if it still accepts events
    pub fn sender(&self) -> Option<mpsc::Sender<Event>> {
        self.tx.clone()
    }

    /// Wait for room in the buffer and enqueue
    pub async fn send(&self, event: Event) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| AgentRuntimeError::EventDispatch("stream closed".into()))?;
        tx.send(event)
            .await
            .map_err(|_| AgentRuntimeError::EventDispatch("stream closed".into()))
    }

    /// Next event, or `None` once every producer is gone and the buffer is empty
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Stop accepting events. Already buffered events can still be received.
    pub fn close(&mut self) {
        self.tx = None;
        self.rx.close();
    }

    pub fn into_stream(self) -> ReceiverStream<Event> {
        ReceiverStream::new(self.rx)
    }
}
