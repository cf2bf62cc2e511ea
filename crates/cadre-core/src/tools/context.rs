//! Per-call execution context handed to tools

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::AgentInfo;
use crate::events::{payload, Event, EventDispatcher, EventType, ProgressData};
use crate::state::StateReader;

/// Everything a tool may look at while it runs
#[derive(Clone)]
pub struct ToolContext {
    /// Read-only view of the state at call time
    pub state: Arc<dyn StateReader>,
    pub agent: AgentInfo,
    pub run_id: String,
    /// Retry attempt of the surrounding run, 0 on the first try
    pub retry: u32,
    pub start_time: DateTime<Utc>,
    pub events: ToolEventEmitter,
    pub cancel: CancellationToken,
}

impl ToolContext {
    pub fn new(
        state: Arc<dyn StateReader>,
        agent: AgentInfo,
        tool_name: impl Into<String>,
    ) -> Self {
        let events = ToolEventEmitter::new(tool_name, &agent, None);
        Self {
            state,
            agent,
            run_id: Uuid::new_v4().to_string(),
            retry: 0,
            start_time: Utc::now(),
            events,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn with_retry(mut self, retry: u32) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_events(mut self, events: ToolEventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn elapsed(&self) -> chrono::Duration {
        Utc::now() - self.start_time
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Publishes events on behalf of one tool. Without a dispatcher it is a no-op.
#[derive(Clone)]
pub struct ToolEventEmitter {
    tool_name: String,
    agent_id: String,
    agent_name: String,
    dispatcher: Option<Arc<EventDispatcher>>,
}

impl ToolEventEmitter {
    pub fn new(
        tool_name: impl Into<String>,
        agent: &AgentInfo,
        dispatcher: Option<Arc<EventDispatcher>>,
    ) -> Self {
        Self {
            tool_name: tool_name.into(),
            agent_id: agent.id.clone(),
            agent_name: agent.name.clone(),
            dispatcher,
        }
    }

    pub fn tool_name(&self) -> &str {
        &self.tool_name
    }

    fn event(&self, event_type: EventType, data: Value) -> Event {
        Event::new(event_type, &self.agent_id, &self.agent_name, data)
            .with_metadata("tool_name", self.tool_name.as_str())
            .with_metadata("source", "tool")
    }

    fn send(&self, event: Event) {
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.dispatch(event);
        }
    }

    pub fn emit(&self, event_type: EventType, data: Value) {
        self.send(self.event(event_type, data));
    }

    pub fn emit_progress(&self, current: usize, total: usize, message: impl Into<String>) {
        self.emit(
            EventType::Progress,
            payload(&ProgressData {
                current,
                total,
                message: message.into(),
            }),
        );
    }

    pub fn emit_message(&self, message: impl Into<String>) {
        self.emit(EventType::Message, json!({ "message": message.into() }));
    }

    pub fn emit_error(&self, error: impl fmt::Display) {
        self.send(
            self.event(EventType::ToolError, json!({ "tool_name": self.tool_name }))
                .with_error(error),
        );
    }

    /// Emit `tool.{tool_name}.{name}`
    pub fn emit_custom(&self, name: &str, data: Value) {
        let event_type = EventType::Custom(format!("tool.{}.{}", self.tool_name, name));
        self.emit(event_type, data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentType;
    use crate::events::dispatcher::DispatcherConfig;
    use crate::events::handlers::handler_fn;
    use crate::state::State;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    fn agent() -> AgentInfo {
        AgentInfo {
            id: "a1".into(),
            name: "tester".into(),
            description: String::new(),
            agent_type: AgentType::Llm,
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_emitter_tags_events() {
        let dispatcher = Arc::new(EventDispatcher::new(DispatcherConfig::default()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        dispatcher.subscribe(
            handler_fn(move |e| {
                sink.lock().push(e.clone());
                Ok(())
            }),
            vec![],
        );

        let emitter = ToolEventEmitter::new("fetch", &agent(), Some(dispatcher.clone()));
        emitter.emit_progress(1, 3, "page 1");
        emitter.emit_custom("page", json!({"n": 1}));
        emitter.emit_error("timeout");
        dispatcher.close().await;

        let mut events = seen.lock().clone();
        events.sort_by_key(|e| e.event_type.to_string());
        let types: Vec<String> = events.iter().map(|e| e.event_type.to_string()).collect();
        assert_eq!(types, vec!["progress", "tool.error", "tool.fetch.page"]);
        assert!(events.iter().all(|e| e.metadata["tool_name"] == "fetch"));
        assert!(events.iter().all(|e| e.metadata["source"] == "tool"));
        assert_eq!(events[1].error.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_context_defaults() {
        let ctx = ToolContext::new(Arc::new(State::new()), agent(), "noop").with_retry(2);
        assert_eq!(ctx.retry, 2);
        assert_eq!(ctx.events.tool_name(), "noop");
        assert!(!ctx.is_cancelled());
        // emitting without a dispatcher is harmless
        ctx.events.emit_message("hello");
    }
}
