//! Event envelope and publish/subscribe plumbing
//!
//! Agents and tools emit `Event`s; the `EventDispatcher` fans them out to
//! subscribed `EventHandler`s without ever blocking the producer. Delivery is
//! best-effort: a full queue drops the event and bumps `events.dropped`.

pub mod dispatcher;
pub mod handlers;
pub mod stream;

pub use dispatcher::{DispatcherConfig, EventDispatcher, SubscriptionId};
pub use handlers::{
    BufferedEventHandler, CompositeEventHandler, EventHandler, EventHandlerFn,
    FilteredEventHandler,
};
pub use stream::EventStream;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Kind of event. Serialized as its dotted name (`agent.start`, `tool.result`, ...)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    AgentStart,
    AgentComplete,
    AgentError,
    StateUpdate,
    Progress,
    Message,
    ToolCall,
    ToolResult,
    ToolError,
    SubAgentStart,
    SubAgentEnd,
    WorkflowStep,
    WorkflowStart,
    Custom(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::AgentStart => "agent.start",
            Self::AgentComplete => "agent.complete",
            Self::AgentError => "agent.error",
            Self::StateUpdate => "state.update",
            Self::Progress => "progress",
            Self::Message => "message",
            Self::ToolCall => "tool.call",
            Self::ToolResult => "tool.result",
            Self::ToolError => "tool.error",
            Self::SubAgentStart => "subagent.start",
            Self::SubAgentEnd => "subagent.end",
            Self::WorkflowStep => "workflow.step",
            Self::WorkflowStart => "workflow.start",
            Self::Custom(name) => name,
        }
    }
}

impl From<String> for EventType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "agent.start" => Self::AgentStart,
            "agent.complete" => Self::AgentComplete,
            "agent.error" => Self::AgentError,
            "state.update" => Self::StateUpdate,
            "progress" => Self::Progress,
            "message" => Self::Message,
            "tool.call" => Self::ToolCall,
            "tool.result" => Self::ToolResult,
            "tool.error" => Self::ToolError,
            "subagent.start" => Self::SubAgentStart,
            "subagent.end" => Self::SubAgentEnd,
            "workflow.step" => Self::WorkflowStep,
            "workflow.start" => Self::WorkflowStart,
            _ => Self::Custom(s),
        }
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        Self::from(s.to_string())
    }
}

impl From<EventType> for String {
    fn from(t: EventType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something that happened during an agent run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub agent_id: String,
    pub agent_name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Event {
    pub fn new(
        event_type: EventType,
        agent_id: impl Into<String>,
        agent_name: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type,
            agent_id: agent_id.into(),
            agent_name: agent_name.into(),
            timestamp: Utc::now(),
            data,
            metadata: HashMap::new(),
            error: None,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_error(mut self, error: impl fmt::Display) -> Self {
        self.error = Some(error.to_string());
        self
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
            || matches!(self.event_type, EventType::AgentError | EventType::ToolError)
    }
}

// ============================================================================
// Filters
// ============================================================================

/// Predicate deciding whether a handler sees an event
pub type EventFilter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Events of any of the given types
pub fn by_type(types: impl IntoIterator<Item = EventType>) -> EventFilter {
    let types: Vec<EventType> = types.into_iter().collect();
    Arc::new(move |e: &Event| types.contains(&e.event_type))
}

pub fn by_agent(agent_id: impl Into<String>) -> EventFilter {
    let agent_id = agent_id.into();
    Arc::new(move |e: &Event| e.agent_id == agent_id)
}

pub fn by_agent_name(agent_name: impl Into<String>) -> EventFilter {
    let agent_name = agent_name.into();
    Arc::new(move |e: &Event| e.agent_name == agent_name)
}

pub fn errors_only() -> EventFilter {
    Arc::new(|e: &Event| e.is_error())
}

/// All filters must pass
pub fn combine(filters: Vec<EventFilter>) -> EventFilter {
    Arc::new(move |e: &Event| filters.iter().all(|f| f(e)))
}

pub(crate) fn matches_all(filters: &[EventFilter], event: &Event) -> bool {
    filters.iter().all(|f| f(event))
}

// ============================================================================
// Payloads
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressData {
    pub current: usize,
    pub total: usize,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallData {
    pub tool_name: String,
    pub parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultData {
    pub tool_name: String,
    pub result: Value,
    pub duration_ms: u64,
}

/// Serialize a payload struct into event data. Payload types are plain
/// structs, so this only falls back to `Null` on a broken `Serialize` impl.
pub fn payload<T: Serialize>(data: &T) -> Value {
    serde_json::to_value(data).unwrap_or(Value::Null)
}
