//! Cadre Core - agent execution runtime
//!
//! Drives language-model-backed agents through a bounded generate/tool-call
//! loop while publishing lifecycle events to observers.
//!
//! ## Modules
//! - `state` - working memory passed between agents, plus the transform and merge library
//! - `events` - event envelope, asynchronous dispatcher and handler combinators
//! - `agent` - agent hierarchy, registry, retry/timeout helpers and the LLM loop
//! - `tools` - tool capability, execution context and prompt documentation
//! - `provider` - language-model provider capability and a scripted test double

pub mod agent;
pub mod error;
pub mod events;
pub mod metrics;
pub mod provider;
pub mod state;
pub mod tools;

pub use agent::{
    Agent, AgentConfig, AgentId, AgentInfo, AgentRegistry, AgentTree, AgentType, BaseAgent,
    LlmAgent, LlmAgentConfig,
};
pub use error::{AgentError, AgentRuntimeError, ErrorCode, Result, ToolError, ValidationError};
pub use events::{Event, EventDispatcher, EventHandler, EventType};
pub use provider::{Provider, ProviderOptions, Response, ScriptedProvider};
pub use state::{Message, Role, State};
pub use tools::{Tool, ToolContext, ToolOutput};
