//! Agent system for Cadre
//!
//! ## Core Components
//! - `Agent` - Capability every runnable node implements
//! - `BaseAgent` - Identity, hierarchy, config, events, retry and timeout
//! - `AgentTree` - Parent links kept outside the agents themselves
//! - `AgentRegistry` - Lookup by id, name, type, metadata and parent
//!
//! ## LLM Agent
//! - `LlmAgent` - Bounded generate/tool-call loop
//! - `ToolCallExtractor` - Ordered tool-call parsers over model output
//! - `ToolExecutor` - Sequential tool round with recoverable failures
//!
//! ## Hooks and Guardrails
//! - `LoggingHook` - Logs generations and tool calls
//! - `MetricsHook` - Counts requests, tool calls and timings
//! - `GuardrailChain` - Combines input and output checks
//!
//! ## Delegation
//! - `Handoff` - Route a state to another registered agent
//! - `TransferTool` / `SubAgentTool` / `HandoffTool` - Delegation exposed as tools

pub mod base;
pub mod delegation;
pub mod executor;
pub mod extraction;
pub mod guardrails;
pub mod handoff;
pub mod hooks;
pub mod llm;
pub mod registry;
pub mod tree;
pub mod types;

pub use base::{run_async, Agent, BaseAgent, FnAgent, SubAgents};
pub use delegation::{
    agent_output, HandoffTool, SubAgentTool, TransferTool, HANDOFF_TOOL_PREFIX, TRANSFER_TOOL_NAME,
};
pub use executor::ToolExecutor;
pub use extraction::{ToolCall, ToolCallExtractor, ToolCallParser};
pub use guardrails::{
    ContentModeration, Guardrail, GuardrailChain, GuardrailFn, GuardrailType, MaxStateSize,
    MessageCount, RequiredKeys,
};
pub use handoff::Handoff;
pub use hooks::{Hook, LogLevel, LoggingHook, MetricsHook};
pub use llm::{LlmAgent, LlmAgentConfig};
pub use registry::{AgentQuery, AgentRegistry};
pub use tree::AgentTree;
pub use types::{AgentConfig, AgentId, AgentInfo, AgentType};
