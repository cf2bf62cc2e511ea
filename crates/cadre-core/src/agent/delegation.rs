//! Tools that delegate work to other agents
//!
//! ## Built-in Tools
//! - `TransferTool` - `transfer_to_agent`, runs a named sub-agent
//! - `SubAgentTool` - exposes one sub-agent as a tool under its own name
//! - `HandoffTool` - `handoff_to_{target}`, runs a `Handoff` through a registry

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{Agent, AgentRegistry, Handoff, SubAgents};
use crate::error::{Result, ToolError};
use crate::state::{SharedStateContext, State};
use crate::tools::{Tool, ToolContext, ToolExample, ToolMetadata, ToolOutput};

pub const TRANSFER_TOOL_NAME: &str = "transfer_to_agent";
pub const HANDOFF_TOOL_PREFIX: &str = "handoff_to_";

/// The value a finished agent hands back: `output`, else `result`, else all values
pub fn agent_output(state: &State) -> Value {
    state
        .get("output")
        .or_else(|| state.get("result"))
        .cloned()
        .unwrap_or_else(|| Value::Object(state.values().clone().into_iter().collect()))
}

/// Copy of the caller's state for a delegated run. Values are copied down at
/// call time; nothing flows back.
fn shared_copy(ctx: &ToolContext) -> State {
    SharedStateContext::new(ctx.state.clone()).as_state()
}

fn agent_names(agents: &[Arc<dyn Agent>]) -> Vec<String> {
    agents.iter().map(|a| a.name().to_string()).collect()
}

// ============================================================================
// transfer_to_agent
// ============================================================================

/// Delegates to a sub-agent chosen by the model.
///
/// Holds the parent's sub-agent handle rather than the parent itself.
pub struct TransferTool {
    sub_agents: SubAgents,
}

impl TransferTool {
    pub fn new(sub_agents: SubAgents) -> Self {
        Self { sub_agents }
    }

    fn find(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.sub_agents.read().iter().find(|a| a.name() == name).cloned()
    }
}

#[async_trait]
impl Tool for TransferTool {
    fn name(&self) -> &str {
        TRANSFER_TOOL_NAME
    }

    fn description(&self) -> &str {
        "Transfer control to a sub-agent by name. The sub-agent will handle the task and return the result."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "description": "Parameters for transferring control to a sub-agent",
            "properties": {
                "agent_name": {
                    "type": "string",
                    "description": "Name of the sub-agent to transfer control to"
                },
                "reason": {
                    "type": "string",
                    "description": "Reason for transferring to this agent (optional)"
                },
                "input": {
                    "type": "string",
                    "description": "Optional input to pass to the sub-agent"
                }
            },
            "required": ["agent_name"]
        })
    }

    fn metadata(&self) -> ToolMetadata {
        let examples = self
            .sub_agents
            .read()
            .first()
            .map(|first| ToolExample {
                name: "Transfer to sub-agent".into(),
                description: format!("Transfer control to the {} agent", first.name()),
                scenario: format!("When you need to {}", first.description()),
                input: json!({"agent_name": first.name(), "input": "Process this task"}),
                output: json!("Result from sub-agent"),
                explanation: "The sub-agent will process the input and return its result".into(),
            })
            .into_iter()
            .collect();

        ToolMetadata {
            usage_instructions: "Use this tool to transfer control to one of the available sub-agents. Each sub-agent specializes in different tasks.".into(),
            examples,
            constraints: vec![
                "Can only transfer to registered sub-agents".into(),
                "Sub-agent must exist in the agent hierarchy".into(),
            ],
            error_guidance: BTreeMap::from([
                (
                    "agent_not_found".to_string(),
                    "The specified agent name does not exist. Check available sub-agents.".to_string(),
                ),
                (
                    "invalid_params".to_string(),
                    "Parameters must include 'agent_name' as a string.".to_string(),
                ),
            ]),
            category: "agent".into(),
            tags: vec!["agent".into(), "delegation".into(), "transfer".into()],
            version: "1.0.0".into(),
            estimated_latency: "medium".into(),
            ..Default::default()
        }
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let Some(fields) = params.as_object() else {
            return Err(ToolError::execution(
                TRANSFER_TOOL_NAME,
                "transfer_to_agent requires a map with 'agent_name' and optional 'reason'",
            )
            .into());
        };
        let agent_name = fields
            .get("agent_name")
            .and_then(Value::as_str)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| {
                ToolError::execution(
                    TRANSFER_TOOL_NAME,
                    "transfer_to_agent requires 'agent_name' parameter",
                )
            })?;

        let Some(agent) = self.find(agent_name) else {
            let available = agent_names(&self.sub_agents.read());
            return Err(ToolError::execution(
                TRANSFER_TOOL_NAME,
                format!(
                    "sub-agent '{}' not found. Available agents: [{}]",
                    agent_name,
                    available.join(", ")
                ),
            )
            .into());
        };

        let mut state = shared_copy(ctx);
        if let Some(input) = fields.get("input") {
            state.set("input", input.clone());
        }
        if let Some(reason) = fields.get("reason").and_then(Value::as_str) {
            tracing::info!(agent = agent_name, reason, "Transferring to sub-agent");
        }

        let input = Handoff::simple("transfer", agent_name).transform_input(&state);
        let result = agent
            .run_with_cancel(input, ctx.cancel.child_token())
            .await
            .map_err(|e| {
                ToolError::execution(
                    TRANSFER_TOOL_NAME,
                    format!("transfer to agent '{}' failed", agent_name),
                )
                .with_source(e)
            })?;

        Ok(ToolOutput::from(agent_output(&result)))
    }
}

// ============================================================================
// Sub-agent as tool
// ============================================================================

/// A sub-agent callable directly by its name
pub struct SubAgentTool {
    agent: Arc<dyn Agent>,
}

impl SubAgentTool {
    pub fn new(agent: Arc<dyn Agent>) -> Self {
        Self { agent }
    }
}

#[async_trait]
impl Tool for SubAgentTool {
    fn name(&self) -> &str {
        self.agent.name()
    }

    fn description(&self) -> &str {
        self.agent.description()
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "description": format!("Parameters for {} agent", self.agent.name()),
            "properties": {
                "input": {"type": "string", "description": "Input for the agent"}
            }
        })
    }

    fn metadata(&self) -> ToolMetadata {
        ToolMetadata {
            usage_instructions: format!(
                "Use this to delegate tasks to the {} agent. {}",
                self.agent.name(),
                self.agent.description()
            ),
            category: "agent".into(),
            tags: vec!["agent".into(), "delegation".into()],
            version: "1.0.0".into(),
            estimated_latency: "medium".into(),
            ..Default::default()
        }
    }

    /// Object params become state values; any other value becomes `input`
    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let mut state = State::new();
        match params {
            Value::Object(fields) => {
                for (key, value) in fields {
                    state.set(key, value);
                }
            }
            other => state.set("input", other),
        }

        let result = self
            .agent
            .run_with_cancel(state, ctx.cancel.child_token())
            .await?;
        Ok(ToolOutput::from(agent_output(&result)))
    }
}

// ============================================================================
// Handoff as tool
// ============================================================================

pub struct HandoffTool {
    name: String,
    description: String,
    handoff: Handoff,
    registry: Arc<AgentRegistry>,
}

impl HandoffTool {
    pub fn new(handoff: Handoff, registry: Arc<AgentRegistry>) -> Self {
        let description = if handoff.description().is_empty() {
            format!("Hand the conversation off to the {} agent", handoff.target())
        } else {
            handoff.description().to_string()
        };
        Self {
            name: format!("{}{}", HANDOFF_TOOL_PREFIX, handoff.target()),
            description,
            handoff,
            registry,
        }
    }
}

#[async_trait]
impl Tool for HandoffTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "input": {"type": "string", "description": "Input for the target agent"}
            }
        })
    }

    fn metadata(&self) -> ToolMetadata {
        ToolMetadata {
            category: "agent".into(),
            tags: vec!["agent".into(), "handoff".into()],
            estimated_latency: "medium".into(),
            ..Default::default()
        }
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let mut state = shared_copy(ctx);
        match params {
            Value::Object(fields) => {
                for (key, value) in fields {
                    state.set(key, value);
                }
            }
            Value::Null => {}
            other => state.set("input", other),
        }

        let result = self.handoff.execute(&self.registry, &state).await?;
        Ok(ToolOutput::from(agent_output(&result)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentInfo, AgentType, BaseAgent, FnAgent};
    use parking_lot::RwLock;
    use std::collections::HashMap;

    fn ctx(state: State) -> ToolContext {
        ToolContext::new(
            Arc::new(state),
            AgentInfo {
                id: "p".into(),
                name: "parent".into(),
                description: String::new(),
                agent_type: AgentType::Llm,
                metadata: HashMap::new(),
            },
            TRANSFER_TOOL_NAME,
        )
    }

    fn echo_agent(name: &str) -> Arc<dyn Agent> {
        Arc::new(FnAgent::new(
            BaseAgent::new(name, "echo things back", AgentType::Custom),
            |mut state: State| async move {
                let input = state.get("input").cloned().unwrap_or(Value::Null);
                let topic = state.get("topic").cloned().unwrap_or(Value::Null);
                state.set("output", json!({"input": input, "topic": topic}));
                Ok(state)
            },
        ))
    }

    fn handle(agents: Vec<Arc<dyn Agent>>) -> SubAgents {
        Arc::new(RwLock::new(agents))
    }

    #[tokio::test]
    async fn test_transfer_copies_state_down() {
        let tool = TransferTool::new(handle(vec![echo_agent("helper")]));
        let out = tool
            .execute(
                json!({"agent_name": "helper", "input": "go", "reason": "specialist"}),
                &ctx(State::from_values([("topic", json!("rust"))])),
            )
            .await
            .unwrap();
        assert_eq!(out, ToolOutput::Structured(json!({"input": "go", "topic": "rust"})));
    }

    #[tokio::test]
    async fn test_transfer_errors() {
        let tool = TransferTool::new(handle(vec![echo_agent("helper")]));
        let c = ctx(State::new());

        let err = tool.execute(json!("helper"), &c).await.unwrap_err();
        assert!(err.to_string().contains("requires a map"));

        let err = tool.execute(json!({"agent_name": ""}), &c).await.unwrap_err();
        assert!(err.to_string().contains("requires 'agent_name'"));

        let err = tool.execute(json!({"agent_name": "ghost"}), &c).await.unwrap_err();
        assert!(err
            .to_string()
            .contains("sub-agent 'ghost' not found. Available agents: [helper]"));
    }

    #[tokio::test]
    async fn test_sub_agent_tool_params() {
        let tool = SubAgentTool::new(echo_agent("helper"));
        assert_eq!(tool.name(), "helper");

        let out = tool.execute(json!("hello"), &ctx(State::new())).await.unwrap();
        assert_eq!(out.to_value(), json!({"input": "hello", "topic": null}));

        let out = tool
            .execute(json!({"topic": "go"}), &ctx(State::new()))
            .await
            .unwrap();
        assert_eq!(out.to_value(), json!({"input": null, "topic": "go"}));
    }

    #[tokio::test]
    async fn test_handoff_tool_runs_through_registry() {
        let registry = Arc::new(AgentRegistry::new());
        registry.register(echo_agent("writer")).unwrap();

        let tool = HandoffTool::new(Handoff::simple("h", "writer"), registry);
        assert_eq!(tool.name(), "handoff_to_writer");

        let out = tool
            .execute(json!({"input": "draft"}), &ctx(State::from_values([("topic", json!("x"))])))
            .await
            .unwrap();
        assert_eq!(out.to_value(), json!({"input": "draft", "topic": "x"}));
    }

    #[test]
    fn test_agent_output_precedence() {
        let mut state = State::from_values([("a", json!(1))]);
        assert_eq!(agent_output(&state), json!({"a": 1}));
        state.set("result", "r");
        assert_eq!(agent_output(&state), json!("r"));
        state.set("output", "o");
        assert_eq!(agent_output(&state), json!("o"));
    }
}
