//! Language-model agent with a bounded generate/tool-call loop
//!
//! ## Run pipeline
//! 1. Input guardrail, then input transforms
//! 2. The loop, wrapped in `execute_with_retry`: generate, detect tool calls,
//!    run them, feed the results back, until the model answers without a
//!    tool call or `max_iterations` rounds have passed
//! 3. Output transforms, then output guardrail
//!
//! Sub-agents are exposed to the model as tools under their own names plus
//! the shared `transfer_to_agent` tool. Handoffs become `handoff_to_{target}`.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::delegation::{
    HandoffTool, SubAgentTool, TransferTool, HANDOFF_TOOL_PREFIX, TRANSFER_TOOL_NAME,
};
use super::executor::ToolExecutor;
use super::extraction::ToolCallExtractor;
use super::guardrails::Guardrail;
use super::handoff::Handoff;
use super::hooks::Hook;
use super::{Agent, AgentConfig, AgentRegistry, AgentType, BaseAgent};
use crate::error::{AgentRuntimeError, ErrorCode, Phase, Result, ValidationError};
use crate::events::{payload, EventDispatcher, EventType, ProgressData};
use crate::provider::{Provider, ProviderOptions, Response};
use crate::state::{Message, State, StateTransform};
use crate::tools::{docs, Tool, ToolRegistry};

/// Result text when the loop runs out of rounds
pub const MAX_ITERATIONS_RESULT: &str = "Agent reached maximum iterations without final result";

/// State keys searched, in order, for the user prompt
pub const PROMPT_KEYS: [&str; 6] = ["user_input", "prompt", "input", "message", "query", "text"];

fn default_max_iterations() -> usize {
    10
}

/// Model-facing settings of an `LlmAgent`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmAgentConfig {
    pub system_prompt: String,
    /// Overrides `provider_options.model` when set
    pub model: Option<String>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    pub provider_options: ProviderOptions,
}

impl Default for LlmAgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: String::new(),
            model: None,
            max_iterations: default_max_iterations(),
            provider_options: ProviderOptions::default(),
        }
    }
}

impl LlmAgentConfig {
    fn options(&self) -> ProviderOptions {
        let mut options = self.provider_options.clone();
        if let Some(model) = &self.model {
            options.model = Some(model.clone());
        }
        options
    }
}

pub struct LlmAgent {
    base: BaseAgent,
    provider: Arc<dyn Provider>,
    config: RwLock<LlmAgentConfig>,
    tools: ToolRegistry,
    hooks: RwLock<Vec<Arc<dyn Hook>>>,
    input_guardrail: Option<Arc<dyn Guardrail>>,
    output_guardrail: Option<Arc<dyn Guardrail>>,
    input_transforms: Vec<StateTransform>,
    output_transforms: Vec<StateTransform>,
    handoffs: Vec<Handoff>,
    registry: Arc<AgentRegistry>,
    extractor: ToolCallExtractor,
    docs_cache: RwLock<Option<String>>,
}

impl LlmAgent {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        provider: Arc<dyn Provider>,
    ) -> Self {
        Self::from_base(BaseAgent::new(name, description, AgentType::Llm), provider)
    }

    /// Wrap an existing base, keeping its id, tree and metrics sink
    pub fn from_base(base: BaseAgent, provider: Arc<dyn Provider>) -> Self {
        Self {
            base,
            provider,
            config: RwLock::new(LlmAgentConfig::default()),
            tools: ToolRegistry::new(),
            hooks: RwLock::new(Vec::new()),
            input_guardrail: None,
            output_guardrail: None,
            input_transforms: Vec::new(),
            output_transforms: Vec::new(),
            handoffs: Vec::new(),
            registry: Arc::new(AgentRegistry::new()),
            extractor: ToolCallExtractor::default(),
            docs_cache: RwLock::new(None),
        }
    }

    // =========================================================================
    // Builders
    // =========================================================================

    pub fn with_config(self, config: LlmAgentConfig) -> Self {
        *self.config.write() = config;
        self.invalidate_docs();
        self
    }

    pub fn with_agent_config(self, config: AgentConfig) -> Self {
        self.base.set_config(config);
        self
    }

    pub fn with_system_prompt(self, prompt: impl Into<String>) -> Self {
        self.config.write().system_prompt = prompt.into();
        self.invalidate_docs();
        self
    }

    pub fn with_model(self, model: impl Into<String>) -> Self {
        self.config.write().model = Some(model.into());
        self
    }

    pub fn with_max_iterations(self, max_iterations: usize) -> Self {
        self.config.write().max_iterations = max_iterations;
        self
    }

    pub fn with_provider_options(self, options: ProviderOptions) -> Self {
        self.config.write().provider_options = options;
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<EventDispatcher>) -> Self {
        self.base = self.base.with_dispatcher(dispatcher);
        self
    }

    pub fn with_tool(self, tool: Arc<dyn Tool>) -> Self {
        self.add_tool(tool);
        self
    }

    pub fn with_hook(self, hook: Arc<dyn Hook>) -> Self {
        self.add_hook(hook);
        self
    }

    pub fn with_input_guardrail(mut self, guardrail: Arc<dyn Guardrail>) -> Self {
        self.input_guardrail = Some(guardrail);
        self
    }

    pub fn with_output_guardrail(mut self, guardrail: Arc<dyn Guardrail>) -> Self {
        self.output_guardrail = Some(guardrail);
        self
    }

    pub fn with_input_transform(mut self, transform: StateTransform) -> Self {
        self.input_transforms.push(transform);
        self
    }

    pub fn with_output_transform(mut self, transform: StateTransform) -> Self {
        self.output_transforms.push(transform);
        self
    }

    pub fn with_extractor(mut self, extractor: ToolCallExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    /// Expose `handoff` to the model as `handoff_to_{target}`
    pub fn with_handoff(mut self, handoff: Handoff) -> Self {
        self.add_tool(Arc::new(HandoffTool::new(
            handoff.clone(),
            self.registry.clone(),
        )));
        self.handoffs.push(handoff);
        self
    }

    /// Registry used to resolve handoff targets. Existing handoff tools are
    /// rebuilt against it.
    pub fn with_registry(mut self, registry: Arc<AgentRegistry>) -> Self {
        self.registry = registry;
        self.tools.unregister_by_prefix(HANDOFF_TOOL_PREFIX);
        for handoff in &self.handoffs {
            self.tools.register(Arc::new(HandoffTool::new(
                handoff.clone(),
                self.registry.clone(),
            )));
        }
        self.invalidate_docs();
        self
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn config(&self) -> LlmAgentConfig {
        self.config.read().clone()
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn handoffs(&self) -> &[Handoff] {
        &self.handoffs
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    // =========================================================================
    // Tools and sub-agents
    // =========================================================================

    pub fn add_tool(&self, tool: Arc<dyn Tool>) {
        self.tools.register(tool);
        self.invalidate_docs();
    }

    pub fn remove_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        let removed = self.tools.unregister(name);
        if removed.is_some() {
            self.invalidate_docs();
        }
        removed
    }

    pub fn add_hook(&self, hook: Arc<dyn Hook>) {
        self.hooks.write().push(hook);
    }

    /// Add a child agent, exposing it as a tool under its own name and
    /// enabling `transfer_to_agent`
    pub fn add_sub_agent(&self, agent: Arc<dyn Agent>) -> Result<()> {
        self.base.add_sub_agent(agent.clone())?;

        if !self.tools.contains(TRANSFER_TOOL_NAME) {
            self.tools.register(Arc::new(TransferTool::new(
                self.base.sub_agents_handle(),
            )));
        }
        self.tools.register(Arc::new(SubAgentTool::new(agent)));
        self.invalidate_docs();
        Ok(())
    }

    /// Remove a child and its tool; `transfer_to_agent` goes with the last child
    pub fn remove_sub_agent(&self, name: &str) -> Result<Arc<dyn Agent>> {
        let removed = self.base.remove_sub_agent(name)?;
        self.tools.unregister(name);
        if self.base.sub_agents().is_empty() {
            self.tools.unregister(TRANSFER_TOOL_NAME);
        }
        self.invalidate_docs();
        Ok(removed)
    }

    /// Run the child named `name` directly. Object input becomes state
    /// values, anything else is stored under `input`.
    pub async fn transfer_to(
        &self,
        name: &str,
        reason: Option<&str>,
        input: Value,
    ) -> Result<State> {
        let agent = self.base.find_sub_agent(name).ok_or_else(|| {
            AgentRuntimeError::AgentNotFound(format!("sub-agent '{}' not found", name))
        })?;

        let mut state = State::new();
        if let Some(reason) = reason.filter(|r| !r.is_empty()) {
            state.set_metadata("transfer_reason", reason);
        }
        match input {
            Value::Object(fields) => {
                for (key, value) in fields {
                    state.set(key, value);
                }
            }
            Value::Null => {}
            other => state.set("input", other),
        }

        let input = Handoff::simple("transfer", name).transform_input(&state);
        agent.run(input).await
    }

    // =========================================================================
    // Prompt assembly
    // =========================================================================

    fn invalidate_docs(&self) {
        *self.docs_cache.write() = None;
    }

    /// System prompt plus tool catalog, rebuilt after any tool change
    pub fn system_content(&self) -> String {
        if let Some(cached) = self.docs_cache.read().as_ref() {
            return cached.clone();
        }

        let mut cache = self.docs_cache.write();
        if let Some(cached) = cache.as_ref() {
            return cached.clone();
        }
        let content = docs::system_content(&self.config.read().system_prompt, &self.tools.list());
        *cache = Some(content.clone());
        content
    }

    fn build_messages(&self, state: &State, prompt: &str) -> Vec<Message> {
        let mut messages = Vec::new();

        let system = self.system_content();
        if !system.is_empty() {
            messages.push(Message::system(system));
        }

        if let Some(Value::Array(history)) = state.get("messages") {
            messages.extend(
                history
                    .iter()
                    .filter_map(|m| serde_json::from_value::<Message>(m.clone()).ok()),
            );
        }

        messages.push(Message::user(prompt));
        messages
    }

    // =========================================================================
    // Execution
    // =========================================================================

    async fn generate(&self, messages: &[Message], cancel: &CancellationToken) -> Result<Response> {
        let provider = self.provider.clone();
        let messages = messages.to_vec();
        let options = self.config.read().options();

        self.base
            .execute_with_timeout(cancel, move |token| async move {
                tokio::select! {
                    reply = provider.generate_message(&messages, &options) => reply,
                    _ = token.cancelled() => Err(AgentRuntimeError::Cancelled),
                }
            })
            .await
    }

    async fn execute_core(
        &self,
        state: &State,
        attempt: u32,
        run_id: &str,
        cancel: &CancellationToken,
    ) -> Result<State> {
        let prompt = extract_prompt(state).map_err(|e| {
            self.base
                .error(Phase::InputValidation, "failed to extract prompt")
                .with_source(e)
        })?;
        let mut messages = self.build_messages(state, &prompt);
        let max_iterations = self.config.read().max_iterations;
        let hooks: Vec<Arc<dyn Hook>> = self.hooks.read().clone();

        let mut answer = None;
        for iteration in 1..=max_iterations {
            if cancel.is_cancelled() {
                return Err(self.base.cancelled());
            }

            self.base.emit_event(
                EventType::Progress,
                payload(&ProgressData {
                    current: iteration,
                    total: max_iterations,
                    message: format!("Iteration {}", iteration),
                }),
            );
            tracing::debug!(agent = %self.base.name(), iteration, max_iterations, "Generating");

            for hook in &hooks {
                hook.before_generate(&messages).await;
            }
            let result = self.generate(&messages, cancel).await;
            for hook in &hooks {
                hook.after_generate(result.as_ref()).await;
            }

            let response = match result {
                Ok(response) => response,
                Err(e) if e.has_code(ErrorCode::Cancelled) => {
                    return Err(self.base.attribute(Phase::Execution, "execution cancelled", e))
                }
                Err(e) => {
                    return Err(self
                        .base
                        .error(Phase::Execution, "LLM generation failed")
                        .with_source(e)
                        .into())
                }
            };

            let calls = self.extractor.extract(&response.content);
            if calls.is_empty() {
                answer = Some(response.content);
                break;
            }

            tracing::info!(
                agent = %self.base.name(),
                iteration,
                tool_calls = calls.len(),
                "Model requested tools"
            );
            let results = ToolExecutor::new(&self.tools, &hooks, self.base.info())
                .with_dispatcher(self.base.dispatcher())
                .with_run(run_id, attempt)
                .with_cancel(cancel.clone())
                .execute(&calls, state)
                .await
                .map_err(|e| self.base.attribute(Phase::Execution, "tool round failed", e))?;

            messages.push(Message::assistant(response.content));
            messages.push(Message::user(results));
        }

        let answer = answer.unwrap_or_else(|| {
            tracing::warn!(agent = %self.base.name(), max_iterations, "Iteration limit reached");
            MAX_ITERATIONS_RESULT.to_string()
        });

        let mut result = State::new();
        result.set("result", answer.clone());
        result.set("output", answer);
        result.set("prompt", prompt);
        for artifact in state.artifacts() {
            for (key, value) in &artifact.metadata {
                result.set_metadata(key.clone(), value.clone());
            }
            result.add_artifact(artifact.clone());
        }
        Ok(result)
    }

    fn apply_transforms(
        &self,
        transforms: &[StateTransform],
        mut state: State,
        phase: Phase,
        message: &str,
    ) -> Result<State> {
        for transform in transforms {
            state = transform(&state)
                .map_err(|e| self.base.error(phase, message).with_source(e))?;
        }
        Ok(state)
    }
}

/// First non-empty string stored under one of `PROMPT_KEYS`
pub fn extract_prompt(state: &State) -> Result<String> {
    PROMPT_KEYS
        .iter()
        .filter_map(|key| state.get_str(key))
        .find(|prompt| !prompt.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ValidationError::new("prompt", "no valid prompt found in state").into())
}

#[async_trait]
impl Agent for LlmAgent {
    fn base(&self) -> &BaseAgent {
        &self.base
    }

    async fn run(&self, state: State) -> Result<State> {
        self.run_with_cancel(state, CancellationToken::new()).await
    }

    async fn run_with_cancel(&self, state: State, cancel: CancellationToken) -> Result<State> {
        let run_id = uuid::Uuid::new_v4().to_string();
        tracing::info!(agent = %self.base.name(), run_id = %run_id, "Agent run started");

        if let Some(guardrail) = &self.input_guardrail {
            guardrail.validate(&state).await.map_err(|e| {
                self.base
                    .error(Phase::InputValidation, "input validation failed")
                    .with_source(e)
            })?;
        }

        let state = self.apply_transforms(
            &self.input_transforms,
            state,
            Phase::InputTransform,
            "input transform failed",
        )?;

        let result = self
            .base
            .execute_with_retry(&cancel, |attempt| {
                self.execute_core(&state, attempt, &run_id, &cancel)
            })
            .await?;

        let result = self.apply_transforms(
            &self.output_transforms,
            result,
            Phase::OutputTransform,
            "output transform failed",
        )?;

        if let Some(guardrail) = &self.output_guardrail {
            guardrail.validate(&result).await.map_err(|e| {
                self.base
                    .error(Phase::OutputValidation, "output validation failed")
                    .with_source(e)
            })?;
        }

        tracing::info!(agent = %self.base.name(), run_id = %run_id, "Agent run completed");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::guardrails::RequiredKeys;
    use crate::agent::hooks::MetricsHook;
    use crate::agent::FnAgent;
    use crate::error::IsRetryable;
    use crate::events::dispatcher::DispatcherConfig;
    use crate::events::handlers::handler_fn;
    use crate::provider::ScriptedProvider;
    use crate::state::{transforms, Artifact, ArtifactType, Role};
    use crate::tools::{FnTool, ToolContext, ToolOutput};
    use serde_json::json;

    fn lookup_tool() -> Arc<dyn Tool> {
        Arc::new(FnTool::new(
            "lookup",
            "Read a state value",
            |params: Value, ctx: ToolContext| async move {
                let key = params["key"].as_str().unwrap_or_default().to_string();
                Ok(ToolOutput::from(ctx.state.get(&key).unwrap_or(Value::Null)))
            },
        ))
    }

    fn agent(provider: Arc<ScriptedProvider>) -> LlmAgent {
        LlmAgent::new("assistant", "Answers questions", provider)
            .with_registry(Arc::new(AgentRegistry::new()))
    }

    #[tokio::test]
    async fn test_final_answer_without_tools() {
        let provider = Arc::new(ScriptedProvider::new(["Hello there"]));
        let agent = agent(provider.clone());

        let result = agent
            .run(State::from_values([("input", json!("hi"))]))
            .await
            .unwrap();

        assert_eq!(result.get_str("output"), Some("Hello there"));
        assert_eq!(result.get_str("result"), Some("Hello there"));
        assert_eq!(result.get_str("prompt"), Some("hi"));

        let calls = provider.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].len(), 1);
        assert_eq!(calls[0][0].role, Role::User);
        assert_eq!(calls[0][0].content, "hi");
    }

    #[tokio::test]
    async fn test_tool_round_feeds_results_back() {
        let provider = Arc::new(ScriptedProvider::new([
            r#"{"tool": "lookup", "params": {"key": "city"}}"#,
            "It is Oslo",
        ]));
        let agent = agent(provider.clone())
            .with_system_prompt("You are helpful.")
            .with_tool(lookup_tool());

        let state = State::from_values([("query", json!("where?")), ("city", json!("Oslo"))]);
        let result = agent.run(state).await.unwrap();
        assert_eq!(result.get_str("output"), Some("It is Oslo"));

        let calls = provider.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0][0].role, Role::System);
        assert!(calls[0][0].content.starts_with("You are helpful.\n\n## Available Tools"));

        let second = &calls[1];
        let n = second.len();
        assert_eq!(second[n - 2].role, Role::Assistant);
        assert_eq!(second[n - 1].role, Role::User);
        assert_eq!(second[n - 1].content, "Tool results:\nTool 'lookup' result: Oslo\n");
    }

    #[tokio::test]
    async fn test_loop_is_bounded() {
        let provider = Arc::new(
            ScriptedProvider::default().with_fallback(r#"{"tool": "lookup", "params": {}}"#),
        );
        let agent = agent(provider.clone())
            .with_tool(lookup_tool())
            .with_max_iterations(3);

        let result = agent
            .run(State::from_values([("prompt", json!("loop"))]))
            .await
            .unwrap();

        assert_eq!(provider.call_count(), 3);
        assert_eq!(result.get_str("output"), Some(MAX_ITERATIONS_RESULT));
    }

    #[tokio::test]
    async fn test_missing_prompt_names_agent_and_phase() {
        let provider = Arc::new(ScriptedProvider::new(["unused"]));
        let agent = agent(provider.clone());

        let err = agent
            .run(State::from_values([("input", json!("")), ("other", json!("x"))]))
            .await
            .unwrap_err();

        let agent_err = err.as_agent_error().unwrap();
        assert_eq!(agent_err.agent_name, "assistant");
        assert_eq!(agent_err.agent_id, agent.id().to_string());
        assert_eq!(agent_err.phase, Phase::InputValidation);
        assert!(err.to_string().contains("assistant"));
        assert!(err.to_string().contains("no valid prompt found in state"));
        assert!(err.has_code(ErrorCode::ValidationFailed));
        assert!(!err.is_retryable());
        assert_eq!(provider.call_count(), 0);
    }

    #[test]
    fn test_prompt_key_order() {
        let state = State::from_values([("text", json!("last")), ("message", json!("first"))]);
        assert_eq!(extract_prompt(&state).unwrap(), "first");

        let state = State::from_values([("user_input", json!(42)), ("query", json!("q"))]);
        assert_eq!(extract_prompt(&state).unwrap(), "q");
    }

    #[tokio::test]
    async fn test_history_replayed_before_prompt() {
        let provider = Arc::new(ScriptedProvider::new(["ok"]));
        let agent = agent(provider.clone()).with_system_prompt("sys");

        let state = State::from_values([
            ("input", json!("next")),
            (
                "messages",
                json!([
                    {"role": "user", "content": "earlier"},
                    {"role": "assistant", "content": "reply"},
                    {"bogus": true}
                ]),
            ),
        ]);
        agent.run(state).await.unwrap();

        let sent: Vec<(Role, String)> = provider.calls()[0]
            .iter()
            .map(|m| (m.role, m.content.clone()))
            .collect();
        assert_eq!(
            sent,
            vec![
                (Role::System, "sys".to_string()),
                (Role::User, "earlier".to_string()),
                (Role::Assistant, "reply".to_string()),
                (Role::User, "next".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_fatal_provider_error_is_not_retried() {
        let provider = Arc::new(ScriptedProvider::default());
        provider.push_error(AgentRuntimeError::provider("bad request"));
        let agent = agent(provider.clone());

        let err = agent
            .run(State::from_values([("input", json!("hi"))]))
            .await
            .unwrap_err();

        assert_eq!(provider.call_count(), 1);
        assert!(err.to_string().contains("LLM generation failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_provider_error_is_retried() {
        let provider = Arc::new(ScriptedProvider::default());
        provider.push_error(AgentRuntimeError::transient("rate limited"));
        provider.push_reply("recovered");
        let agent = agent(provider.clone())
            .with_agent_config(AgentConfig::default().with_retry_delay_ms(10));

        let result = agent
            .run(State::from_values([("input", json!("hi"))]))
            .await
            .unwrap();

        assert_eq!(result.get_str("output"), Some("recovered"));
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn test_guardrails_and_transforms() {
        let provider = Arc::new(ScriptedProvider::new(["answer"]).with_fallback("answer"));
        let agent = agent(provider.clone())
            .with_input_guardrail(Arc::new(RequiredKeys::new("needs-question", ["question"])))
            .with_input_transform(transforms::rename_keys([("question", "input")]))
            .with_output_transform(transforms::select_keys(["output"]));

        let err = agent
            .run(State::from_values([("input", json!("hi"))]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("input validation failed"));
        assert_eq!(provider.call_count(), 0);

        let result = agent
            .run(State::from_values([("question", json!("why?"))]))
            .await
            .unwrap();
        assert_eq!(result.keys(), vec!["output".to_string()]);
        assert_eq!(provider.calls()[0].last().unwrap().content, "why?");
    }

    #[tokio::test]
    async fn test_output_guardrail_rejects() {
        let provider = Arc::new(ScriptedProvider::new(["answer"]));
        let agent = agent(provider)
            .with_output_guardrail(Arc::new(RequiredKeys::new("needs-citation", ["citation"])));

        let err = agent
            .run(State::from_values([("input", json!("hi"))]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("output validation failed"));
    }

    #[tokio::test]
    async fn test_artifacts_carried_into_result() {
        let provider = Arc::new(ScriptedProvider::new(["done"]));
        let agent = agent(provider);

        let mut state = State::from_values([("input", json!("summarize"))]);
        state.add_artifact(
            Artifact::new("notes.txt", ArtifactType::Document, b"abc".to_vec())
                .with_metadata("source", "upload"),
        );
        let result = agent.run(state).await.unwrap();

        assert_eq!(result.artifacts().len(), 1);
        assert_eq!(result.get_metadata("source"), Some(&json!("upload")));
    }

    #[tokio::test]
    async fn test_sub_agent_tools_follow_children() {
        let provider = Arc::new(ScriptedProvider::new([
            r#"{"tool": "transfer_to_agent", "params": {"agent_name": "helper", "input": "x"}}"#,
            "done",
        ]));
        let parent = agent(provider.clone());
        let helper: Arc<dyn Agent> = Arc::new(FnAgent::from_fn("helper", |mut state: State| async move {
            let input = state.get_str("input").unwrap_or_default().to_string();
            state.set("output", format!("helped {}", input));
            Ok(state)
        }));

        parent.add_sub_agent(helper).unwrap();
        assert_eq!(parent.tools().names(), vec!["helper", TRANSFER_TOOL_NAME]);
        assert!(parent.system_content().contains("### transfer_to_agent"));

        parent
            .run(State::from_values([("input", json!("delegate"))]))
            .await
            .unwrap();
        let last = provider.calls()[1].last().unwrap().content.clone();
        assert_eq!(last, "Tool results:\nTool 'transfer_to_agent' result: helped x\n");

        let direct = parent
            .transfer_to("helper", Some("testing"), json!("y"))
            .await
            .unwrap();
        assert_eq!(direct.get_str("output"), Some("helped y"));

        parent.remove_sub_agent("helper").unwrap();
        assert!(parent.tools().is_empty());
        assert!(!parent.system_content().contains("transfer_to_agent"));
    }

    #[tokio::test]
    async fn test_handoff_tools_use_injected_registry() {
        let registry = Arc::new(AgentRegistry::new());
        let writer: Arc<dyn Agent> = Arc::new(FnAgent::from_fn("writer", |mut state: State| async move {
            state.set("output", "drafted");
            Ok(state)
        }));
        registry.register(writer).unwrap();

        let provider = Arc::new(ScriptedProvider::new([
            r#"{"tool": "handoff_to_writer", "params": {}}"#,
            "handed off",
        ]));
        let agent = LlmAgent::new("router", "", provider.clone())
            .with_handoff(Handoff::simple("to-writer", "writer"))
            .with_registry(registry);

        assert_eq!(agent.tools().names(), vec!["handoff_to_writer"]);
        agent
            .run(State::from_values([("input", json!("write"))]))
            .await
            .unwrap();
        let last = provider.calls()[1].last().unwrap().content.clone();
        assert!(last.contains("Tool 'handoff_to_writer' result"), "{}", last);
    }

    #[tokio::test]
    async fn test_progress_events_and_hooks() {
        let dispatcher = Arc::new(EventDispatcher::new(DispatcherConfig::default()));
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        dispatcher.subscribe(
            handler_fn(move |e| {
                sink.lock().push(e.event_type.to_string());
                Ok(())
            }),
            vec![],
        );

        let metrics = Arc::new(MetricsHook::new());
        let provider = Arc::new(ScriptedProvider::new([
            r#"{"tool": "lookup", "params": {"key": "a"}}"#,
            "final",
        ]));
        let agent = agent(provider)
            .with_dispatcher(dispatcher.clone())
            .with_tool(lookup_tool())
            .with_hook(metrics.clone());

        agent
            .run(State::from_values([("input", json!("go"))]))
            .await
            .unwrap();
        dispatcher.close().await;

        let types = seen.lock().clone();
        assert_eq!(types.iter().filter(|t| *t == "progress").count(), 2);
        assert!(types.contains(&"tool.call".to_string()));
        assert!(types.contains(&"tool.result".to_string()));

        let m = metrics.metrics();
        assert_eq!(m.requests, 2);
        assert_eq!(m.tool_calls, 1);
    }

    #[tokio::test]
    async fn test_cancelled_run() {
        let provider = Arc::new(ScriptedProvider::new(["never"]));
        let agent = agent(provider.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = agent
            .run_with_cancel(State::from_values([("input", json!("hi"))]), cancel)
            .await
            .unwrap_err();
        assert!(err.has_code(ErrorCode::Cancelled));
        let agent_err = err.as_agent_error().unwrap();
        assert_eq!(agent_err.agent_name, "assistant");
        assert_eq!(agent_err.phase, Phase::Execution);
        assert_eq!(provider.call_count(), 0);
    }

    #[test]
    fn test_registry_is_private_unless_injected() {
        let provider = Arc::new(ScriptedProvider::default());
        let a = LlmAgent::new("a", "", provider.clone());
        let b = LlmAgent::new("b", "", provider.clone());
        assert!(!Arc::ptr_eq(a.registry(), b.registry()));
        assert!(!Arc::ptr_eq(a.registry(), &AgentRegistry::global()));

        let shared = LlmAgent::new("c", "", provider).with_registry(AgentRegistry::global());
        assert!(Arc::ptr_eq(shared.registry(), &AgentRegistry::global()));
    }

    #[test]
    fn test_config_defaults_from_toml_shape() {
        let config: LlmAgentConfig =
            serde_json::from_value(json!({"system_prompt": "be brief", "model": "m1"})).unwrap();
        assert_eq!(config.max_iterations, 10);
        assert_eq!(config.options().model.as_deref(), Some("m1"));
    }
}
