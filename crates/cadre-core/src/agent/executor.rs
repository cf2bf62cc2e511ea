//! Sequential execution of detected tool calls
//!
//! Tool failures never abort the loop: unknown tools and tool errors are
//! written into the result text so the model can react to them.

use serde_json::{json, Map, Value};
use std::fmt::Write;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use super::extraction::ToolCall;
use super::hooks::Hook;
use super::AgentInfo;
use crate::error::{AgentRuntimeError, Result};
use crate::events::{payload, Event, EventDispatcher, EventType, ToolCallData, ToolResultData};
use crate::state::{State, StateReader};
use crate::tools::{ToolContext, ToolEventEmitter, ToolRegistry};

/// Header of the text fed back to the model after a tool round
pub const RESULTS_HEADER: &str = "Tool results:\n";

/// Runs one round of tool calls on behalf of an agent
pub struct ToolExecutor<'a> {
    tools: &'a ToolRegistry,
    hooks: &'a [Arc<dyn Hook>],
    agent: AgentInfo,
    dispatcher: Option<Arc<EventDispatcher>>,
    run_id: String,
    retry: u32,
    cancel: CancellationToken,
}

impl<'a> ToolExecutor<'a> {
    pub fn new(tools: &'a ToolRegistry, hooks: &'a [Arc<dyn Hook>], agent: AgentInfo) -> Self {
        Self {
            tools,
            hooks,
            agent,
            dispatcher: None,
            run_id: String::new(),
            retry: 0,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_dispatcher(mut self, dispatcher: Option<Arc<EventDispatcher>>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn with_run(mut self, run_id: impl Into<String>, retry: u32) -> Self {
        self.run_id = run_id.into();
        self.retry = retry;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn emit(&self, event: Event) {
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.dispatch(event);
        }
    }

    fn event(&self, event_type: EventType, data: Value) -> Event {
        Event::new(event_type, &self.agent.id, &self.agent.name, data)
    }

    /// Execute `calls` in order against a read-only view of `state`.
    ///
    /// Returns the aggregated result text, empty when there were no calls.
    /// Only cancellation is an error.
    pub async fn execute(&self, calls: &[ToolCall], state: &State) -> Result<String> {
        if calls.is_empty() {
            return Ok(String::new());
        }

        let view: Arc<dyn StateReader> = Arc::new(state.clone());
        let mut results = String::from(RESULTS_HEADER);

        for call in calls {
            if self.cancel.is_cancelled() {
                return Err(AgentRuntimeError::Cancelled);
            }

            let Some(tool) = self.tools.get(&call.name) else {
                tracing::warn!(tool = %call.name, "Model requested unknown tool");
                let _ = writeln!(
                    results,
                    "Error: Tool '{}' not found. Available tools: {}",
                    call.name,
                    self.tools.names().join(", ")
                );
                continue;
            };

            let ctx = ToolContext::new(view.clone(), self.agent.clone(), &call.name)
                .with_run_id(self.run_id.clone())
                .with_retry(self.retry)
                .with_cancel(self.cancel.child_token())
                .with_events(ToolEventEmitter::new(
                    &call.name,
                    &self.agent,
                    self.dispatcher.clone(),
                ));

            self.emit(self.event(
                EventType::ToolCall,
                payload(&ToolCallData {
                    tool_name: call.name.clone(),
                    parameters: call.params.clone(),
                    request_id: call.id.clone(),
                }),
            ));

            let hook_params = hook_params(&call.params);
            for hook in self.hooks {
                hook.before_tool_call(&call.name, &hook_params).await;
            }

            tracing::info!(tool = %call.name, "Executing tool");
            let start = Instant::now();
            let result = tool.execute(call.params.clone(), &ctx).await;
            let duration_ms = start.elapsed().as_millis() as u64;

            for hook in self.hooks {
                hook.after_tool_call(&call.name, result.as_ref()).await;
            }

            tracing::info!(
                tool = %call.name,
                duration_ms,
                is_error = result.is_err(),
                "Tool execution completed"
            );

            match result {
                Ok(output) => {
                    self.emit(self.event(
                        EventType::ToolResult,
                        payload(&ToolResultData {
                            tool_name: call.name.clone(),
                            result: output.to_value(),
                            duration_ms,
                        }),
                    ));
                    let _ = writeln!(results, "Tool '{}' result: {}", call.name, output.render());
                }
                Err(e) => {
                    self.emit(
                        self.event(EventType::ToolError, json!({ "tool_name": call.name }))
                            .with_error(&e),
                    );
                    let _ = writeln!(results, "Tool '{}' error: {}", call.name, e);
                }
            }
        }

        Ok(results)
    }
}

/// Parameters as hooks see them: objects as-is, null as `{}`, anything else
/// wrapped under `value`
fn hook_params(params: &Value) -> Value {
    match params {
        Value::Object(_) => params.clone(),
        Value::Null => Value::Object(Map::new()),
        other => json!({ "value": other }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::hooks::MetricsHook;
    use crate::agent::AgentType;
    use crate::events::dispatcher::DispatcherConfig;
    use crate::events::handlers::handler_fn;
    use crate::tools::{FnTool, ToolOutput};
    use parking_lot::Mutex;
    use std::collections::HashMap;

    fn info() -> AgentInfo {
        AgentInfo {
            id: "a1".into(),
            name: "runner".into(),
            description: String::new(),
            agent_type: AgentType::Llm,
            metadata: HashMap::new(),
        }
    }

    fn tools() -> ToolRegistry {
        let tools = ToolRegistry::new();
        tools.register(Arc::new(FnTool::new(
            "lookup",
            "Read a state value",
            |params: Value, ctx: ToolContext| async move {
                let key = params["key"].as_str().unwrap_or_default().to_string();
                Ok(ToolOutput::from(ctx.state.get(&key).unwrap_or(Value::Null)))
            },
        )));
        tools.register(Arc::new(FnTool::new("fail", "Always fails", |_, _| async {
            Err(AgentRuntimeError::other("disk full"))
        })));
        tools
    }

    #[tokio::test]
    async fn test_results_text_and_recovery() {
        let tools = tools();
        let hooks: Vec<Arc<dyn Hook>> = Vec::new();
        let executor = ToolExecutor::new(&tools, &hooks, info());
        let state = State::from_values([("city", json!("Oslo")), ("temps", json!([1, 2]))]);

        let calls = vec![
            ToolCall::new("lookup", json!({"key": "city"})),
            ToolCall::new("nope", json!({})),
            ToolCall::new("fail", json!({})),
            ToolCall::new("lookup", json!({"key": "temps"})),
            ToolCall::new("lookup", json!({"key": "missing"})),
        ];
        let text = executor.execute(&calls, &state).await.unwrap();

        assert_eq!(
            text,
            "Tool results:\n\
             Tool 'lookup' result: Oslo\n\
             Error: Tool 'nope' not found. Available tools: fail, lookup\n\
             Tool 'fail' error: disk full\n\
             Tool 'lookup' result: [1,2]\n\
             Tool 'lookup' result: Tool executed successfully with no output\n"
        );
    }

    #[tokio::test]
    async fn test_no_calls_is_empty() {
        let tools = tools();
        let executor = ToolExecutor::new(&tools, &[], info());
        assert_eq!(executor.execute(&[], &State::new()).await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_hooks_and_events() {
        let tools = tools();
        let metrics = Arc::new(MetricsHook::new());
        let hooks: Vec<Arc<dyn Hook>> = vec![metrics.clone()];

        let dispatcher = Arc::new(EventDispatcher::new(DispatcherConfig::default()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        dispatcher.subscribe(
            handler_fn(move |e| {
                sink.lock().push(e.event_type.to_string());
                Ok(())
            }),
            vec![],
        );

        let executor =
            ToolExecutor::new(&tools, &hooks, info()).with_dispatcher(Some(dispatcher.clone()));
        let calls = vec![
            ToolCall::new("lookup", json!({"key": "x"})),
            ToolCall::new("fail", Value::Null),
        ];
        executor.execute(&calls, &State::new()).await.unwrap();
        dispatcher.close().await;

        let m = metrics.metrics();
        assert_eq!(m.tool_calls, 2);
        assert_eq!(m.error_count, 1);

        let mut types = seen.lock().clone();
        types.sort();
        assert_eq!(types, vec!["tool.call", "tool.call", "tool.error", "tool.result"]);
    }

    #[tokio::test]
    async fn test_cancelled_round_stops() {
        let tools = tools();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let executor = ToolExecutor::new(&tools, &[], info()).with_cancel(cancel);
        let err = executor
            .execute(&[ToolCall::new("lookup", json!({}))], &State::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentRuntimeError::Cancelled));
    }

    #[test]
    fn test_hook_params_normalized() {
        assert_eq!(hook_params(&Value::Null), json!({}));
        assert_eq!(hook_params(&json!("x")), json!({"value": "x"}));
        assert_eq!(hook_params(&json!({"a": 1})), json!({"a": 1}));
    }
}
