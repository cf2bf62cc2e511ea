//! Builds an agent from its file and runs it once

use anyhow::Result;
use serde_json::{json, Value};
use std::sync::Arc;

use cadre_core::agent::{agent_output, AgentType, BaseAgent};
use cadre_core::events::handlers::handler_fn;
use cadre_core::events::{DispatcherConfig, EventDispatcher};
use cadre_core::provider::Provider;
use cadre_core::{Agent, AgentRegistry, LlmAgent, State};

use crate::config::AgentFile;
use crate::tools::builtin_tools;

pub fn build_agent(
    file: &AgentFile,
    provider: Arc<dyn Provider>,
    dispatcher: Arc<EventDispatcher>,
) -> LlmAgent {
    let base = BaseAgent::new(&file.name, &file.description, AgentType::Llm)
        .with_config(file.config.clone())
        .with_dispatcher(dispatcher);

    let agent = LlmAgent::from_base(base, provider)
        .with_config(file.llm_config())
        .with_registry(Arc::new(AgentRegistry::new()));
    for tool in builtin_tools() {
        agent.add_tool(tool);
    }
    agent
}

/// Run the agent on `input`, writing every event as a JSON line to stderr.
/// Returns the agent's output value.
pub async fn run_agent(file: &AgentFile, provider: Arc<dyn Provider>, input: &str) -> Result<Value> {
    let dispatcher = Arc::new(EventDispatcher::new(DispatcherConfig::default()));
    dispatcher.subscribe(
        handler_fn(|event| {
            match serde_json::to_string(event) {
                Ok(line) => eprintln!("{}", line),
                Err(e) => tracing::warn!(error = %e, "Failed to encode event"),
            }
            Ok(())
        }),
        vec![],
    );

    let agent = build_agent(file, provider, dispatcher.clone());
    agent.validate()?;

    tracing::info!(agent = %file.name, "Running agent");
    let result = agent.run(State::from_values([("input", json!(input))])).await;
    dispatcher.close().await;

    Ok(agent_output(&result?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadre_core::provider::ScriptedProvider;

    fn agent_file() -> AgentFile {
        serde_json::from_value(json!({
            "name": "assistant",
            "system_prompt": "Use tools when asked.",
            "max_iterations": 3
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_builtin_tools_registered() {
        let provider = Arc::new(ScriptedProvider::default());
        let dispatcher = Arc::new(EventDispatcher::new(DispatcherConfig::default()));
        let agent = build_agent(&agent_file(), provider, dispatcher);

        assert_eq!(agent.tools().names(), vec!["clock", "echo"]);
        assert_eq!(agent.config().max_iterations, 3);
        assert!(agent.system_content().contains("### echo"));
    }

    #[tokio::test]
    async fn test_run_with_echo_round() {
        let provider = Arc::new(ScriptedProvider::new([
            r#"{"tool": "echo", "params": {"text": "ping"}}"#,
            "The tool said ping",
        ]));

        let output = run_agent(&agent_file(), provider.clone(), "say ping")
            .await
            .unwrap();

        assert_eq!(output, json!("The tool said ping"));
        let last = provider.calls()[1].last().unwrap().content.clone();
        assert_eq!(last, "Tool results:\nTool 'echo' result: ping\n");
    }

    #[tokio::test]
    async fn test_exhausted_script_fails() {
        let provider = Arc::new(ScriptedProvider::default());
        let err = run_agent(&agent_file(), provider, "hi").await.unwrap_err();
        assert!(err.to_string().contains("LLM generation failed"));
    }
}
