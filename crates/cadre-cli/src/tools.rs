//! Built-in tools available to every CLI agent
//!
//! ## Built-in Tools
//! - `echo` - Returns its `text` parameter
//! - `clock` - Current UTC time, optionally in a strftime format

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::fmt::Write;
use std::sync::Arc;

use cadre_core::error::{Result, ToolError};
use cadre_core::tools::ToolMetadata;
use cadre_core::{Tool, ToolContext, ToolOutput};

pub fn builtin_tools() -> Vec<Arc<dyn Tool>> {
    vec![Arc::new(EchoTool), Arc::new(ClockTool)]
}

pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Repeat the given text back"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "text": {"type": "string", "description": "Text to repeat"}
            },
            "required": ["text"]
        })
    }

    fn metadata(&self) -> ToolMetadata {
        ToolMetadata {
            category: "utility".into(),
            is_deterministic: true,
            estimated_latency: "fast".into(),
            ..Default::default()
        }
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> Result<ToolOutput> {
        let text = params
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::execution("echo", "missing 'text' parameter"))?;
        Ok(ToolOutput::Text(text.to_string()))
    }
}

pub struct ClockTool;

#[async_trait]
impl Tool for ClockTool {
    fn name(&self) -> &str {
        "clock"
    }

    fn description(&self) -> &str {
        "Current date and time in UTC"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "format": {
                    "type": "string",
                    "description": "strftime format, RFC 3339 when omitted"
                }
            }
        })
    }

    fn metadata(&self) -> ToolMetadata {
        ToolMetadata {
            category: "utility".into(),
            estimated_latency: "fast".into(),
            ..Default::default()
        }
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> Result<ToolOutput> {
        let now = Utc::now();
        let text = match params.get("format").and_then(Value::as_str) {
            Some(format) => {
                let mut out = String::new();
                write!(out, "{}", now.format(format))
                    .map_err(|_| ToolError::execution("clock", format!("invalid format '{}'", format)))?;
                out
            }
            None => now.to_rfc3339(),
        };
        Ok(ToolOutput::Text(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadre_core::agent::{AgentInfo, AgentType};
    use cadre_core::State;
    use std::collections::HashMap;

    fn ctx(tool: &str) -> ToolContext {
        let info = AgentInfo {
            id: "cli".into(),
            name: "cli".into(),
            description: String::new(),
            agent_type: AgentType::Llm,
            metadata: HashMap::new(),
        };
        ToolContext::new(Arc::new(State::new()), info, tool)
    }

    #[tokio::test]
    async fn test_echo() {
        let out = EchoTool
            .execute(json!({"text": "hello"}), &ctx("echo"))
            .await
            .unwrap();
        assert_eq!(out.render(), "hello");

        let err = EchoTool.execute(json!({}), &ctx("echo")).await.unwrap_err();
        assert!(err.to_string().contains("missing 'text'"));
    }

    #[tokio::test]
    async fn test_clock_formats() {
        let out = ClockTool
            .execute(json!({"format": "%Y"}), &ctx("clock"))
            .await
            .unwrap();
        assert_eq!(out.render().len(), 4);

        let out = ClockTool.execute(json!({}), &ctx("clock")).await.unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(&out.render()).is_ok());

        let err = ClockTool
            .execute(json!({"format": "%Q"}), &ctx("clock"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid format"));
    }
}
