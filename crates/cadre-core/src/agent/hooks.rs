//! Observer hooks around generation and tool calls
//!
//! Hooks see every model request and tool call the loop makes. They are
//! side-effect only: nothing they do changes control flow.
//!
//! ## Built-in Hooks
//! - `LoggingHook` - Logs generation and tool calls at a chosen detail level
//! - `MetricsHook` - Counts requests, tool calls, errors, and timings

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use tokio::time::{Duration, Instant};

use crate::error::AgentRuntimeError;
use crate::provider::Response;
use crate::state::Message;
use crate::tools::ToolOutput;

#[async_trait]
pub trait Hook: Send + Sync {
    async fn before_generate(&self, _messages: &[Message]) {}

    async fn after_generate(&self, _result: Result<&Response, &AgentRuntimeError>) {}

    async fn before_tool_call(&self, _tool: &str, _params: &Value) {}

    async fn after_tool_call(&self, _tool: &str, _result: Result<&ToolOutput, &AgentRuntimeError>) {}
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

fn summarize_params(params: &Value) -> String {
    let Some(map) = params.as_object() else {
        return truncate(&params.to_string(), 20);
    };
    map.iter()
        .map(|(key, value)| {
            let shown = match value {
                Value::String(s) => truncate(s, 20),
                Value::Array(items) => format!("[{} items]", items.len()),
                Value::Object(fields) => format!("{{{} keys}}", fields.len()),
                other => other.to_string(),
            };
            format!("{}: {}", key, shown)
        })
        .collect::<Vec<_>>()
        .join(", ")
}

// ============================================================================
// Logging
// ============================================================================

/// Detail level for `LoggingHook`. Each level includes the ones below it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    #[default]
    Basic,
    Detailed,
    Debug,
}

#[derive(Debug, Default)]
pub struct LoggingHook {
    level: LogLevel,
}

impl LoggingHook {
    pub fn new(level: LogLevel) -> Self {
        Self { level }
    }
}

#[async_trait]
impl Hook for LoggingHook {
    async fn before_generate(&self, messages: &[Message]) {
        tracing::info!("Generating response");
        if self.level >= LogLevel::Detailed {
            tracing::info!(count = messages.len(), "Message count");
        }
        if self.level >= LogLevel::Debug {
            for (index, msg) in messages.iter().enumerate() {
                tracing::debug!(
                    index,
                    role = %msg.role,
                    content = %truncate(&msg.content, 100),
                    "Message details"
                );
            }
        }
    }

    async fn after_generate(&self, result: Result<&Response, &AgentRuntimeError>) {
        match result {
            Err(e) => tracing::error!(error = %e, "Generation failed"),
            Ok(response) => {
                tracing::info!("Response generated");
                if self.level >= LogLevel::Detailed {
                    let max = if self.level >= LogLevel::Debug { 200 } else { 50 };
                    tracing::info!(content = %truncate(&response.content, max), "Response content");
                }
            }
        }
    }

    async fn before_tool_call(&self, tool: &str, params: &Value) {
        tracing::info!(tool, "Calling tool");
        match self.level {
            LogLevel::Basic => {}
            LogLevel::Detailed => {
                tracing::debug!(tool, params = %summarize_params(params), "Tool parameters")
            }
            LogLevel::Debug => {
                let pretty = serde_json::to_string_pretty(params).unwrap_or_default();
                tracing::debug!(tool, params = %pretty, "Tool parameters");
            }
        }
    }

    async fn after_tool_call(&self, tool: &str, result: Result<&ToolOutput, &AgentRuntimeError>) {
        match result {
            Err(e) => tracing::error!(tool, error = %e, "Tool call failed"),
            Ok(output) => {
                tracing::info!(tool, output_len = output.render().len(), "Tool executed successfully");
                match self.level {
                    LogLevel::Basic => {}
                    LogLevel::Detailed => {
                        tracing::debug!(tool, result = %truncate(&output.render(), 50), "Tool result")
                    }
                    LogLevel::Debug => {
                        let pretty = serde_json::to_string_pretty(&output.to_value())
                            .unwrap_or_default();
                        tracing::debug!(tool, result = %truncate(&pretty, 300), "Tool result");
                    }
                }
            }
        }
    }
}

// ============================================================================
// Metrics
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ToolStats {
    pub calls: usize,
    pub average_ms: f64,
    pub fastest_ms: f64,
    pub slowest_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HookMetrics {
    pub requests: usize,
    pub tool_calls: usize,
    pub error_count: usize,
    /// Rough estimate, a quarter of the character count
    pub total_tokens: usize,
    pub average_generation_ms: f64,
    pub tool_stats: HashMap<String, ToolStats>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    requests: usize,
    tool_calls: usize,
    error_count: usize,
    total_tokens: usize,
    generate_times: Vec<Duration>,
    tool_times: HashMap<String, Vec<Duration>>,
    generate_started: Option<Instant>,
    tool_started: HashMap<String, Vec<Instant>>,
}

/// Aggregates counts and timings across runs. Safe to share between agents.
#[derive(Debug, Default)]
pub struct MetricsHook {
    inner: Mutex<MetricsInner>,
}

impl MetricsHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metrics(&self) -> HookMetrics {
        let inner = self.inner.lock();

        let average_generation_ms = if inner.generate_times.is_empty() {
            0.0
        } else {
            let total: Duration = inner.generate_times.iter().sum();
            total.as_millis() as f64 / inner.generate_times.len() as f64
        };

        let tool_stats = inner
            .tool_times
            .iter()
            .filter(|(_, times)| !times.is_empty())
            .map(|(tool, times)| {
                let ms: Vec<f64> = times.iter().map(|t| t.as_millis() as f64).collect();
                let stats = ToolStats {
                    calls: ms.len(),
                    average_ms: ms.iter().sum::<f64>() / ms.len() as f64,
                    fastest_ms: ms.iter().copied().fold(f64::INFINITY, f64::min),
                    slowest_ms: ms.iter().copied().fold(0.0, f64::max),
                };
                (tool.clone(), stats)
            })
            .collect();

        HookMetrics {
            requests: inner.requests,
            tool_calls: inner.tool_calls,
            error_count: inner.error_count,
            total_tokens: inner.total_tokens,
            average_generation_ms,
            tool_stats,
        }
    }

    pub fn reset(&self) {
        *self.inner.lock() = MetricsInner::default();
    }
}

#[async_trait]
impl Hook for MetricsHook {
    async fn before_generate(&self, messages: &[Message]) {
        let mut inner = self.inner.lock();
        inner.requests += 1;
        inner.total_tokens += messages.iter().map(|m| m.content.len() / 4).sum::<usize>();
        inner.generate_started = Some(Instant::now());
    }

    async fn after_generate(&self, result: Result<&Response, &AgentRuntimeError>) {
        let mut inner = self.inner.lock();
        let started = inner.generate_started.take();
        match result {
            Err(_) => inner.error_count += 1,
            Ok(response) => {
                inner.total_tokens += response.content.len() / 4;
                if let Some(start) = started {
                    inner.generate_times.push(start.elapsed());
                }
            }
        }
    }

    async fn before_tool_call(&self, tool: &str, _params: &Value) {
        self.inner
            .lock()
            .tool_started
            .entry(tool.to_string())
            .or_default()
            .push(Instant::now());
    }

    async fn after_tool_call(&self, tool: &str, result: Result<&ToolOutput, &AgentRuntimeError>) {
        let mut inner = self.inner.lock();
        inner.tool_calls += 1;
        let started = inner.tool_started.get_mut(tool).and_then(Vec::pop);
        if result.is_err() {
            inner.error_count += 1;
            return;
        }
        if let Some(start) = started {
            let elapsed = start.elapsed();
            inner
                .tool_times
                .entry(tool.to_string())
                .or_default()
                .push(elapsed);
        }
    }
}
