//! Tool capability
//!
//! Tools are what the model can call from inside the agent loop. Each call
//! gets a `ToolContext` with a read-only view of the current state and an
//! event emitter scoped to the tool. Results are a `ToolOutput`, rendered to
//! text once at the tool boundary.

pub mod context;
pub mod docs;
pub mod registry;

pub use context::{ToolContext, ToolEventEmitter};
pub use registry::ToolRegistry;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use crate::error::Result;

/// Text fed back to the model when a tool succeeds without output
pub const EMPTY_OUTPUT: &str = "Tool executed successfully with no output";

/// What a tool produced
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    Text(String),
    Structured(Value),
    Empty,
}

impl ToolOutput {
    /// Text form shown to the model
    pub fn render(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Structured(value) => {
                serde_json::to_string(value).unwrap_or_else(|_| value.to_string())
            }
            Self::Empty => EMPTY_OUTPUT.to_string(),
        }
    }

    /// JSON form for events and hooks
    pub fn to_value(&self) -> Value {
        match self {
            Self::Text(text) => Value::String(text.clone()),
            Self::Structured(value) => value.clone(),
            Self::Empty => Value::Null,
        }
    }
}

impl From<String> for ToolOutput {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for ToolOutput {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<Value> for ToolOutput {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Empty,
            Value::String(s) => Self::Text(s),
            other => Self::Structured(other),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolExample {
    pub name: String,
    pub description: String,
    pub scenario: String,
    pub input: Value,
    pub output: Value,
    pub explanation: String,
}

/// Descriptive metadata, used only to document the tool for the model
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolMetadata {
    pub output_schema: Option<Value>,
    pub usage_instructions: String,
    pub examples: Vec<ToolExample>,
    pub constraints: Vec<String>,
    pub error_guidance: BTreeMap<String, String>,
    pub category: String,
    pub tags: Vec<String>,
    pub version: String,
    pub is_deterministic: bool,
    pub is_destructive: bool,
    pub requires_confirmation: bool,
    pub estimated_latency: String,
}

#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (id)
    fn name(&self) -> &str;

    /// Tool description for the model
    fn description(&self) -> &str;

    /// JSON schema for parameters
    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    fn metadata(&self) -> ToolMetadata {
        ToolMetadata::default()
    }

    /// Execute the tool
    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<ToolOutput>;
}

type ToolFn = Arc<dyn Fn(Value, ToolContext) -> BoxFuture<'static, Result<ToolOutput>> + Send + Sync>;

/// Tool backed by a closure
pub struct FnTool {
    name: String,
    description: String,
    schema: Value,
    metadata: ToolMetadata,
    f: ToolFn,
}

impl FnTool {
    pub fn new<F, Fut>(name: impl Into<String>, description: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolOutput>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            schema: json!({"type": "object", "properties": {}}),
            metadata: ToolMetadata::default(),
            f: Arc::new(move |params, ctx| f(params, ctx).boxed()),
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = schema;
        self
    }

    pub fn with_metadata(mut self, metadata: ToolMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.schema.clone()
    }

    fn metadata(&self) -> ToolMetadata {
        self.metadata.clone()
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        (self.f)(params, ctx.clone()).await
    }
}
