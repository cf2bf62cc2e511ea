//! Error types for the agent runtime
//!
//! ## Structured errors
//! - `AgentError` - failure tagged with the agent's id, name and phase
//! - `ToolError` - failure tagged with the tool name and phase
//! - `ValidationError` - bad configuration, input, or schema
//! - `MultiError` - aggregate of independent failures (cleanup, composite handlers)
//!
//! `AgentRuntimeError` is the crate-wide error. Retry decisions go through
//! `IsRetryable`; nested causes are reachable with `cause()` and `has_code()`.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, AgentRuntimeError>;

/// Stable machine-readable error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    AgentNotFound,
    AgentFailure,
    CircularDependency,
    InvalidState,
    InvalidConfig,
    Timeout,
    MaxRetries,
    DuplicateId,
    ToolNotFound,
    ToolExecution,
    ValidationFailed,
    EventDispatch,
    StateAccess,
    StateReadOnly,
    Cancelled,
    NoStatesProvided,
    UnknownMergeStrategy,
    TransformFailed,
    Provider,
    MultipleErrors,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentNotFound => "agent_not_found",
            Self::AgentFailure => "agent_error",
            Self::CircularDependency => "agent_circular_dependency",
            Self::InvalidState => "agent_invalid_state",
            Self::InvalidConfig => "agent_invalid_config",
            Self::Timeout => "agent_timeout",
            Self::MaxRetries => "agent_max_retries",
            Self::DuplicateId => "agent_duplicate_id",
            Self::ToolNotFound => "tool_not_found",
            Self::ToolExecution => "tool_execution_failed",
            Self::ValidationFailed => "schema_validation_failed",
            Self::EventDispatch => "event_dispatch_failed",
            Self::StateAccess => "state_access_failed",
            Self::StateReadOnly => "state_readonly",
            Self::Cancelled => "agent_cancelled",
            Self::NoStatesProvided => "no_states_provided",
            Self::UnknownMergeStrategy => "unknown_merge_strategy",
            Self::TransformFailed => "transform_failed",
            Self::Provider => "provider_error",
            Self::MultipleErrors => "multiple_errors",
            Self::Internal => "internal_error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase of agent or tool execution an error occurred in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Initialize,
    Cleanup,
    Execution,
    InputValidation,
    OutputValidation,
    InputTransform,
    OutputTransform,
    Validation,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialize => "initialize",
            Self::Cleanup => "cleanup",
            Self::Execution => "execution",
            Self::InputValidation => "input_validation",
            Self::OutputValidation => "output_validation",
            Self::InputTransform => "input_transform",
            Self::OutputTransform => "output_transform",
            Self::Validation => "validation",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trait for errors that can tell the retry loop whether another attempt makes sense
pub trait IsRetryable {
    fn is_retryable(&self) -> bool;

    /// Server-requested delay before the next attempt, if any
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

// ============================================================================
// AgentError
// ============================================================================

/// Failure attributed to a specific agent and phase
#[derive(Debug)]
pub struct AgentError {
    pub agent_id: String,
    pub agent_name: String,
    pub phase: Phase,
    pub message: String,
    pub source: Option<Box<AgentRuntimeError>>,
    pub context: HashMap<String, Value>,
}

impl AgentError {
    pub fn new(
        agent_id: impl Into<String>,
        agent_name: impl Into<String>,
        phase: Phase,
        message: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_name: agent_name.into(),
            phase,
            message: message.into(),
            source: None,
            context: HashMap::new(),
        }
    }

    pub fn with_source(mut self, source: AgentRuntimeError) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "agent error [{}/{}] in {}: {}",
            self.agent_id, self.agent_name, self.phase, self.message
        )?;
        if let Some(source) = &self.source {
            write!(f, ": {}", source)?;
        }
        Ok(())
    }
}

impl std::error::Error for AgentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl IsRetryable for AgentError {
    fn is_retryable(&self) -> bool {
        if matches!(self.phase, Phase::Initialize | Phase::Cleanup) {
            return false;
        }
        self.source.as_ref().map_or(true, |s| s.is_retryable())
    }
}

// ============================================================================
// ToolError
// ============================================================================

/// Failure attributed to a tool
#[derive(Debug)]
pub struct ToolError {
    pub tool_name: String,
    pub phase: Phase,
    pub message: String,
    pub source: Option<Box<AgentRuntimeError>>,
}

impl ToolError {
    pub fn new(tool_name: impl Into<String>, phase: Phase, message: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            phase,
            message: message.into(),
            source: None,
        }
    }

    /// Execution-phase failure, the common case for tool bodies
    pub fn execution(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(tool_name, Phase::Execution, message)
    }

    pub fn with_source(mut self, source: AgentRuntimeError) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tool error [{}] in {}: {}",
            self.tool_name, self.phase, self.message
        )?;
        if let Some(source) = &self.source {
            write!(f, ": {}", source)?;
        }
        Ok(())
    }
}

impl std::error::Error for ToolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl IsRetryable for ToolError {
    fn is_retryable(&self) -> bool {
        self.phase == Phase::Execution && self.source.as_ref().map_or(true, |s| s.is_retryable())
    }
}

// ============================================================================
// ValidationError
// ============================================================================

/// Invalid field in a configuration, state, or schema
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub value: Option<Value>,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: None,
            message: message.into(),
        }
    }

    pub fn with_value(mut self, value: impl Into<Value>) -> Self {
        self.value = Some(value.into());
        self
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "validation error on field '{}': {}",
            self.field, self.message
        )
    }
}

impl std::error::Error for ValidationError {}

// ============================================================================
// MultiError
// ============================================================================

/// Independent failures collected from a fan-out
#[derive(Debug, Default)]
pub struct MultiError {
    pub errors: Vec<AgentRuntimeError>,
}

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: AgentRuntimeError) {
        self.errors.push(err);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// `Ok(())` when nothing was collected
    pub fn into_result(self) -> Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(AgentRuntimeError::Multi(self))
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.as_slice() {
            [] => f.write_str("no errors"),
            [only] => write!(f, "{}", only),
            errors => write!(f, "multiple errors occurred ({} errors)", errors.len()),
        }
    }
}

impl std::error::Error for MultiError {}

// ============================================================================
// AgentRuntimeError
// ============================================================================

#[derive(Debug, Error)]
pub enum AgentRuntimeError {
    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("circular dependency: {0}")]
    CircularDependency(String),

    #[error("agent with ID {0} already exists")]
    DuplicateId(String),

    #[error("invalid agent state: {0}")]
    InvalidState(String),

    #[error("execution timeout after {0:?}")]
    Timeout(Duration),

    #[error("maximum retries exceeded after {attempts} attempts: {last}")]
    MaxRetriesExceeded {
        attempts: u32,
        last: Box<AgentRuntimeError>,
    },

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error(transparent)]
    Agent(Box<AgentError>),

    #[error(transparent)]
    Tool(ToolError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Multi(#[from] MultiError),

    #[error("event dispatch failed: {0}")]
    EventDispatch(String),

    #[error("state access failed: {0}")]
    StateAccess(String),

    #[error("state is read-only")]
    StateReadOnly,

    #[error("operation cancelled")]
    Cancelled,

    #[error("no states provided")]
    NoStatesProvided,

    #[error("unknown merge strategy: {0}")]
    UnknownMergeStrategy(String),

    #[error("transform {index} failed: {source}")]
    TransformFailed {
        index: usize,
        source: Box<AgentRuntimeError>,
    },

    #[error("provider error: {message}")]
    Provider { message: String, retryable: bool },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("task failed: {0}")]
    TaskFailed(String),

    #[error("{0}")]
    Other(String),
}

impl AgentRuntimeError {
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Non-retryable provider failure
    pub fn provider(msg: impl fmt::Display) -> Self {
        Self::Provider {
            message: msg.to_string(),
            retryable: false,
        }
    }

    /// Transient provider failure (rate limit, dropped connection)
    pub fn transient(msg: impl fmt::Display) -> Self {
        Self::Provider {
            message: msg.to_string(),
            retryable: true,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::AgentNotFound(_) => ErrorCode::AgentNotFound,
            Self::CircularDependency(_) => ErrorCode::CircularDependency,
            Self::DuplicateId(_) => ErrorCode::DuplicateId,
            Self::InvalidState(_) => ErrorCode::InvalidState,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::MaxRetriesExceeded { .. } => ErrorCode::MaxRetries,
            Self::ToolNotFound(_) => ErrorCode::ToolNotFound,
            Self::Agent(_) => ErrorCode::AgentFailure,
            Self::Tool(_) => ErrorCode::ToolExecution,
            Self::Validation(e) if e.field == "config" || e.field == "state_config" => {
                ErrorCode::InvalidConfig
            }
            Self::Validation(_) => ErrorCode::ValidationFailed,
            Self::Multi(_) => ErrorCode::MultipleErrors,
            Self::EventDispatch(_) => ErrorCode::EventDispatch,
            Self::StateAccess(_) => ErrorCode::StateAccess,
            Self::StateReadOnly => ErrorCode::StateReadOnly,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::NoStatesProvided => ErrorCode::NoStatesProvided,
            Self::UnknownMergeStrategy(_) => ErrorCode::UnknownMergeStrategy,
            Self::TransformFailed { .. } => ErrorCode::TransformFailed,
            Self::Provider { .. } => ErrorCode::Provider,
            Self::Serialization(_) | Self::TaskFailed(_) | Self::Other(_) => ErrorCode::Internal,
        }
    }

    /// The wrapped error one level down, if any
    pub fn cause(&self) -> Option<&AgentRuntimeError> {
        match self {
            Self::Agent(e) => e.source.as_deref(),
            Self::Tool(e) => e.source.as_deref(),
            Self::MaxRetriesExceeded { last, .. } => Some(last),
            Self::TransformFailed { source, .. } => Some(source),
            _ => None,
        }
    }

    /// True if this error or any error it wraps carries `code`
    pub fn has_code(&self, code: ErrorCode) -> bool {
        let mut current = Some(self);
        while let Some(err) = current {
            if err.code() == code {
                return true;
            }
            current = err.cause();
        }
        false
    }

    /// The agent error at the top of the chain, if this is one
    pub fn as_agent_error(&self) -> Option<&AgentError> {
        match self {
            Self::Agent(e) => Some(e),
            _ => None,
        }
    }
}

impl From<AgentError> for AgentRuntimeError {
    fn from(err: AgentError) -> Self {
        Self::Agent(Box::new(err))
    }
}

impl From<ToolError> for AgentRuntimeError {
    fn from(err: ToolError) -> Self {
        Self::Tool(err)
    }
}

impl From<anyhow::Error> for AgentRuntimeError {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(format!("{:#}", err))
    }
}

impl IsRetryable for AgentRuntimeError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Provider { retryable, .. } => *retryable,
            Self::Agent(e) => e.is_retryable(),
            Self::Tool(e) => e.is_retryable(),
            Self::Multi(m) => !m.is_empty() && m.errors.iter().all(|e| e.is_retryable()),
            _ => false,
        }
    }
}
