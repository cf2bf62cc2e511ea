//! Agent identity and configuration types

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Result, ValidationError};
use crate::state::InheritanceConfig;

/// Stable opaque agent identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    Llm,
    Sequential,
    Parallel,
    Conditional,
    Loop,
    Custom,
}

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Llm => "llm",
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
            Self::Conditional => "conditional",
            Self::Loop => "loop",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only description of an agent, handed to tools
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: String,
    pub name: String,
    pub description: String,
    pub agent_type: AgentType,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// Execution settings shared by every agent kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Seconds before a run is abandoned; 0 disables the timeout
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub share_state: bool,
    pub isolate_state: bool,
    pub inherit: InheritanceConfig,
    pub custom: HashMap<String, Value>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_retries: 3,
            retry_delay_ms: 1000,
            share_state: false,
            isolate_state: false,
            inherit: InheritanceConfig::default(),
            custom: HashMap::new(),
        }
    }
}

impl AgentConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_retry_delay_ms(mut self, ms: u64) -> Self {
        self.retry_delay_ms = ms;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.share_state && self.isolate_state {
            return Err(ValidationError::new(
                "state_config",
                "share_state and isolate_state are mutually exclusive",
            )
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use serde_json::json;

    #[test]
    fn test_config_defaults_and_partial_deserialize() {
        let config: AgentConfig = serde_json::from_value(json!({"max_retries": 5})).unwrap();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.retry_delay(), Duration::from_millis(1000));
        assert!(config.inherit.messages);
    }

    #[test]
    fn test_zero_timeout_disables() {
        assert_eq!(AgentConfig::default().with_timeout_secs(0).timeout(), None);
    }

    #[test]
    fn test_share_and_isolate_conflict() {
        let config = AgentConfig {
            share_state: true,
            isolate_state: true,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidConfig);
    }

    #[test]
    fn test_agent_type_serde() {
        assert_eq!(serde_json::to_value(AgentType::Llm).unwrap(), json!("llm"));
        let id = AgentId::from("fixed");
        assert_eq!(serde_json::to_value(&id).unwrap(), json!("fixed"));
    }
}
