//! Agent and response-script files

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use cadre_core::provider::{ProviderOptions, ScriptedProvider};
use cadre_core::{AgentConfig, LlmAgentConfig};

/// Agent description loaded from TOML, or JSON when the extension is `.json`
#[derive(Debug, Clone, Deserialize)]
pub struct AgentFile {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default)]
    pub config: AgentConfig,
    #[serde(default)]
    pub provider_options: ProviderOptions,
}

fn default_max_iterations() -> usize {
    10
}

impl AgentFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read agent file {}", path.display()))?;

        let file: AgentFile = if is_json(path) {
            serde_json::from_str(&text)
                .with_context(|| format!("Invalid agent JSON in {}", path.display()))?
        } else {
            toml::from_str(&text)
                .with_context(|| format!("Invalid agent TOML in {}", path.display()))?
        };

        file.config
            .validate()
            .with_context(|| format!("Invalid [config] in {}", path.display()))?;
        Ok(file)
    }

    pub fn llm_config(&self) -> LlmAgentConfig {
        LlmAgentConfig {
            system_prompt: self.system_prompt.clone(),
            model: self.model.clone(),
            max_iterations: self.max_iterations,
            provider_options: self.provider_options.clone(),
        }
    }
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"))
}

/// Model replies to replay, either a bare list or `{replies, fallback}`
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ResponseScript {
    List(Vec<String>),
    Full {
        replies: Vec<String>,
        #[serde(default)]
        fallback: Option<String>,
    },
}

impl ResponseScript {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read response script {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Invalid response script {}", path.display()))
    }

    pub fn into_provider(self) -> ScriptedProvider {
        match self {
            Self::List(replies) => ScriptedProvider::new(replies),
            Self::Full { replies, fallback } => {
                let provider = ScriptedProvider::new(replies);
                match fallback {
                    Some(reply) => provider.with_fallback(reply),
                    None => provider,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadre_core::provider::Provider;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_temp(suffix: &str, content: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_toml_agent() {
        let file = write_temp(
            ".toml",
            r#"
name = "assistant"
description = "Helps out"
system_prompt = "Be brief."
model = "scripted"
max_iterations = 4

[config]
timeout_secs = 5
max_retries = 1
"#,
        );

        let agent = AgentFile::load(file.path()).unwrap();
        assert_eq!(agent.name, "assistant");
        assert_eq!(agent.max_iterations, 4);
        assert_eq!(agent.config.timeout_secs, 5);
        assert_eq!(agent.config.max_retries, 1);
        assert_eq!(agent.config.retry_delay_ms, 1000);

        let llm = agent.llm_config();
        assert_eq!(llm.system_prompt, "Be brief.");
        assert_eq!(llm.model.as_deref(), Some("scripted"));
    }

    #[test]
    fn test_load_json_agent_with_defaults() {
        let file = write_temp(".json", r#"{"name": "minimal"}"#);
        let agent = AgentFile::load(file.path()).unwrap();
        assert_eq!(agent.name, "minimal");
        assert_eq!(agent.max_iterations, 10);
        assert_eq!(agent.config.timeout_secs, 30);
    }

    #[test]
    fn test_rejects_conflicting_state_config() {
        let file = write_temp(
            ".toml",
            "name = \"x\"\n[config]\nshare_state = true\nisolate_state = true\n",
        );
        let err = AgentFile::load(file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("state_config"));
    }

    #[test]
    fn test_missing_file_has_context() {
        let err = AgentFile::load(Path::new("/nonexistent/agent.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read agent file"));
    }

    #[tokio::test]
    async fn test_response_script_shapes() {
        let list = write_temp(".json", r#"["one", "two"]"#);
        let provider = ResponseScript::load(list.path()).unwrap().into_provider();
        let opts = ProviderOptions::default();
        assert_eq!(provider.generate("a", &opts).await.unwrap(), "one");

        let full = write_temp(".json", r#"{"replies": [], "fallback": "again"}"#);
        let provider = ResponseScript::load(full.path()).unwrap().into_provider();
        assert_eq!(provider.generate("a", &opts).await.unwrap(), "again");
        assert_eq!(provider.generate("b", &opts).await.unwrap(), "again");
    }
}
