//! Handing a run over to another registered agent

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use super::AgentRegistry;
use crate::error::{AgentError, Phase, Result};
use crate::state::{Message, State};

pub type InputFilter = Arc<dyn Fn(&State) -> State + Send + Sync>;
pub type MessageFilter = Arc<dyn Fn(&[Message]) -> Vec<Message> + Send + Sync>;

/// Route a state to the agent named `target`, optionally reshaping it first.
///
/// The target is looked up by name in the registry given to `execute`.
#[derive(Clone)]
pub struct Handoff {
    name: String,
    target: String,
    description: String,
    input_filter: Option<InputFilter>,
    message_filter: Option<MessageFilter>,
}

impl Handoff {
    pub fn new(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            description: String::new(),
            input_filter: None,
            message_filter: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Replaces the default input handling, which forks the state
    pub fn with_input_filter<F>(mut self, f: F) -> Self
    where
        F: Fn(&State) -> State + Send + Sync + 'static,
    {
        self.input_filter = Some(Arc::new(f));
        self
    }

    /// Applied to the messages after the input filter
    pub fn with_message_filter<F>(mut self, f: F) -> Self
    where
        F: Fn(&[Message]) -> Vec<Message> + Send + Sync + 'static,
    {
        self.message_filter = Some(Arc::new(f));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// The state the target agent will receive
    pub fn transform_input(&self, state: &State) -> State {
        let mut next = match &self.input_filter {
            Some(filter) => filter(state),
            None => state.fork(),
        };
        if let Some(filter) = &self.message_filter {
            let messages = filter(next.messages());
            next.set_messages(messages);
        }
        next
    }

    pub async fn execute(&self, registry: &AgentRegistry, state: &State) -> Result<State> {
        let input = self.transform_input(state);
        let agent = registry.get_by_name(&self.target)?;

        tracing::info!(handoff = %self.name, target = %self.target, "Handing off");
        agent.run(input).await.map_err(|e| {
            AgentError::new(
                agent.id().as_str(),
                agent.name(),
                Phase::Execution,
                format!("handoff to agent '{}' failed", self.target),
            )
            .with_source(e)
            .into()
        })
    }

    // ------------------------------------------------------------------------
    // Presets
    // ------------------------------------------------------------------------

    /// Forks the whole state
    pub fn simple(name: impl Into<String>, target: impl Into<String>) -> Self {
        let target = target.into();
        let description = format!("Simple handoff to {}", target);
        Self::new(name, target).with_description(description)
    }

    /// Passes only the listed value keys, without messages
    pub fn filtered<I, S>(name: impl Into<String>, target: impl Into<String>, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let target = target.into();
        let description = format!("Filtered handoff to {}", target);
        let keep: HashSet<String> = keys.into_iter().map(Into::into).collect();
        Self::new(name, target)
            .with_description(description)
            .with_input_filter(move |state| {
                let mut next = State::new();
                for (key, value) in state.values() {
                    if keep.contains(key) {
                        next.set(key.clone(), value.clone());
                    }
                }
                next
            })
    }

    /// Passes the conversation and nothing else
    pub fn messages_only(name: impl Into<String>, target: impl Into<String>) -> Self {
        let target = target.into();
        let description = format!("Messages-only handoff to {}", target);
        Self::new(name, target)
            .with_description(description)
            .with_input_filter(|state| {
                let mut next = State::new();
                next.set_messages(state.messages().to_vec());
                next
            })
    }

    /// Keeps values but only the last `n` messages
    pub fn last_n_messages(name: impl Into<String>, target: impl Into<String>, n: usize) -> Self {
        let target = target.into();
        let description = format!("Last {} messages handoff to {}", n, target);
        Self::new(name, target)
            .with_description(description)
            .with_message_filter(move |messages| {
                messages[messages.len().saturating_sub(n)..].to_vec()
            })
    }
}

impl fmt::Debug for Handoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handoff")
            .field("name", &self.name)
            .field("target", &self.target)
            .field("description", &self.description)
            .finish()
    }
}
