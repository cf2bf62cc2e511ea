//! Read-only state views
//!
//! Tools never receive a mutable `State`. They get a `StateReader`, either the
//! state itself or a `SharedStateContext` that layers local writes over a
//! parent view.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use super::{Artifact, Message, State};
use crate::error::{AgentRuntimeError, Result};

/// Read-only access to a state
pub trait StateReader: Send + Sync {
    fn state_id(&self) -> String;
    fn get(&self, key: &str) -> Option<Value>;
    fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }
    fn keys(&self) -> Vec<String>;
    fn values(&self) -> HashMap<String, Value>;
    fn messages(&self) -> Vec<Message>;
    fn artifacts(&self) -> Vec<Artifact>;
    fn get_artifact(&self, id: &str) -> Option<Artifact> {
        self.artifacts().into_iter().find(|a| a.id == id)
    }
    fn get_metadata(&self, key: &str) -> Option<Value>;
}

impl StateReader for State {
    fn state_id(&self) -> String {
        self.id().to_string()
    }

    fn get(&self, key: &str) -> Option<Value> {
        State::get(self, key).cloned()
    }

    fn has(&self, key: &str) -> bool {
        State::has(self, key)
    }

    fn keys(&self) -> Vec<String> {
        State::keys(self)
    }

    fn values(&self) -> HashMap<String, Value> {
        State::values(self).clone()
    }

    fn messages(&self) -> Vec<Message> {
        State::messages(self).to_vec()
    }

    fn artifacts(&self) -> Vec<Artifact> {
        State::artifacts(self).to_vec()
    }

    fn get_metadata(&self, key: &str) -> Option<Value> {
        State::get_metadata(self, key).cloned()
    }
}

/// Which parts of a parent state a child view sees
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InheritanceConfig {
    pub messages: bool,
    pub artifacts: bool,
    pub metadata: bool,
}

impl Default for InheritanceConfig {
    fn default() -> Self {
        Self {
            messages: true,
            artifacts: true,
            metadata: true,
        }
    }
}

/// Local state layered over a read-only parent.
///
/// Reads fall through to the parent when a key is not set locally. Writes
/// only touch the local layer; the parent is never modified.
pub struct SharedStateContext {
    parent: Arc<dyn StateReader>,
    local: State,
    inherit: InheritanceConfig,
}

impl SharedStateContext {
    pub fn new(parent: Arc<dyn StateReader>) -> Self {
        Self {
            parent,
            local: State::new(),
            inherit: InheritanceConfig::default(),
        }
    }

    pub fn with_inheritance(mut self, inherit: InheritanceConfig) -> Self {
        self.inherit = inherit;
        self
    }

    pub fn parent(&self) -> &Arc<dyn StateReader> {
        &self.parent
    }

    pub fn local(&self) -> &State {
        &self.local
    }

    pub fn local_mut(&mut self) -> &mut State {
        &mut self.local
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.local.set(key, value);
    }

    pub fn add_message(&mut self, message: Message) {
        self.local.add_message(message);
    }

    /// Materialize the combined view as an independent state
    pub fn as_state(&self) -> State {
        let mut state = State::new();
        let mut values = self.parent.values();
        for (k, v) in self.local.values() {
            values.insert(k.clone(), v.clone());
        }
        state.set_values(values);

        for message in StateReader::messages(self) {
            state.add_message(message);
        }
        for artifact in StateReader::artifacts(self) {
            state.add_artifact(artifact);
        }
        for (k, v) in self.local.metadata() {
            state.set_metadata(k.clone(), v.clone());
        }
        state
    }

    /// Shared views cannot write back into their parent
    pub fn merge_to_parent(&self) -> Result<()> {
        Err(AgentRuntimeError::StateReadOnly)
    }
}

impl StateReader for SharedStateContext {
    fn state_id(&self) -> String {
        self.local.id().to_string()
    }

    fn get(&self, key: &str) -> Option<Value> {
        self.local
            .get(key)
            .cloned()
            .or_else(|| self.parent.get(key))
    }

    fn keys(&self) -> Vec<String> {
        let mut keys = self.parent.keys();
        for key in self.local.keys() {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys.sort();
        keys
    }

    fn values(&self) -> HashMap<String, Value> {
        let mut values = self.parent.values();
        for (k, v) in self.local.values() {
            values.insert(k.clone(), v.clone());
        }
        values
    }

    fn messages(&self) -> Vec<Message> {
        let mut messages = if self.inherit.messages {
            self.parent.messages()
        } else {
            Vec::new()
        };
        messages.extend(self.local.messages().iter().cloned());
        messages
    }

    fn artifacts(&self) -> Vec<Artifact> {
        let mut artifacts = if self.inherit.artifacts {
            self.parent.artifacts()
        } else {
            Vec::new()
        };
        artifacts.extend(self.local.artifacts().iter().cloned());
        artifacts
    }

    fn get_metadata(&self, key: &str) -> Option<Value> {
        if let Some(value) = self.local.get_metadata(key) {
            return Some(value.clone());
        }
        if self.inherit.metadata {
            self.parent.get_metadata(key)
        } else {
            None
        }
    }
}
