//! Working memory passed between agents
//!
//! ## Data
//! - `State` - key/value map, ordered message log, artifact list, metadata
//! - `Message` / `Role` - conversation entries
//! - `Artifact` / `ArtifactType` - named blobs carried alongside values
//!
//! ## Views
//! - `StateReader` - read-only access handed to tools
//! - `SharedStateContext` - local state layered over a parent reader
//!
//! ## Algebra
//! - `transforms` - composable `&State -> Result<State>` functions
//! - `merge` - `Last` / `MergeAll` / `Union` strategies
//! - `utils` - message and metadata helpers
//! - `manager` - saved states, named transforms and validators

pub mod artifact;
pub mod manager;
pub mod merge;
pub mod message;
pub mod reader;
pub mod transforms;
pub mod utils;

pub use artifact::{Artifact, ArtifactType};
pub use manager::StateManager;
pub use merge::{merge_states, MergeStrategy};
pub use message::{Message, Role};
pub use reader::{InheritanceConfig, SharedStateContext, StateReader};
pub use transforms::StateTransform;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Key/value working memory with a message log and artifacts.
///
/// `Clone` produces an exact copy (same id). `fork()` produces a copy with a
/// fresh identity whose `parent_id` points back at the source, which is what
/// transforms and merges return.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    id: String,
    created: DateTime<Utc>,
    modified: DateTime<Utc>,
    #[serde(default)]
    values: HashMap<String, Value>,
    #[serde(default)]
    artifacts: Vec<Artifact>,
    #[serde(default)]
    messages: Vec<Message>,
    #[serde(default)]
    metadata: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent_id: Option<String>,
    version: u64,
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created: now,
            modified: now,
            values: HashMap::new(),
            artifacts: Vec::new(),
            messages: Vec::new(),
            metadata: HashMap::new(),
            parent_id: None,
            version: 1,
        }
    }

    /// Build a state from key/value pairs
    pub fn from_values<K, V, I>(values: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut state = Self::new();
        for (k, v) in values {
            state.values.insert(k.into(), v.into());
        }
        state
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn modified(&self) -> DateTime<Utc> {
        self.modified
    }

    fn touch(&mut self) {
        self.version += 1;
        self.modified = Utc::now();
    }

    // =========================================================================
    // Values
    // =========================================================================

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// String value for `key`, if present and a string
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
        self.touch();
    }

    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn delete(&mut self, key: &str) -> Option<Value> {
        let removed = self.values.remove(key);
        if removed.is_some() {
            self.touch();
        }
        removed
    }

    /// All keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.values.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn values(&self) -> &HashMap<String, Value> {
        &self.values
    }

    /// Replace all values at once
    pub fn set_values(&mut self, values: HashMap<String, Value>) {
        self.values = values;
        self.touch();
    }

    // =========================================================================
    // Messages
    // =========================================================================

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn add_message(&mut self, message: Message) {
        self.messages.push(message);
        self.touch();
    }

    pub fn set_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.touch();
    }

    // =========================================================================
    // Artifacts
    // =========================================================================

    pub fn artifacts(&self) -> &[Artifact] {
        &self.artifacts
    }

    pub fn get_artifact(&self, id: &str) -> Option<&Artifact> {
        self.artifacts.iter().find(|a| a.id == id)
    }

    /// Add an artifact, replacing any existing artifact with the same id
    pub fn add_artifact(&mut self, artifact: Artifact) {
        match self.artifacts.iter_mut().find(|a| a.id == artifact.id) {
            Some(existing) => *existing = artifact,
            None => self.artifacts.push(artifact),
        }
        self.touch();
    }

    pub fn remove_artifact(&mut self, id: &str) -> Option<Artifact> {
        let idx = self.artifacts.iter().position(|a| a.id == id)?;
        let removed = self.artifacts.remove(idx);
        self.touch();
        Some(removed)
    }

    // =========================================================================
    // Metadata
    // =========================================================================

    pub fn metadata(&self) -> &HashMap<String, Value> {
        &self.metadata
    }

    pub fn get_metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.metadata.insert(key.into(), value.into());
        self.touch();
    }

    pub fn remove_metadata(&mut self, key: &str) -> Option<Value> {
        let removed = self.metadata.remove(key);
        if removed.is_some() {
            self.touch();
        }
        removed
    }

    pub fn set_all_metadata(&mut self, metadata: HashMap<String, Value>) {
        self.metadata = metadata;
        self.touch();
    }

    // =========================================================================
    // Identity and merging
    // =========================================================================

    /// Deep copy with a fresh id, `parent_id` set to this state's id, version reset
    pub fn fork(&self) -> State {
        let now = Utc::now();
        State {
            id: Uuid::new_v4().to_string(),
            created: now,
            modified: now,
            values: self.values.clone(),
            artifacts: self.artifacts.clone(),
            messages: self.messages.clone(),
            metadata: self.metadata.clone(),
            parent_id: Some(self.id.clone()),
            version: 1,
        }
    }

    /// Fold `other` into this state.
    ///
    /// Values and metadata from `other` override existing keys, artifacts are
    /// replaced by id or appended, messages are appended in order.
    pub fn merge_from(&mut self, other: &State) {
        for (k, v) in &other.values {
            self.values.insert(k.clone(), v.clone());
        }
        for artifact in &other.artifacts {
            match self.artifacts.iter_mut().find(|a| a.id == artifact.id) {
                Some(existing) => *existing = artifact.clone(),
                None => self.artifacts.push(artifact.clone()),
            }
        }
        self.messages.extend(other.messages.iter().cloned());
        for (k, v) in &other.metadata {
            self.metadata.insert(k.clone(), v.clone());
        }
        self.touch();
    }

    /// Structural equality of content, ignoring identity, version and timestamps
    pub fn content_eq(&self, other: &State) -> bool {
        self.values == other.values
            && self.messages == other.messages
            && self.artifacts == other.artifacts
            && self.metadata == other.metadata
    }

    /// Serialized size in bytes of the full state
    pub fn size_bytes(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }
}
