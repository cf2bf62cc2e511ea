//! Saved states, named transforms, validators and merge strategies

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use super::merge::{merge_states, MergeStrategy};
use super::transforms::{flatten_into, from_fn, StateTransform};
use super::State;
use crate::error::{AgentRuntimeError, Result, ValidationError};

/// Validates a state, returning the reason it is unacceptable
pub type StateValidator = Arc<dyn Fn(&State) -> Result<()> + Send + Sync>;

/// User-supplied merge strategy registered by name
pub type CustomMerge = Arc<dyn Fn(&[State]) -> Result<State> + Send + Sync>;

/// Keys whose values the `sanitize` transform redacts
static SENSITIVE_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)password|token|secret|api_key|key|credential").unwrap());

const REDACTED: &str = "[REDACTED]";

/// Point-in-time copy of several named states
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub timestamp: DateTime<Utc>,
    pub states: HashMap<String, State>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// Registry of saved states and the named operations that act on them.
///
/// Built-in transforms: `filter` (removes the keys listed in metadata
/// `filter_keys`), `flatten` (dot notation, `[i]` for arrays) and `sanitize`
/// (redacts values whose key looks like a credential).
pub struct StateManager {
    states: RwLock<HashMap<String, State>>,
    transforms: RwLock<HashMap<String, StateTransform>>,
    validators: RwLock<HashMap<String, StateValidator>>,
    merge_strategies: RwLock<HashMap<String, CustomMerge>>,
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StateManager {
    pub fn new() -> Self {
        let manager = Self {
            states: RwLock::new(HashMap::new()),
            transforms: RwLock::new(HashMap::new()),
            validators: RwLock::new(HashMap::new()),
            merge_strategies: RwLock::new(HashMap::new()),
        };
        manager.register_builtin_transforms();
        manager
    }

    // =========================================================================
    // Saved states
    // =========================================================================

    /// Store a copy of `state` under its id
    pub fn save_state(&self, state: &State) {
        self.states
            .write()
            .insert(state.id().to_string(), state.clone());
    }

    pub fn load_state(&self, id: &str) -> Result<State> {
        self.states
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| AgentRuntimeError::StateAccess(format!("state {} not found", id)))
    }

    pub fn delete_state(&self, id: &str) -> Result<()> {
        self.states
            .write()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| AgentRuntimeError::StateAccess(format!("state {} not found", id)))
    }

    /// Ids of all saved states, sorted
    pub fn list_states(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.states.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    // =========================================================================
    // Transforms and validators
    // =========================================================================

    pub fn register_transform(&self, name: impl Into<String>, transform: StateTransform) {
        self.transforms.write().insert(name.into(), transform);
    }

    pub fn apply_transform(&self, name: &str, state: &State) -> Result<State> {
        let transform = self.transforms.read().get(name).cloned().ok_or_else(|| {
            AgentRuntimeError::from(
                ValidationError::new("transform", "transform not registered").with_value(name),
            )
        })?;
        transform(state)
    }

    pub fn register_validator(&self, name: impl Into<String>, validator: StateValidator) {
        self.validators.write().insert(name.into(), validator);
    }

    pub fn validate_state(&self, state: &State, validator: &str) -> Result<()> {
        let validator = self.validators.read().get(validator).cloned().ok_or_else(|| {
            AgentRuntimeError::from(
                ValidationError::new("validator", "validator not registered").with_value(validator),
            )
        })?;
        validator(state)
    }

    // =========================================================================
    // Merging and snapshots
    // =========================================================================

    pub fn register_merge_strategy(&self, name: impl Into<String>, merge: CustomMerge) {
        self.merge_strategies.write().insert(name.into(), merge);
    }

    /// Merge by strategy name: `last`, `merge_all`, `union`, or a registered custom name
    pub fn merge_states(&self, states: &[State], strategy: &str) -> Result<State> {
        if let Ok(builtin) = strategy.parse::<MergeStrategy>() {
            return merge_states(states, builtin);
        }
        let custom = self
            .merge_strategies
            .read()
            .get(strategy)
            .cloned()
            .ok_or_else(|| AgentRuntimeError::UnknownMergeStrategy(strategy.to_string()))?;
        if states.is_empty() {
            return Err(AgentRuntimeError::NoStatesProvided);
        }
        custom(states)
    }

    pub fn create_snapshot(&self, states: &HashMap<String, State>) -> StateSnapshot {
        StateSnapshot {
            timestamp: Utc::now(),
            states: states
                .iter()
                .map(|(name, state)| (name.clone(), state.fork()))
                .collect(),
            metadata: HashMap::new(),
        }
    }

    fn register_builtin_transforms(&self) {
        self.register_transform(
            "filter",
            from_fn(|state: &State| {
                let mut result = state.fork();
                let keys = state
                    .get_metadata("filter_keys")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                for key in keys.iter().filter_map(Value::as_str) {
                    result.delete(key);
                }
                Ok(result)
            }),
        );

        self.register_transform(
            "flatten",
            from_fn(|state: &State| {
                let mut result = state.fork();
                let mut values = HashMap::new();
                for (key, value) in state.values() {
                    flatten_into(&mut values, key, value, ".");
                }
                result.set_values(values);
                Ok(result)
            }),
        );

        self.register_transform(
            "sanitize",
            from_fn(|state: &State| {
                let mut result = state.fork();
                let values = state
                    .values()
                    .iter()
                    .map(|(k, v)| {
                        if SENSITIVE_KEY.is_match(k) {
                            (k.clone(), Value::String(REDACTED.to_string()))
                        } else {
                            (k.clone(), v.clone())
                        }
                    })
                    .collect();
                result.set_values(values);
                Ok(result)
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use serde_json::json;

    #[test]
    fn test_save_load_delete() {
        let manager = StateManager::new();
        let mut state = State::new();
        state.set("a", 1);
        manager.save_state(&state);

        // stored copy is independent of the caller's state
        state.set("a", 2);
        let loaded = manager.load_state(state.id()).unwrap();
        assert_eq!(loaded.get("a"), Some(&json!(1)));
        assert_eq!(manager.list_states(), vec![state.id().to_string()]);

        manager.delete_state(state.id()).unwrap();
        let err = manager.load_state(state.id()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::StateAccess);
        assert!(manager.delete_state(state.id()).is_err());
    }

    #[test]
    fn test_builtin_filter_uses_metadata_keys() {
        let manager = StateManager::new();
        let mut state = State::from_values([("a", json!(1)), ("b", json!(2)), ("c", json!(3))]);
        state.set_metadata("filter_keys", json!(["a", "c"]));

        let filtered = manager.apply_transform("filter", &state).unwrap();
        assert_eq!(filtered.keys(), vec!["b"]);

        let untouched = manager
            .apply_transform("filter", &State::from_values([("a", json!(1))]))
            .unwrap();
        assert!(untouched.has("a"));
    }

    #[test]
    fn test_builtin_flatten_and_sanitize() {
        let manager = StateManager::new();
        let state = State::from_values([
            ("db", json!({"user": "app", "tags": ["x", "y"]})),
            ("API_KEY", json!("sk-123")),
            ("db_password", json!("hunter2")),
            ("greeting", json!("hello")),
        ]);

        let flat = manager.apply_transform("flatten", &state).unwrap();
        assert_eq!(flat.get("db.user"), Some(&json!("app")));
        assert_eq!(flat.get("db.tags[1]"), Some(&json!("y")));

        let clean = manager.apply_transform("sanitize", &state).unwrap();
        assert_eq!(clean.get_str("API_KEY"), Some("[REDACTED]"));
        assert_eq!(clean.get_str("db_password"), Some("[REDACTED]"));
        assert_eq!(clean.get_str("greeting"), Some("hello"));
    }

    #[test]
    fn test_unknown_transform_and_validator() {
        let manager = StateManager::new();
        assert!(manager.apply_transform("nope", &State::new()).is_err());
        assert!(manager.validate_state(&State::new(), "nope").is_err());

        manager.register_validator(
            "has_input",
            Arc::new(|s: &State| -> Result<()> {
                if s.has("input") {
                    Ok(())
                } else {
                    Err(ValidationError::new("input", "required").into())
                }
            }),
        );
        assert!(manager.validate_state(&State::new(), "has_input").is_err());
        let ok = State::from_values([("input", json!("x"))]);
        assert!(manager.validate_state(&ok, "has_input").is_ok());
    }

    #[test]
    fn test_merge_by_name_including_custom() {
        let manager = StateManager::new();
        let s1 = State::from_values([("a", json!(1))]);
        let s2 = State::from_values([("a", json!(2))]);

        let merged = manager
            .merge_states(&[s1.clone(), s2.clone()], "merge_all")
            .unwrap();
        assert_eq!(merged.get("a"), Some(&json!(2)));

        manager.register_merge_strategy(
            "first",
            Arc::new(|states: &[State]| -> Result<State> { Ok(states[0].fork()) }),
        );
        let first = manager.merge_states(&[s1, s2], "first").unwrap();
        assert_eq!(first.get("a"), Some(&json!(1)));

        let err = manager.merge_states(&[], "bogus").unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnknownMergeStrategy);
        let err = manager.merge_states(&[], "first").unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoStatesProvided);
    }

    #[test]
    fn test_snapshot_copies_states() {
        let manager = StateManager::new();
        let mut states = HashMap::new();
        states.insert("writer".to_string(), State::from_values([("draft", json!("v1"))]));

        let snapshot = manager.create_snapshot(&states);
        assert_eq!(snapshot.states["writer"].get_str("draft"), Some("v1"));
        assert_ne!(snapshot.states["writer"].id(), states["writer"].id());
    }
}
