//! Strategies for combining several states into one

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use super::State;
use crate::error::{AgentRuntimeError, Result};

/// How `merge_states` combines its inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MergeStrategy {
    /// Clone of the final state, earlier ones ignored
    Last,
    /// Fold every state in order, later keys override earlier ones
    MergeAll,
    /// Collect every distinct value per key, collapsing to a scalar when all agree
    Union,
}

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Last => "last",
            Self::MergeAll => "merge_all",
            Self::Union => "union",
        }
    }
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MergeStrategy {
    type Err = AgentRuntimeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "last" => Ok(Self::Last),
            "merge_all" => Ok(Self::MergeAll),
            "union" => Ok(Self::Union),
            other => Err(AgentRuntimeError::UnknownMergeStrategy(other.to_string())),
        }
    }
}

/// Combine `states` with `strategy`. Fails on an empty input.
pub fn merge_states(states: &[State], strategy: MergeStrategy) -> Result<State> {
    let Some(last) = states.last() else {
        return Err(AgentRuntimeError::NoStatesProvided);
    };

    match strategy {
        MergeStrategy::Last => Ok(last.fork()),
        MergeStrategy::MergeAll => Ok(merge_all(states)),
        MergeStrategy::Union => Ok(union(states)),
    }
}

fn merge_all(states: &[State]) -> State {
    let mut merged = State::new();
    for state in states {
        merged.merge_from(state);
    }
    merged
}

fn union(states: &[State]) -> State {
    let mut merged = State::new();

    // Key order of first appearance keeps the output deterministic
    let mut key_order: Vec<&String> = Vec::new();
    let mut seen: HashMap<&String, Vec<&Value>> = HashMap::new();

    for state in states {
        let mut keys: Vec<&String> = state.values().keys().collect();
        keys.sort();
        for key in keys {
            let Some(value) = state.values().get(key) else {
                continue;
            };
            let distinct = seen.entry(key).or_insert_with(|| {
                key_order.push(key);
                Vec::new()
            });
            if !distinct.iter().any(|v| *v == value) {
                distinct.push(value);
            }
        }
    }

    let mut values = HashMap::with_capacity(key_order.len());
    for key in key_order {
        let distinct = seen.remove(key).unwrap_or_default();
        let merged_value = match distinct.as_slice() {
            [single] => (*single).clone(),
            many => Value::Array(many.iter().map(|v| (*v).clone()).collect()),
        };
        values.insert(key.clone(), merged_value);
    }
    merged.set_values(values);

    for state in states {
        for artifact in state.artifacts() {
            merged.add_artifact(artifact.clone());
        }
        for message in state.messages() {
            merged.add_message(message.clone());
        }
        for (k, v) in state.metadata() {
            merged.set_metadata(k.clone(), v.clone());
        }
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::state::Message;
    use serde_json::json;

    fn state_with(pairs: &[(&str, Value)]) -> State {
        State::from_values(pairs.iter().map(|(k, v)| (k.to_string(), v.clone())))
    }

    #[test]
    fn test_empty_input_fails() {
        let err = merge_states(&[], MergeStrategy::MergeAll).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoStatesProvided);
    }

    #[test]
    fn test_unknown_strategy_name_fails() {
        let err = "pick_best".parse::<MergeStrategy>().unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnknownMergeStrategy);
        assert_eq!("union".parse::<MergeStrategy>().unwrap(), MergeStrategy::Union);
    }

    #[test]
    fn test_last_returns_final_state_content() {
        let first = state_with(&[("a", json!(1))]);
        let second = state_with(&[("b", json!(2))]);
        let merged = merge_states(&[first, second.clone()], MergeStrategy::Last).unwrap();
        assert!(merged.content_eq(&second));
        assert!(!merged.has("a"));
    }

    #[test]
    fn test_merge_all_single_state_equals_clone() {
        let mut s1 = state_with(&[("a", json!({"x": 1})), ("b", json!([1, 2]))]);
        s1.add_message(Message::user("hi"));
        s1.set_metadata("m", true);

        let merged = merge_states(std::slice::from_ref(&s1), MergeStrategy::MergeAll).unwrap();
        assert!(merged.content_eq(&s1.clone()));
    }

    #[test]
    fn test_merge_all_is_deterministic_and_ordered() {
        let mut s1 = state_with(&[("a", json!(1)), ("b", json!(1))]);
        s1.add_message(Message::user("one"));
        let mut s2 = state_with(&[("b", json!(2))]);
        s2.add_message(Message::assistant("two"));

        let first = merge_states(&[s1.clone(), s2.clone()], MergeStrategy::MergeAll).unwrap();
        let second = merge_states(&[s1, s2], MergeStrategy::MergeAll).unwrap();

        assert!(first.content_eq(&second));
        assert_eq!(first.get("b"), Some(&json!(2)));
        let contents: Vec<&str> = first.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["one", "two"]);
    }

    #[test]
    fn test_union_collapses_identical_values() {
        let s1 = state_with(&[("key", json!("v"))]);
        let s2 = state_with(&[("key", json!("v"))]);
        let merged = merge_states(&[s1, s2], MergeStrategy::Union).unwrap();
        assert_eq!(merged.get("key"), Some(&json!("v")));
    }

    #[test]
    fn test_union_keeps_distinct_values_in_input_order() {
        let s1 = state_with(&[("key", json!({"n": 1}))]);
        let s2 = state_with(&[("key", json!("second"))]);
        let s3 = state_with(&[("key", json!({"n": 1})), ("other", json!(true))]);
        let merged = merge_states(&[s1, s2, s3], MergeStrategy::Union).unwrap();

        assert_eq!(merged.get("key"), Some(&json!([{"n": 1}, "second"])));
        assert_eq!(merged.get("other"), Some(&json!(true)));
    }

    #[test]
    fn test_union_concatenates_messages() {
        let mut s1 = State::new();
        s1.add_message(Message::user("a"));
        let mut s2 = State::new();
        s2.add_message(Message::user("b"));

        let merged = merge_states(&[s1, s2], MergeStrategy::Union).unwrap();
        assert_eq!(merged.messages().len(), 2);
        assert_eq!(merged.messages()[1].content, "b");
    }
}
