//! Composable state transforms
//!
//! Every transform takes `&State` and returns a new, forked `State`; the input
//! is never modified. Parts of the state a transform does not target are
//! carried over unchanged, except for the explicitly destructive
//! `clear_messages`.
//!
//! ## Keys and values
//! - `filter_keys` (glob), `select_keys`, `rename_keys`, `prefix_keys`, `normalize_keys`
//! - `map_values`, `transform_values`, `flatten`
//!
//! ## Messages
//! - `filter_messages_by_role`, `limit_messages`, `clear_messages`
//!
//! ## Combinators
//! - `chain` (short-circuits on the first error), `conditional`, `merge_with`

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::{Role, State};
use crate::error::{AgentRuntimeError, Result, ValidationError};

/// A pure function from one state to the next
pub type StateTransform = Arc<dyn Fn(&State) -> Result<State> + Send + Sync>;

/// Per-value function used by `transform_values`
pub type ValueTransform = Arc<dyn Fn(&Value) -> Result<Value> + Send + Sync>;

/// Wrap a closure as a `StateTransform`
pub fn from_fn<F>(f: F) -> StateTransform
where
    F: Fn(&State) -> Result<State> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Returns a fork of the input
pub fn identity() -> StateTransform {
    from_fn(|state: &State| Ok(state.fork()))
}

// ============================================================================
// Keys and values
// ============================================================================

/// Remove every key matching the glob `pattern`
pub fn filter_keys(pattern: &str) -> Result<StateTransform> {
    let pattern = glob::Pattern::new(pattern).map_err(|e| {
        AgentRuntimeError::from(
            ValidationError::new("pattern", format!("invalid glob pattern: {}", e))
                .with_value(pattern),
        )
    })?;

    Ok(from_fn(move |state: &State| {
        let mut result = state.fork();
        let values = state
            .values()
            .iter()
            .filter(|(k, _)| !pattern.matches(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        result.set_values(values);
        Ok(result)
    }))
}

/// Keep only the listed keys
pub fn select_keys<I, S>(keys: I) -> StateTransform
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let keep: HashSet<String> = keys.into_iter().map(Into::into).collect();
    from_fn(move |state: &State| {
        let mut result = state.fork();
        let values = state
            .values()
            .iter()
            .filter(|(k, _)| keep.contains(*k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        result.set_values(values);
        Ok(result)
    })
}

/// Rename keys by `old -> new`; unmapped keys are left alone
pub fn rename_keys<I, S>(mapping: I) -> StateTransform
where
    I: IntoIterator<Item = (S, S)>,
    S: Into<String>,
{
    let mapping: HashMap<String, String> = mapping
        .into_iter()
        .map(|(from, to)| (from.into(), to.into()))
        .collect();
    from_fn(move |state: &State| {
        let mut result = state.fork();
        let values = state
            .values()
            .iter()
            .map(|(k, v)| {
                let key = mapping.get(k).cloned().unwrap_or_else(|| k.clone());
                (key, v.clone())
            })
            .collect();
        result.set_values(values);
        Ok(result)
    })
}

/// Prepend `prefix` to every key
pub fn prefix_keys(prefix: impl Into<String>) -> StateTransform {
    let prefix = prefix.into();
    from_fn(move |state: &State| {
        let mut result = state.fork();
        let values = state
            .values()
            .iter()
            .map(|(k, v)| (format!("{}{}", prefix, k), v.clone()))
            .collect();
        result.set_values(values);
        Ok(result)
    })
}

/// Lowercase keys, replacing spaces and hyphens with underscores
pub fn normalize_keys() -> StateTransform {
    from_fn(|state: &State| {
        let mut result = state.fork();
        let values = state
            .values()
            .iter()
            .map(|(k, v)| (normalize_key(k), v.clone()))
            .collect();
        result.set_values(values);
        Ok(result)
    })
}

pub(crate) fn normalize_key(key: &str) -> String {
    key.to_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .collect()
}

/// Apply `f(key, value)` to every value
pub fn map_values<F>(f: F) -> StateTransform
where
    F: Fn(&str, &Value) -> Value + Send + Sync + 'static,
{
    from_fn(move |state: &State| {
        let mut result = state.fork();
        let values = state
            .values()
            .iter()
            .map(|(k, v)| (k.clone(), f(k, v)))
            .collect();
        result.set_values(values);
        Ok(result)
    })
}

/// Apply a specific function to specific keys; missing keys are skipped
pub fn transform_values(transforms: HashMap<String, ValueTransform>) -> StateTransform {
    from_fn(move |state: &State| {
        let mut result = state.fork();
        for (key, transform) in &transforms {
            if let Some(value) = state.get(key) {
                result.set(key.clone(), transform(value)?);
            }
        }
        Ok(result)
    })
}

/// Flatten nested objects into `a<sep>b` keys and arrays into `a[i]` keys
pub fn flatten(separator: impl Into<String>) -> StateTransform {
    let separator = separator.into();
    from_fn(move |state: &State| {
        let mut result = state.fork();
        let mut values = HashMap::new();
        for (key, value) in state.values() {
            flatten_into(&mut values, key, value, &separator);
        }
        result.set_values(values);
        Ok(result)
    })
}

/// Recursive helper for `flatten`. Empty containers are kept as leaves.
pub(crate) fn flatten_into(
    out: &mut HashMap<String, Value>,
    prefix: &str,
    value: &Value,
    separator: &str,
) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (k, v) in map {
                let key = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{}{}{}", prefix, separator, k)
                };
                flatten_into(out, &key, v, separator);
            }
        }
        Value::Array(items) if !items.is_empty() => {
            for (i, v) in items.iter().enumerate() {
                flatten_into(out, &format!("{}[{}]", prefix, i), v, separator);
            }
        }
        _ => {
            out.insert(prefix.to_string(), value.clone());
        }
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Drop all messages (destructive)
pub fn clear_messages() -> StateTransform {
    from_fn(|state: &State| {
        let mut result = state.fork();
        result.set_messages(Vec::new());
        Ok(result)
    })
}

/// Keep the last `n` messages
pub fn limit_messages(n: usize) -> StateTransform {
    from_fn(move |state: &State| {
        let mut result = state.fork();
        let messages = state.messages();
        let start = messages.len().saturating_sub(n);
        result.set_messages(messages[start..].to_vec());
        Ok(result)
    })
}

/// Keep only messages whose role is listed
pub fn filter_messages_by_role(roles: &[Role]) -> StateTransform {
    let roles: Vec<Role> = roles.to_vec();
    from_fn(move |state: &State| {
        let mut result = state.fork();
        let messages = state
            .messages()
            .iter()
            .filter(|m| roles.contains(&m.role))
            .cloned()
            .collect();
        result.set_messages(messages);
        Ok(result)
    })
}

// ============================================================================
// Combinators
// ============================================================================

/// Fold `other` into the input (values override, messages append)
pub fn merge_with(other: State) -> StateTransform {
    from_fn(move |state: &State| {
        let mut result = state.fork();
        result.merge_from(&other);
        Ok(result)
    })
}

/// Run `then` when `condition` holds, otherwise `otherwise` (or pass through)
pub fn conditional<F>(
    condition: F,
    then: StateTransform,
    otherwise: Option<StateTransform>,
) -> StateTransform
where
    F: Fn(&State) -> bool + Send + Sync + 'static,
{
    from_fn(move |state: &State| {
        if condition(state) {
            then(state)
        } else if let Some(otherwise) = &otherwise {
            otherwise(state)
        } else {
            Ok(state.fork())
        }
    })
}

/// Thread the output of each transform into the next, stopping at the first error
pub fn chain(transforms: Vec<StateTransform>) -> StateTransform {
    from_fn(move |state: &State| {
        let mut current = state.fork();
        for (index, transform) in transforms.iter().enumerate() {
            current = transform(&current).map_err(|e| AgentRuntimeError::TransformFailed {
                index,
                source: Box::new(e),
            })?;
        }
        Ok(current)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::state::Message;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample() -> State {
        let mut state = State::from_values([
            ("user_name", json!("ada")),
            ("user_email", json!("ada@example.com")),
            ("Session Id", json!(7)),
            ("debug-flag", json!(true)),
        ]);
        state.add_message(Message::system("sys"));
        state.add_message(Message::user("one"));
        state.add_message(Message::assistant("two"));
        state.add_message(Message::user("three"));
        state.set_metadata("origin", "test");
        state
    }

    #[test]
    fn test_filter_keys_removes_glob_matches_only() {
        let input = sample();
        let output = filter_keys("user_*").unwrap()(&input).unwrap();

        assert!(!output.has("user_name"));
        assert!(!output.has("user_email"));
        assert!(output.has("Session Id"));
        // untouched parts carried over
        assert_eq!(output.messages().len(), 4);
        assert_eq!(output.get_metadata("origin"), Some(&json!("test")));
        // input not modified
        assert!(input.has("user_name"));
    }

    #[test]
    fn test_filter_keys_rejects_bad_pattern() {
        assert!(filter_keys("[").is_err());
    }

    #[test]
    fn test_select_rename_prefix() {
        let input = sample();
        let selected = select_keys(["user_name"])(&input).unwrap();
        assert_eq!(selected.keys(), vec!["user_name"]);

        let renamed = rename_keys([("user_name", "name")])(&input).unwrap();
        assert_eq!(renamed.get_str("name"), Some("ada"));
        assert!(!renamed.has("user_name"));
        assert!(renamed.has("user_email"));

        let prefixed = prefix_keys("ctx.")(&selected).unwrap();
        assert_eq!(prefixed.keys(), vec!["ctx.user_name"]);
    }

    #[test]
    fn test_normalize_keys() {
        let output = normalize_keys()(&sample()).unwrap();
        assert!(output.has("session_id"));
        assert!(output.has("debug_flag"));
    }

    #[test]
    fn test_map_and_transform_values() {
        let input = State::from_values([("a", json!(1)), ("b", json!(2))]);
        let doubled = map_values(|_, v| json!(v.as_i64().unwrap_or(0) * 2))(&input).unwrap();
        assert_eq!(doubled.get("b"), Some(&json!(4)));

        let mut per_key: HashMap<String, ValueTransform> = HashMap::new();
        per_key.insert(
            "a".into(),
            Arc::new(|v: &Value| -> Result<Value> { Ok(json!(format!("#{}", v))) }),
        );
        per_key.insert("missing".into(), Arc::new(|_: &Value| -> Result<Value> { Ok(json!(0)) }));
        let output = transform_values(per_key)(&input).unwrap();
        assert_eq!(output.get("a"), Some(&json!("#1")));
        assert_eq!(output.get("b"), Some(&json!(2)));
        assert!(!output.has("missing"));
    }

    #[test]
    fn test_flatten_objects_and_arrays() {
        let input = State::from_values([(
            "config",
            json!({"db": {"host": "localhost", "ports": [5432, 5433]}, "empty": {}}),
        )]);
        let output = flatten(".")(&input).unwrap();

        assert_eq!(output.get("config.db.host"), Some(&json!("localhost")));
        assert_eq!(output.get("config.db.ports[0]"), Some(&json!(5432)));
        assert_eq!(output.get("config.db.ports[1]"), Some(&json!(5433)));
        assert_eq!(output.get("config.empty"), Some(&json!({})));
        assert!(!output.has("config"));
    }

    #[test]
    fn test_message_transforms() {
        let input = sample();

        let limited = limit_messages(2)(&input).unwrap();
        let contents: Vec<&str> = limited.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["two", "three"]);

        let users = filter_messages_by_role(&[Role::User])(&input).unwrap();
        assert_eq!(users.messages().len(), 2);

        let cleared = clear_messages()(&input).unwrap();
        assert!(cleared.messages().is_empty());
        assert_eq!(cleared.values().len(), input.values().len());
        assert_eq!(input.messages().len(), 4);
    }

    #[test]
    fn test_chain_short_circuits_with_index() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let failing = from_fn(|_| Err(AgentRuntimeError::other("nope")));
        let counting = from_fn(move |s| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(s.fork())
        });

        let err = chain(vec![identity(), failing, counting])(&sample()).unwrap_err();
        assert!(matches!(err, AgentRuntimeError::TransformFailed { index: 1, .. }));
        assert_eq!(err.code(), ErrorCode::TransformFailed);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_chain_threads_outputs() {
        let t = chain(vec![
            select_keys(["user_name"]),
            rename_keys([("user_name", "name")]),
            prefix_keys("p_"),
        ]);
        let output = t(&sample()).unwrap();
        assert_eq!(output.keys(), vec!["p_name"]);
    }

    #[test]
    fn test_conditional_branches() {
        let t = conditional(
            |s| s.has("user_name"),
            select_keys(["user_name"]),
            Some(clear_messages()),
        );
        assert_eq!(t(&sample()).unwrap().keys(), vec!["user_name"]);

        let other = State::from_values([("x", json!(1))]);
        assert_eq!(t(&other).unwrap().keys(), vec!["x"]);

        let passthrough = conditional(|_| false, clear_messages(), None);
        assert_eq!(passthrough(&sample()).unwrap().messages().len(), 4);
    }

    #[test]
    fn test_merge_with() {
        let extra = State::from_values([("user_name", json!("grace")), ("new", json!(1))]);
        let output = merge_with(extra)(&sample()).unwrap();
        assert_eq!(output.get_str("user_name"), Some("grace"));
        assert!(output.has("new"));
        assert!(output.has("user_email"));
    }
}
