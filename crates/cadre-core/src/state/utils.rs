//! Message and metadata helpers over `State`
//!
//! Like the transforms, these return a new state and leave the input alone.
//! `clear_metadata` is the only destructive one.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;

use super::{Message, Role, State};

// ── Messages ──────────────────────────────────────────────────────────

/// Keep messages matching `predicate`
pub fn filter_messages<F>(state: &State, predicate: F) -> State
where
    F: Fn(&Message) -> bool,
{
    clone_with_messages(
        state,
        state.messages().iter().filter(|m| predicate(m)).cloned().collect(),
    )
}

/// Rewrite every message with `f`
pub fn map_messages<F>(state: &State, f: F) -> State
where
    F: Fn(&Message) -> Message,
{
    clone_with_messages(state, state.messages().iter().map(f).collect())
}

/// Keep at most the last `max` messages
pub fn truncate_messages(state: &State, max: usize) -> State {
    let messages = state.messages();
    let start = messages.len().saturating_sub(max);
    clone_with_messages(state, messages[start..].to_vec())
}

/// Stable sort of messages with `compare`
pub fn sort_messages<F>(state: &State, compare: F) -> State
where
    F: FnMut(&Message, &Message) -> std::cmp::Ordering,
{
    let mut messages = state.messages().to_vec();
    messages.sort_by(compare);
    clone_with_messages(state, messages)
}

/// Fork of `state` with its message log replaced
pub fn clone_with_messages(state: &State, messages: Vec<Message>) -> State {
    let mut result = state.fork();
    result.set_messages(messages);
    result
}

pub fn group_messages_by_role(state: &State) -> HashMap<Role, Vec<Message>> {
    let mut groups: HashMap<Role, Vec<Message>> = HashMap::new();
    for message in state.messages() {
        groups.entry(message.role).or_default().push(message.clone());
    }
    groups
}

pub fn count_messages_by_role(state: &State) -> HashMap<Role, usize> {
    let mut counts = HashMap::new();
    for message in state.messages() {
        *counts.entry(message.role).or_insert(0) += 1;
    }
    counts
}

pub fn latest_message_by_role(state: &State, role: Role) -> Option<&Message> {
    state.messages().iter().rev().find(|m| m.role == role)
}

/// Messages strictly newer than `since`
pub fn messages_since(state: &State, since: DateTime<Utc>) -> Vec<Message> {
    state
        .messages()
        .iter()
        .filter(|m| m.timestamp > since)
        .cloned()
        .collect()
}

pub fn add_message_prefix(state: &State, prefix: &str) -> State {
    map_messages(state, |m| {
        let mut m = m.clone();
        m.content = format!("{}{}", prefix, m.content);
        m
    })
}

pub fn add_message_suffix(state: &State, suffix: &str) -> State {
    map_messages(state, |m| {
        let mut m = m.clone();
        m.content = format!("{}{}", m.content, suffix);
        m
    })
}

// ── Metadata ──────────────────────────────────────────────────────────

pub fn filter_metadata<F>(state: &State, predicate: F) -> State
where
    F: Fn(&str, &Value) -> bool,
{
    let mut result = state.fork();
    let metadata = state
        .metadata()
        .iter()
        .filter(|(k, v)| predicate(k, v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    result.set_all_metadata(metadata);
    result
}

pub fn map_metadata<F>(state: &State, f: F) -> State
where
    F: Fn(&str, &Value) -> Value,
{
    let mut result = state.fork();
    let metadata = state
        .metadata()
        .iter()
        .map(|(k, v)| (k.clone(), f(k, v)))
        .collect();
    result.set_all_metadata(metadata);
    result
}

/// Set every entry of `updates`, overriding existing keys
pub fn update_metadata(state: &State, updates: HashMap<String, Value>) -> State {
    let mut result = state.fork();
    for (k, v) in updates {
        result.set_metadata(k, v);
    }
    result
}

pub fn remove_metadata_keys(state: &State, keys: &[&str]) -> State {
    let mut result = state.fork();
    for key in keys {
        result.remove_metadata(key);
    }
    result
}

/// Drop all metadata (destructive)
pub fn clear_metadata(state: &State) -> State {
    let mut result = state.fork();
    result.set_all_metadata(HashMap::new());
    result
}

/// Record the current time under metadata `timestamp`
pub fn with_timestamp(state: &State) -> State {
    let mut result = state.fork();
    result.set_metadata("timestamp", Utc::now().to_rfc3339());
    result
}
