//! Index of live agents by id, type and parent
//!
//! Agents take a registry by injection (`LlmAgent::with_registry`, handoffs).
//! `AgentRegistry::global()` exists for application code that wants a single
//! process-wide instance.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::{Agent, AgentId, AgentType};
use crate::error::{AgentRuntimeError, Result};

static GLOBAL_REGISTRY: Lazy<Arc<AgentRegistry>> = Lazy::new(|| Arc::new(AgentRegistry::new()));

#[derive(Default)]
struct Indexes {
    agents: HashMap<AgentId, Arc<dyn Agent>>,
    by_type: HashMap<AgentType, HashMap<AgentId, Arc<dyn Agent>>>,
    children: HashMap<AgentId, Vec<AgentId>>,
}

impl Indexes {
    /// Insert `agent` and, recursively, any sub-agents not yet present
    fn insert(&mut self, agent: Arc<dyn Agent>) {
        let id = agent.id().clone();
        self.by_type
            .entry(agent.agent_type())
            .or_default()
            .insert(id.clone(), agent.clone());
        self.agents.insert(id.clone(), agent.clone());

        for child in agent.sub_agents() {
            if self.agents.contains_key(child.id()) {
                continue;
            }
            let child_id = child.id().clone();
            self.insert(child);
            self.children.entry(id.clone()).or_default().push(child_id);
        }
    }

    /// Remove `id` and its recorded descendants, returning every removed id
    fn remove(&mut self, id: &AgentId, removed: &mut HashSet<AgentId>) {
        let Some(agent) = self.agents.remove(id) else {
            return;
        };
        removed.insert(id.clone());

        let agent_type = agent.agent_type();
        if let Some(of_type) = self.by_type.get_mut(&agent_type) {
            of_type.remove(id);
            if of_type.is_empty() {
                self.by_type.remove(&agent_type);
            }
        }

        if let Some(child_ids) = self.children.remove(id) {
            for child_id in child_ids {
                self.remove(&child_id, removed);
            }
        }
    }
}

#[derive(Default)]
pub struct AgentRegistry {
    inner: RwLock<Indexes>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry for application code
    pub fn global() -> Arc<AgentRegistry> {
        GLOBAL_REGISTRY.clone()
    }

    /// Register `agent` and its sub-agents. Sub-agents that are already
    /// registered are skipped; the agent itself must be new.
    pub fn register(&self, agent: Arc<dyn Agent>) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.agents.contains_key(agent.id()) {
            return Err(AgentRuntimeError::DuplicateId(agent.id().to_string()));
        }
        tracing::debug!(agent = %agent.name(), id = %agent.id(), "Registering agent");
        inner.insert(agent);
        Ok(())
    }

    /// Remove an agent and everything registered beneath it
    pub fn unregister(&self, id: &AgentId) -> Result<()> {
        let mut inner = self.inner.write();
        if !inner.agents.contains_key(id) {
            return Err(AgentRuntimeError::AgentNotFound(id.to_string()));
        }

        let mut removed = HashSet::new();
        inner.remove(id, &mut removed);

        inner.children.retain(|_, child_ids| {
            child_ids.retain(|c| !removed.contains(c));
            !child_ids.is_empty()
        });

        tracing::debug!(id = %id, removed = removed.len(), "Unregistered agent");
        Ok(())
    }

    pub fn get(&self, id: &AgentId) -> Result<Arc<dyn Agent>> {
        self.inner
            .read()
            .agents
            .get(id)
            .cloned()
            .ok_or_else(|| AgentRuntimeError::AgentNotFound(id.to_string()))
    }

    pub fn get_by_name(&self, name: &str) -> Result<Arc<dyn Agent>> {
        self.inner
            .read()
            .agents
            .values()
            .find(|a| a.name() == name)
            .cloned()
            .ok_or_else(|| AgentRuntimeError::AgentNotFound(name.to_string()))
    }

    pub fn get_by_type(&self, agent_type: &AgentType) -> Vec<Arc<dyn Agent>> {
        self.inner
            .read()
            .by_type
            .get(agent_type)
            .map(|of_type| of_type.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn list(&self) -> Vec<Arc<dyn Agent>> {
        self.inner.read().agents.values().cloned().collect()
    }

    /// Registered ids, sorted
    pub fn list_ids(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self.inner.read().agents.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn children(&self, id: &AgentId) -> Vec<Arc<dyn Agent>> {
        let inner = self.inner.read();
        inner
            .children
            .get(id)
            .map(|child_ids| {
                child_ids
                    .iter()
                    .filter_map(|c| inner.agents.get(c).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The registered agent that recorded `id` as its child
    pub fn parent(&self, id: &AgentId) -> Result<Arc<dyn Agent>> {
        let inner = self.inner.read();
        inner
            .children
            .iter()
            .find(|(_, child_ids)| child_ids.contains(id))
            .and_then(|(parent_id, _)| inner.agents.get(parent_id).cloned())
            .ok_or_else(|| AgentRuntimeError::AgentNotFound(format!("parent of {}", id)))
    }

    pub fn find_by_metadata(&self, key: &str, value: &Value) -> Vec<Arc<dyn Agent>> {
        self.inner
            .read()
            .agents
            .values()
            .filter(|a| a.metadata().get(key) == Some(value))
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        *self.inner.write() = Indexes::default();
    }

    pub fn len(&self) -> usize {
        self.inner.read().agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().agents.is_empty()
    }

    pub fn query(&self) -> AgentQuery<'_> {
        AgentQuery {
            registry: self,
            filters: Vec::new(),
        }
    }
}

type AgentPredicate<'a> = Box<dyn Fn(&Arc<dyn Agent>) -> bool + 'a>;

/// Conjunction of filters over the registered agents
pub struct AgentQuery<'a> {
    registry: &'a AgentRegistry,
    filters: Vec<AgentPredicate<'a>>,
}

impl<'a> AgentQuery<'a> {
    pub fn with_type(mut self, agent_type: AgentType) -> Self {
        self.filters
            .push(Box::new(move |a: &Arc<dyn Agent>| a.agent_type() == agent_type));
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.filters.push(Box::new(move |a: &Arc<dyn Agent>| a.name() == name));
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        let key = key.into();
        self.filters
            .push(Box::new(move |a: &Arc<dyn Agent>| a.metadata().get(&key) == Some(&value)));
        self
    }

    /// Agents recorded in the registry as children of `parent`
    pub fn with_parent(mut self, parent: AgentId) -> Self {
        let children: HashSet<AgentId> = self
            .registry
            .children(&parent)
            .iter()
            .map(|c| c.id().clone())
            .collect();
        self.filters.push(Box::new(move |a: &Arc<dyn Agent>| children.contains(a.id())));
        self
    }

    pub fn execute(self) -> Vec<Arc<dyn Agent>> {
        self.registry
            .list()
            .into_iter()
            .filter(|a| self.filters.iter().all(|f| f(a)))
            .collect()
    }

    pub fn count(self) -> usize {
        self.execute().len()
    }
}
