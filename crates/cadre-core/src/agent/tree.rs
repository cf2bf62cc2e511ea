//! Parent links between agents, stored by id
//!
//! Agents own their children downward through `Arc`s. The upward link lives
//! here instead, as a child id -> parent id map, so the cycle check is a
//! plain walk over ids and no agent holds a reference to its parent.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use super::AgentId;
use crate::error::{AgentRuntimeError, Result};

static GLOBAL_TREE: Lazy<Arc<AgentTree>> = Lazy::new(|| Arc::new(AgentTree::new()));

#[derive(Debug, Default)]
pub struct AgentTree {
    parents: RwLock<HashMap<AgentId, AgentId>>,
}

impl AgentTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide tree, for callers that want every agent in one arena.
    /// Agents start on a tree of their own unless given this one.
    pub fn global() -> Arc<AgentTree> {
        GLOBAL_TREE.clone()
    }

    /// Link `child` under `parent`, replacing any previous parent.
    ///
    /// Fails without changing anything if `parent` is `child` or one of its
    /// descendants.
    pub fn attach(&self, child: &AgentId, parent: &AgentId) -> Result<()> {
        let mut parents = self.parents.write();

        let mut current = Some(parent);
        while let Some(id) = current {
            if id == child {
                return Err(AgentRuntimeError::CircularDependency(format!(
                    "agent {} is an ancestor of {}",
                    child, parent
                )));
            }
            current = parents.get(id);
        }

        parents.insert(child.clone(), parent.clone());
        Ok(())
    }

    /// Remove `child`'s parent link. Returns the previous parent.
    pub fn detach(&self, child: &AgentId) -> Option<AgentId> {
        self.parents.write().remove(child)
    }

    /// Remove every link pointing at `parent`. Returns the number removed.
    pub fn detach_children(&self, parent: &AgentId) -> usize {
        let mut parents = self.parents.write();
        let before = parents.len();
        parents.retain(|_, p| p != parent);
        before - parents.len()
    }

    pub fn parent(&self, child: &AgentId) -> Option<AgentId> {
        self.parents.read().get(child).cloned()
    }

    /// Ancestors from the direct parent up to the root
    pub fn ancestors(&self, id: &AgentId) -> Vec<AgentId> {
        let parents = self.parents.read();
        let mut chain = Vec::new();
        let mut current = parents.get(id);
        while let Some(parent) = current {
            if chain.contains(parent) {
                break;
            }
            chain.push(parent.clone());
            current = parents.get(parent);
        }
        chain
    }

    pub fn len(&self) -> usize {
        self.parents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.read().is_empty()
    }
}
