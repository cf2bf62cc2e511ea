//! Agent capability and the shared base every agent embeds
//!
//! ## Hierarchy
//! Children are owned through `Arc<dyn Agent>` in the parent's sub-agent
//! list. Parent links are ids stored in an `AgentTree`, so no agent refers
//! back to its parent and cycles are rejected before any mutation.
//!
//! Every agent starts on a tree of its own. Linking a child moves the
//! child's whole subtree onto the parent's tree, so connected agents always
//! share one tree and the cycle check sees every link.
//!
//! ## Execution helpers
//! - `execute_with_retry` - linear backoff, stops on non-retryable errors
//! - `execute_with_timeout` - runs the work as its own task and cancels its
//!   token when the deadline fires

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use super::{AgentConfig, AgentId, AgentInfo, AgentTree, AgentType};
use crate::error::{
    AgentError, AgentRuntimeError, IsRetryable, MultiError, Phase, Result, ValidationError,
};
use crate::events::{
    DispatcherConfig, Event, EventDispatcher, EventFilter, EventHandler, EventType,
    SubscriptionId,
};
use crate::metrics::{self, counters, MetricsSink};
use crate::state::State;

/// Capacity of the channel returned by `run_async`
pub const RUN_ASYNC_BUFFER: usize = 100;

/// Serializes links that may move agents between trees
static TREE_LINKS: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Shared handle to an agent's children
pub type SubAgents = Arc<RwLock<Vec<Arc<dyn Agent>>>>;

/// A runnable node in the agent hierarchy
#[async_trait]
pub trait Agent: Send + Sync {
    /// The embedded base holding identity, hierarchy and configuration
    fn base(&self) -> &BaseAgent;

    /// Execute against `state`, returning a new state
    async fn run(&self, state: State) -> Result<State>;

    /// Like `run`, but gives up once `cancel` fires with an error naming
    /// this agent and wrapping `Cancelled`.
    /// Agents with long internal loops override this to check the token themselves.
    async fn run_with_cancel(&self, state: State, cancel: CancellationToken) -> Result<State> {
        tokio::select! {
            result = self.run(state) => result,
            _ = cancel.cancelled() => Err(self.base().cancelled()),
        }
    }

    fn id(&self) -> &AgentId {
        self.base().id()
    }

    fn name(&self) -> &str {
        self.base().name()
    }

    fn description(&self) -> &str {
        self.base().description()
    }

    fn agent_type(&self) -> AgentType {
        self.base().agent_type()
    }

    fn parent_id(&self) -> Option<AgentId> {
        self.base().parent_id()
    }

    fn sub_agents(&self) -> Vec<Arc<dyn Agent>> {
        self.base().sub_agents()
    }

    fn metadata(&self) -> HashMap<String, Value> {
        self.base().metadata()
    }

    fn info(&self) -> AgentInfo {
        self.base().info()
    }

    async fn initialize(&self) -> Result<()> {
        self.base().initialize().await
    }

    async fn cleanup(&self) -> Result<()> {
        self.base().cleanup().await
    }

    fn validate(&self) -> Result<()> {
        self.base().validate()
    }
}

/// Run `agent` on its own task, streaming `agent.start` followed by
/// `agent.complete` or `agent.error`. Must be called inside a tokio runtime.
pub fn run_async(agent: Arc<dyn Agent>, state: State) -> mpsc::Receiver<Event> {
    let (tx, rx) = mpsc::channel(RUN_ASYNC_BUFFER);
    tokio::spawn(async move {
        let id = agent.id().to_string();
        let name = agent.name().to_string();
        let _ = tx
            .send(Event::new(EventType::AgentStart, &id, &name, Value::Null))
            .await;

        let event = match agent.run(state).await {
            Ok(result) => Event::new(
                EventType::AgentComplete,
                &id,
                &name,
                Value::Object(result.values().clone().into_iter().collect()),
            ),
            Err(e) => Event::new(EventType::AgentError, &id, &name, Value::Null).with_error(e),
        };
        let _ = tx.send(event).await;
    });
    rx
}

// ============================================================================
// BaseAgent
// ============================================================================

pub struct BaseAgent {
    id: AgentId,
    name: String,
    description: String,
    agent_type: AgentType,
    config: RwLock<AgentConfig>,
    tree: RwLock<Arc<AgentTree>>,
    sub_agents: SubAgents,
    metadata: RwLock<HashMap<String, Value>>,
    dispatcher: OnceCell<Arc<EventDispatcher>>,
    initialized: AtomicBool,
    lifecycle: AsyncMutex<()>,
    metrics: Arc<dyn MetricsSink>,
}

impl BaseAgent {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        agent_type: AgentType,
    ) -> Self {
        Self {
            id: AgentId::new(),
            name: name.into(),
            description: description.into(),
            agent_type,
            config: RwLock::new(AgentConfig::default()),
            tree: RwLock::new(Arc::new(AgentTree::new())),
            sub_agents: Arc::new(RwLock::new(Vec::new())),
            metadata: RwLock::new(HashMap::new()),
            dispatcher: OnceCell::new(),
            initialized: AtomicBool::new(false),
            lifecycle: AsyncMutex::new(()),
            metrics: metrics::noop(),
        }
    }

    pub fn with_id(mut self, id: impl Into<AgentId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_config(self, config: AgentConfig) -> Self {
        *self.config.write() = config;
        self
    }

    /// Start on `tree` instead of a private one, e.g. `AgentTree::global()`
    pub fn with_tree(mut self, tree: Arc<AgentTree>) -> Self {
        *self.tree.get_mut() = tree;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Publish into an existing dispatcher, e.g. one shared by a whole team of agents.
    /// The last dispatcher given wins.
    pub fn with_dispatcher(mut self, dispatcher: Arc<EventDispatcher>) -> Self {
        if self.dispatcher.get().is_some() {
            tracing::warn!(agent = %self.name, "Replacing event dispatcher; existing subscribers stay on the old one");
        }
        self.dispatcher = OnceCell::with_value(dispatcher);
        self
    }

    pub fn with_metadata(self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_metadata(key, value);
        self
    }

    // =========================================================================
    // Identity and configuration
    // =========================================================================

    pub fn id(&self) -> &AgentId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn agent_type(&self) -> AgentType {
        self.agent_type.clone()
    }

    pub fn info(&self) -> AgentInfo {
        AgentInfo {
            id: self.id.to_string(),
            name: self.name.clone(),
            description: self.description.clone(),
            agent_type: self.agent_type.clone(),
            metadata: self.metadata(),
        }
    }

    pub fn config(&self) -> AgentConfig {
        self.config.read().clone()
    }

    pub fn set_config(&self, config: AgentConfig) {
        *self.config.write() = config;
    }

    pub fn update_config(&self, f: impl FnOnce(&mut AgentConfig)) {
        f(&mut self.config.write());
    }

    pub fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.metrics
    }

    pub fn tree(&self) -> Arc<AgentTree> {
        self.tree.read().clone()
    }

    pub fn metadata(&self) -> HashMap<String, Value> {
        self.metadata.read().clone()
    }

    pub fn get_metadata(&self, key: &str) -> Option<Value> {
        self.metadata.read().get(key).cloned()
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.metadata.write().insert(key.into(), value.into());
    }

    // =========================================================================
    // Hierarchy
    // =========================================================================

    pub fn parent_id(&self) -> Option<AgentId> {
        self.tree().parent(&self.id)
    }

    /// Link to `parent` on this agent's own tree.
    /// Fails with `CircularDependency` if `parent` is this agent or one of its descendants.
    pub fn set_parent(&self, parent: &AgentId) -> Result<()> {
        self.tree().attach(&self.id, parent)
    }

    pub fn clear_parent(&self) {
        self.tree().detach(&self.id);
    }

    pub fn sub_agents(&self) -> Vec<Arc<dyn Agent>> {
        self.sub_agents.read().clone()
    }

    /// Shared handle to the child list; stays valid while the agent lives
    pub fn sub_agents_handle(&self) -> SubAgents {
        self.sub_agents.clone()
    }

    pub fn add_sub_agent(&self, agent: Arc<dyn Agent>) -> Result<()> {
        if self.sub_agents.read().iter().any(|c| c.id() == agent.id()) {
            return Err(AgentRuntimeError::DuplicateId(agent.id().to_string()));
        }

        self.link_child(agent.base())?;

        let mut children = self.sub_agents.write();
        if children.iter().any(|c| c.id() == agent.id()) {
            return Err(AgentRuntimeError::DuplicateId(agent.id().to_string()));
        }
        tracing::debug!(parent = %self.name, child = %agent.name(), "Added sub-agent");
        children.push(agent);
        Ok(())
    }

    /// Record `child` under this agent on this agent's tree, first moving the
    /// child's subtree over if it lives on another tree. Agents on different
    /// trees are never connected, so only a same-tree link can close a cycle.
    fn link_child(&self, child: &BaseAgent) -> Result<()> {
        let _links = TREE_LINKS.lock();
        let tree = self.tree();
        if !Arc::ptr_eq(&tree, &child.tree()) {
            child.move_to_tree(&tree)?;
        }
        tree.attach(&child.id, &self.id)
    }

    fn move_to_tree(&self, tree: &Arc<AgentTree>) -> Result<()> {
        let old = std::mem::replace(&mut *self.tree.write(), tree.clone());
        old.detach(&self.id);
        for child in self.sub_agents() {
            child.base().move_to_tree(tree)?;
            tree.attach(child.id(), &self.id)?;
        }
        Ok(())
    }

    pub fn remove_sub_agent(&self, name: &str) -> Result<Arc<dyn Agent>> {
        let removed = {
            let mut children = self.sub_agents.write();
            let index = children
                .iter()
                .position(|c| c.name() == name)
                .ok_or_else(|| AgentRuntimeError::AgentNotFound(name.to_string()))?;
            children.remove(index)
        };
        removed.base().clear_parent();
        Ok(removed)
    }

    /// Direct child named `name`
    pub fn find_sub_agent(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.sub_agents
            .read()
            .iter()
            .find(|c| c.name() == name)
            .cloned()
    }

    /// Descendant named `name`, depth first. Does not match the agent itself.
    pub fn find_agent(&self, name: &str) -> Option<Arc<dyn Agent>> {
        for child in self.sub_agents() {
            if child.name() == name {
                return Some(child);
            }
            if let Some(found) = child.base().find_agent(name) {
                return Some(found);
            }
        }
        None
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Initialize children, once. A failed child leaves the agent uninitialized.
    /// Concurrent callers wait for the first one to finish.
    pub async fn initialize(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }

        for child in self.sub_agents() {
            if let Err(e) = child.initialize().await {
                return Err(self
                    .error(
                        Phase::Initialize,
                        format!("failed to initialize sub-agent {}", child.name()),
                    )
                    .with_source(e)
                    .into());
            }
        }

        self.initialized.store(true, Ordering::SeqCst);
        tracing::debug!(agent = %self.name, "Agent initialized");
        Ok(())
    }

    /// Clean up every child, continuing past failures
    pub async fn cleanup(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let mut errors = MultiError::new();
        for child in self.sub_agents() {
            if let Err(e) = child.cleanup().await {
                tracing::warn!(agent = %self.name, child = %child.name(), error = %e, "Sub-agent cleanup failed");
                errors.push(e);
            }
        }
        self.initialized.store(false, Ordering::SeqCst);
        tracing::debug!(agent = %self.name, "Agent cleaned up");
        errors.into_result()
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(ValidationError::new("name", "agent name cannot be empty")
                .with_value(self.name.as_str())
                .into());
        }

        self.config.read().validate()?;

        for child in self.sub_agents() {
            if let Err(e) = child.validate() {
                return Err(self
                    .error(
                        Phase::Validation,
                        format!("sub-agent {} validation failed", child.name()),
                    )
                    .with_source(e)
                    .into());
            }
        }
        Ok(())
    }

    /// Structured error tagged with this agent's identity
    pub fn error(&self, phase: Phase, message: impl Into<String>) -> AgentError {
        AgentError::new(self.id.to_string(), self.name.clone(), phase, message)
    }

    /// `Cancelled`, wrapped in an execution error naming this agent
    pub fn cancelled(&self) -> AgentRuntimeError {
        self.error(Phase::Execution, "execution cancelled")
            .with_source(AgentRuntimeError::Cancelled)
            .into()
    }

    /// Wrap `err` in an error naming this agent, unless it already names one
    pub fn attribute(&self, phase: Phase, message: &str, err: AgentRuntimeError) -> AgentRuntimeError {
        match err {
            AgentRuntimeError::Agent(_) => err,
            AgentRuntimeError::Cancelled => self.cancelled(),
            other => self.error(phase, message).with_source(other).into(),
        }
    }

    // =========================================================================
    // Events
    // =========================================================================

    pub fn dispatcher(&self) -> Option<Arc<EventDispatcher>> {
        self.dispatcher.get().cloned()
    }

    fn dispatcher_or_init(&self) -> &Arc<EventDispatcher> {
        self.dispatcher.get_or_init(|| {
            Arc::new(EventDispatcher::with_metrics(
                DispatcherConfig::default(),
                self.metrics.clone(),
            ))
        })
    }

    /// Build and publish an event from this agent. No-op until someone subscribes.
    pub fn emit_event(&self, event_type: EventType, data: Value) {
        self.emit(Event::new(
            event_type,
            self.id.to_string(),
            self.name.clone(),
            data,
        ));
    }

    pub fn emit(&self, event: Event) {
        if let Some(dispatcher) = self.dispatcher.get() {
            dispatcher.dispatch(event);
        }
    }

    /// Subscribe to this agent's events, starting its dispatcher on first use.
    /// Must be called inside a tokio runtime.
    pub fn subscribe(
        &self,
        handler: Arc<dyn EventHandler>,
        filters: Vec<EventFilter>,
    ) -> SubscriptionId {
        self.dispatcher_or_init().subscribe(handler, filters)
    }

    pub fn unsubscribe(&self, id: &str) -> bool {
        self.dispatcher
            .get()
            .map(|d| d.unsubscribe(id))
            .unwrap_or(false)
    }

    // =========================================================================
    // Execution helpers
    // =========================================================================

    /// Call `f` up to `max_retries + 1` times, sleeping `retry_delay * attempt`
    /// between attempts. `f` receives the attempt number, starting at 0.
    pub async fn execute_with_retry<T, F, Fut>(&self, cancel: &CancellationToken, mut f: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let config = self.config();
        let mut last_error = None;

        for attempt in 0..=config.max_retries {
            if attempt > 0 {
                let delay = config.retry_delay() * attempt;
                self.metrics.incr_counter(counters::AGENT_RETRIES, 1);
                tokio::select! {
                    _ = cancel.cancelled() => return Err(self.cancelled()),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            match f(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        agent = %self.name,
                        attempt = attempt + 1,
                        max_attempts = config.max_retries + 1,
                        error = %e,
                        "Attempt failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        let last = last_error.unwrap_or_else(|| AgentRuntimeError::other("no attempts made"));
        Err(self
            .error(Phase::Execution, "maximum retries exceeded")
            .with_source(AgentRuntimeError::MaxRetriesExceeded {
                attempts: config.max_retries + 1,
                last: Box::new(last),
            })
            .into())
    }

    /// Run `f` as its own task, racing it against the configured timeout.
    ///
    /// `f` gets a child of `cancel` that is cancelled when the deadline fires
    /// or `cancel` itself fires. Work that ignores the token keeps running in
    /// the background until it finishes on its own.
    pub async fn execute_with_timeout<T, F, Fut>(&self, cancel: &CancellationToken, f: F) -> Result<T>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let Some(timeout) = self.config().timeout() else {
            return f(cancel.clone()).await;
        };

        let token = cancel.child_token();
        let handle = tokio::spawn(f(token.clone()));

        tokio::select! {
            joined = tokio::time::timeout(timeout, handle) => match joined {
                Ok(Ok(result)) => result,
                Ok(Err(join_err)) => Err(AgentRuntimeError::TaskFailed(join_err.to_string())),
                Err(_) => {
                    token.cancel();
                    self.metrics.incr_counter(counters::AGENT_TIMEOUTS, 1);
                    tracing::warn!(agent = %self.name, timeout_secs = timeout.as_secs(), "Execution timed out");
                    Err(self
                        .error(Phase::Execution, "execution timeout")
                        .with_source(AgentRuntimeError::Timeout(timeout))
                        .into())
                }
            },
            _ = cancel.cancelled() => {
                token.cancel();
                Err(self.cancelled())
            }
        }
    }
}

impl Drop for BaseAgent {
    fn drop(&mut self) {
        let tree = self.tree.get_mut();
        tree.detach(&self.id);
        tree.detach_children(&self.id);
    }
}

#[async_trait]
impl Agent for BaseAgent {
    fn base(&self) -> &BaseAgent {
        self
    }

    async fn run(&self, _state: State) -> Result<State> {
        Err(AgentRuntimeError::InvalidState(format!(
            "agent {} has no run implementation",
            self.name
        )))
    }
}

// ============================================================================
// FnAgent
// ============================================================================

type RunFn = Arc<dyn Fn(State) -> BoxFuture<'static, Result<State>> + Send + Sync>;

/// Agent whose behavior is a closure
pub struct FnAgent {
    base: BaseAgent,
    run_fn: RunFn,
}

impl FnAgent {
    pub fn new<F, Fut>(base: BaseAgent, f: F) -> Self
    where
        F: Fn(State) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<State>> + Send + 'static,
    {
        Self {
            base,
            run_fn: Arc::new(move |state| f(state).boxed()),
        }
    }

    /// Custom-typed agent named `name` running `f`
    pub fn from_fn<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(State) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<State>> + Send + 'static,
    {
        Self::new(BaseAgent::new(name, "", AgentType::Custom), f)
    }
}

#[async_trait]
impl Agent for FnAgent {
    fn base(&self) -> &BaseAgent {
        &self.base
    }

    async fn run(&self, state: State) -> Result<State> {
        (self.run_fn)(state).await
    }
}
