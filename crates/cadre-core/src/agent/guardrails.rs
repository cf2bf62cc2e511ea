//! Input and output guardrails
//!
//! A guardrail inspects a `State` and rejects it with an error. The LLM agent
//! runs its input guardrail before the loop and its output guardrail after.
//!
//! ## Built-in Guardrails
//! - `RequiredKeys` - Rejects states missing any listed value key
//! - `MaxStateSize` - Rejects states whose values serialize past a byte limit
//! - `MessageCount` - Bounds the number of messages
//! - `ContentModeration` - Rejects blocked words in messages and string values

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{MultiError, Result, ValidationError};
use crate::state::State;

/// Which side of a run a guardrail applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuardrailType {
    Input,
    Output,
    Both,
}

impl GuardrailType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
            Self::Both => "both",
        }
    }

    /// Whether a guardrail of this type runs on the `side` being checked
    pub fn applies_to(&self, side: GuardrailType) -> bool {
        side == GuardrailType::Both || *self == GuardrailType::Both || *self == side
    }
}

impl fmt::Display for GuardrailType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait Guardrail: Send + Sync {
    fn name(&self) -> &str;

    fn guardrail_type(&self) -> GuardrailType;

    async fn validate(&self, state: &State) -> Result<()>;
}

/// Run `guardrail`, failing if it has not answered within `timeout`
pub async fn validate_with_timeout(
    guardrail: &dyn Guardrail,
    state: &State,
    timeout: Duration,
) -> Result<()> {
    match tokio::time::timeout(timeout, guardrail.validate(state)).await {
        Ok(result) => result,
        Err(_) => Err(ValidationError::new(
            guardrail.name(),
            format!("guardrail {} validation timeout after {:?}", guardrail.name(), timeout),
        )
        .into()),
    }
}

fn reject(name: &str, message: impl Into<String>) -> Result<()> {
    Err(ValidationError::new(name, message).into())
}

// ============================================================================
// Closure guardrail
// ============================================================================

type CheckFn = Arc<dyn Fn(&State) -> BoxFuture<'static, Result<()>> + Send + Sync>;

pub struct GuardrailFn {
    name: String,
    guardrail_type: GuardrailType,
    check: CheckFn,
}

impl GuardrailFn {
    /// The closure gets a clone of the state so the returned future can own it
    pub fn new<F, Fut>(name: impl Into<String>, guardrail_type: GuardrailType, f: F) -> Self
    where
        F: Fn(State) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            guardrail_type,
            check: Arc::new(move |state: &State| f(state.clone()).boxed()),
        }
    }

    /// Synchronous check
    pub fn sync<F>(name: impl Into<String>, guardrail_type: GuardrailType, f: F) -> Self
    where
        F: Fn(&State) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            guardrail_type,
            check: Arc::new(move |state: &State| futures::future::ready(f(state)).boxed()),
        }
    }
}

#[async_trait]
impl Guardrail for GuardrailFn {
    fn name(&self) -> &str {
        &self.name
    }

    fn guardrail_type(&self) -> GuardrailType {
        self.guardrail_type
    }

    async fn validate(&self, state: &State) -> Result<()> {
        (self.check)(state).await
    }
}

// ============================================================================
// Chain
// ============================================================================

/// Runs guardrails in order, skipping ones that do not apply to the chain's type
pub struct GuardrailChain {
    name: String,
    guardrail_type: GuardrailType,
    fail_fast: bool,
    guardrails: Vec<Arc<dyn Guardrail>>,
}

impl GuardrailChain {
    pub fn new(name: impl Into<String>, guardrail_type: GuardrailType, fail_fast: bool) -> Self {
        Self {
            name: name.into(),
            guardrail_type,
            fail_fast,
            guardrails: Vec::new(),
        }
    }

    pub fn add(mut self, guardrail: Arc<dyn Guardrail>) -> Self {
        self.guardrails.push(guardrail);
        self
    }

    pub fn len(&self) -> usize {
        self.guardrails.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guardrails.is_empty()
    }
}

#[async_trait]
impl Guardrail for GuardrailChain {
    fn name(&self) -> &str {
        &self.name
    }

    fn guardrail_type(&self) -> GuardrailType {
        self.guardrail_type
    }

    async fn validate(&self, state: &State) -> Result<()> {
        let mut errors = MultiError::new();

        for guardrail in &self.guardrails {
            if !guardrail.guardrail_type().applies_to(self.guardrail_type) {
                continue;
            }
            if let Err(e) = guardrail.validate(state).await {
                tracing::warn!(guardrail = guardrail.name(), error = %e, "Guardrail rejected state");
                if self.fail_fast {
                    return reject(
                        guardrail.name(),
                        format!("guardrail {} failed: {}", guardrail.name(), e),
                    );
                }
                errors.push(
                    ValidationError::new(
                        guardrail.name(),
                        format!("guardrail {}: {}", guardrail.name(), e),
                    )
                    .into(),
                );
            }
        }

        errors.into_result()
    }
}

// ============================================================================
// Built-ins
// ============================================================================

pub struct RequiredKeys {
    name: String,
    keys: Vec<String>,
}

impl RequiredKeys {
    pub fn new<I, S>(name: impl Into<String>, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl Guardrail for RequiredKeys {
    fn name(&self) -> &str {
        &self.name
    }

    fn guardrail_type(&self) -> GuardrailType {
        GuardrailType::Input
    }

    async fn validate(&self, state: &State) -> Result<()> {
        let missing: Vec<&str> = self
            .keys
            .iter()
            .filter(|k| !state.has(k))
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            reject(&self.name, format!("missing required keys: {:?}", missing))
        }
    }
}

pub struct MaxStateSize {
    name: String,
    max_bytes: usize,
}

impl MaxStateSize {
    pub fn new(name: impl Into<String>, max_bytes: usize) -> Self {
        Self {
            name: name.into(),
            max_bytes,
        }
    }
}

#[async_trait]
impl Guardrail for MaxStateSize {
    fn name(&self) -> &str {
        &self.name
    }

    fn guardrail_type(&self) -> GuardrailType {
        GuardrailType::Both
    }

    async fn validate(&self, state: &State) -> Result<()> {
        let size = serde_json::to_vec(state.values())
            .map_err(|e| ValidationError::new(&self.name, format!("failed to check state size: {}", e)))?
            .len();
        if size > self.max_bytes {
            reject(
                &self.name,
                format!("state size {} bytes exceeds limit of {} bytes", size, self.max_bytes),
            )
        } else {
            Ok(())
        }
    }
}

pub struct MessageCount {
    name: String,
    min: usize,
    max: usize,
}

impl MessageCount {
    pub fn new(name: impl Into<String>, min: usize, max: usize) -> Self {
        Self {
            name: name.into(),
            min,
            max,
        }
    }

    pub fn at_most(name: impl Into<String>, max: usize) -> Self {
        Self::new(name, 0, max)
    }
}

#[async_trait]
impl Guardrail for MessageCount {
    fn name(&self) -> &str {
        &self.name
    }

    fn guardrail_type(&self) -> GuardrailType {
        GuardrailType::Both
    }

    async fn validate(&self, state: &State) -> Result<()> {
        let count = state.messages().len();
        if count > self.max {
            return reject(
                &self.name,
                format!("message count {} exceeds limit of {}", count, self.max),
            );
        }
        if count < self.min {
            return reject(
                &self.name,
                format!("message count {} is below minimum of {}", count, self.min),
            );
        }
        Ok(())
    }
}

/// Rejects states containing blocked words, matched case-insensitively on
/// runs of ASCII letters and digits
pub struct ContentModeration {
    name: String,
    blocked: HashSet<String>,
}

impl ContentModeration {
    pub fn new<I, S>(name: impl Into<String>, blocked_words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            name: name.into(),
            blocked: blocked_words
                .into_iter()
                .map(|w| w.as_ref().to_lowercase())
                .collect(),
        }
    }

    fn is_blocked(&self, text: &str) -> bool {
        text.split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|word| !word.is_empty())
            .any(|word| self.blocked.contains(&word.to_lowercase()))
    }
}

#[async_trait]
impl Guardrail for ContentModeration {
    fn name(&self) -> &str {
        &self.name
    }

    fn guardrail_type(&self) -> GuardrailType {
        GuardrailType::Both
    }

    async fn validate(&self, state: &State) -> Result<()> {
        if state.messages().iter().any(|m| self.is_blocked(&m.content)) {
            return reject(&self.name, "message contains prohibited content");
        }

        let mut keys: Vec<&String> = state.values().keys().collect();
        keys.sort();
        for key in keys {
            if let Some(text) = state.get_str(key) {
                if self.is_blocked(text) {
                    return reject(
                        &self.name,
                        format!("state key {} contains prohibited content", key),
                    );
                }
            }
        }
        Ok(())
    }
}
