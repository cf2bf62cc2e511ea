//! Language-model provider capability
//!
//! Agents only talk to models through `Provider`. HTTP clients live outside
//! this crate; `ScriptedProvider` replays canned replies for tests and the CLI.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::error::{AgentRuntimeError, Result};
use crate::state::Message;

/// Generation options passed through to the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    pub stop_sequences: Vec<String>,
    pub top_p: f32,
    pub top_k: Option<u32>,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    /// Overrides the provider's default model
    pub model: Option<String>,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 1024,
            stop_sequences: Vec::new(),
            top_p: 1.0,
            top_k: None,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            model: None,
        }
    }
}

impl ProviderOptions {
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_stop_sequences(mut self, stop: Vec<String>) -> Self {
        self.stop_sequences = stop;
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }

    pub fn with_top_k(mut self, top_k: u32) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn with_frequency_penalty(mut self, penalty: f32) -> Self {
        self.frequency_penalty = penalty;
        self
    }

    pub fn with_presence_penalty(mut self, penalty: f32) -> Self {
        self.presence_penalty = penalty;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// A complete model reply
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub content: String,
}

impl Response {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }
}

/// One increment of a streamed reply
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub text: String,
    pub finished: bool,
}

#[async_trait]
pub trait Provider: Send + Sync {
    async fn generate(&self, prompt: &str, options: &ProviderOptions) -> Result<String>;

    async fn generate_message(
        &self,
        messages: &[Message],
        options: &ProviderOptions,
    ) -> Result<Response>;

    /// Stream a reply. Defaults to a single final token from `generate`.
    async fn stream(
        &self,
        prompt: &str,
        options: &ProviderOptions,
    ) -> Result<BoxStream<'static, Result<Token>>> {
        let text = self.generate(prompt, options).await?;
        Ok(single_token(text))
    }

    async fn stream_message(
        &self,
        messages: &[Message],
        options: &ProviderOptions,
    ) -> Result<BoxStream<'static, Result<Token>>> {
        let response = self.generate_message(messages, options).await?;
        Ok(single_token(response.content))
    }
}

fn single_token(text: String) -> BoxStream<'static, Result<Token>> {
    stream::iter([Ok(Token {
        text,
        finished: true,
    })])
    .boxed()
}

// ============================================================================
// Scripted provider
// ============================================================================

/// Replays a queue of replies in order, then repeats the fallback.
///
/// Every call is recorded so tests can inspect what the agent sent.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<Result<String>>>,
    fallback: Option<String>,
    calls: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedProvider {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(|r| Ok(r.into())).collect()),
            fallback: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Reply used once the queue is empty
    pub fn with_fallback(mut self, reply: impl Into<String>) -> Self {
        self.fallback = Some(reply.into());
        self
    }

    /// Queue a failure
    pub fn push_error(&self, error: AgentRuntimeError) {
        self.replies.lock().push_back(Err(error));
    }

    pub fn push_reply(&self, reply: impl Into<String>) {
        self.replies.lock().push_back(Ok(reply.into()));
    }

    /// Message lists received by `generate_message`, in call order
    pub fn calls(&self) -> Vec<Vec<Message>> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    fn next_reply(&self) -> Result<String> {
        match self.replies.lock().pop_front() {
            Some(reply) => reply,
            None => self
                .fallback
                .clone()
                .ok_or_else(|| AgentRuntimeError::provider("scripted provider exhausted")),
        }
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn generate(&self, prompt: &str, _options: &ProviderOptions) -> Result<String> {
        self.calls.lock().push(vec![Message::user(prompt)]);
        self.next_reply()
    }

    async fn generate_message(
        &self,
        messages: &[Message],
        _options: &ProviderOptions,
    ) -> Result<Response> {
        self.calls.lock().push(messages.to_vec());
        self.next_reply().map(Response::new)
    }
}
