//! Narrow interface between the turn executor and any LLM provider.

use std::pin::Pin;
use std::task::Context;
use std::task::Poll;

use async_trait::async_trait;
use autopoiesis_protocol::Message;
use autopoiesis_protocol::ToolCallRequest;
use futures::Stream;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::Result;

/// API request payload for a single model turn.
#[derive(Debug, Clone, Default)]
pub struct Prompt {
    /// System instructions; sent as the first message when present.
    pub instructions: Option<String>,
    /// Conversation context, post-pipeline.
    pub input: Vec<Message>,
    /// Tools available to the model.
    pub tools: Vec<ToolDefinition>,
}

/// Function-tool schema advertised to the model.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Events produced while streaming one model response.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseEvent {
    /// Incremental answer text.
    OutputTextDelta(String),
    /// Incremental reasoning text.
    ReasoningDelta(String),
    /// A complete tool call requested by the model.
    ToolCall(ToolCallRequest),
    /// The response finished; carries exact usage when the provider
    /// reported it.
    Completed { token_usage: Option<TokenUsage> },
}

pub struct ResponseStream {
    pub(crate) rx_event: mpsc::Receiver<Result<ResponseEvent>>,
}

impl ResponseStream {
    /// Build a stream from a channel receiver. Public so test doubles can
    /// script responses without an HTTP layer.
    pub fn new(rx_event: mpsc::Receiver<Result<ResponseEvent>>) -> Self {
        Self { rx_event }
    }
}

impl Stream for ResponseStream {
    type Item = Result<ResponseEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx_event.poll_recv(cx)
    }
}

/// The one seam the executor depends on. Provider SDK specifics stay behind
/// implementations of this trait.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn stream(&self, prompt: &Prompt) -> Result<ResponseStream>;

    fn model_name(&self) -> String;
}
