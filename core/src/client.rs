//! Streaming chat-completions client.

use async_trait::async_trait;
use autopoiesis_protocol::Message;
use autopoiesis_protocol::Part;
use autopoiesis_protocol::Role;
use autopoiesis_protocol::ToolCallRequest;
use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures::Stream;
use futures::StreamExt;
use futures::TryStreamExt;
use reqwest::StatusCode;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;

use crate::client_common::ModelClient;
use crate::client_common::Prompt;
use crate::client_common::ResponseEvent;
use crate::client_common::ResponseStream;
use crate::client_common::TokenUsage;
use crate::config::AUTOPOIESIS_API_BASE;
use crate::config::AUTOPOIESIS_API_KEY;
use crate::config::AUTOPOIESIS_MODEL;
use crate::config::AUTOPOIESIS_REQUEST_MAX_RETRIES;
use crate::config::AUTOPOIESIS_STREAM_IDLE_TIMEOUT_MS;
use crate::error::AutopoiesisErr;
use crate::error::Result;
use crate::util::backoff;

#[derive(Clone)]
pub struct ChatCompletionsClient {
    client: reqwest::Client,
    model: String,
    base_url: String,
    api_key: Option<String>,
}

impl ChatCompletionsClient {
    pub fn new(model: String, base_url: String, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            model,
            base_url,
            api_key,
        }
    }

    pub fn from_env() -> Self {
        Self::new(
            AUTOPOIESIS_MODEL.to_string(),
            AUTOPOIESIS_API_BASE.to_string(),
            (*AUTOPOIESIS_API_KEY).map(str::to_string),
        )
    }

    fn build_payload(&self, prompt: &Prompt) -> serde_json::Value {
        let mut messages = Vec::<serde_json::Value>::new();
        if let Some(instructions) = &prompt.instructions {
            messages.push(json!({"role": "system", "content": instructions}));
        }
        for item in &prompt.input {
            push_message_json(&mut messages, item);
        }

        let tools: Vec<serde_json::Value> = prompt
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    }
                })
            })
            .collect();

        json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
            "stream_options": {"include_usage": true},
            "tools": tools,
        })
    }
}

#[async_trait]
impl ModelClient for ChatCompletionsClient {
    async fn stream(&self, prompt: &Prompt) -> Result<ResponseStream> {
        let payload = self.build_payload(prompt);
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        debug!("POST to {url}");

        let mut attempt = 0;
        loop {
            attempt += 1;

            let mut req_builder = self.client.post(&url);
            if let Some(api_key) = &self.api_key {
                req_builder = req_builder.bearer_auth(api_key.clone());
            }
            let res = req_builder
                .header(reqwest::header::ACCEPT, "text/event-stream")
                .json(&payload)
                .send()
                .await;

            match res {
                Ok(resp) if resp.status().is_success() => {
                    let (tx_event, rx_event) = mpsc::channel::<Result<ResponseEvent>>(16);
                    let stream = resp.bytes_stream().map_err(AutopoiesisErr::Reqwest);
                    tokio::spawn(process_chat_sse(stream, tx_event));
                    return Ok(ResponseStream::new(rx_event));
                }
                Ok(res) => {
                    let status = res.status();
                    if !(status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()) {
                        let body = (res.text().await).unwrap_or_default();
                        return Err(AutopoiesisErr::UnexpectedStatus(status, body));
                    }
                    if attempt > *AUTOPOIESIS_REQUEST_MAX_RETRIES {
                        return Err(AutopoiesisErr::RetryLimit(status));
                    }
                    tokio::time::sleep(backoff(attempt)).await;
                }
                Err(e) => {
                    if attempt > *AUTOPOIESIS_REQUEST_MAX_RETRIES {
                        return Err(e.into());
                    }
                    tokio::time::sleep(backoff(attempt)).await;
                }
            }
        }
    }

    fn model_name(&self) -> String {
        self.model.clone()
    }
}

fn push_message_json(messages: &mut Vec<serde_json::Value>, item: &Message) {
    let role = match item.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    };
    let mut text = String::new();
    let mut tool_calls = Vec::<serde_json::Value>::new();
    let mut tool_returns = Vec::<serde_json::Value>::new();
    for part in &item.parts {
        match part {
            Part::Text { text: t } => text.push_str(t),
            Part::ToolCall {
                tool_call_id,
                tool_name,
                args,
            } => tool_calls.push(json!({
                "id": tool_call_id,
                "type": "function",
                "function": {
                    "name": tool_name,
                    "arguments": args.to_string(),
                }
            })),
            Part::ToolReturn {
                tool_call_id,
                content,
                ..
            } => tool_returns.push(json!({
                "role": "tool",
                "tool_call_id": tool_call_id,
                "content": content,
            })),
        }
    }

    if !text.is_empty() || !tool_calls.is_empty() {
        let mut message = json!({"role": role, "content": text});
        if !tool_calls.is_empty() {
            message["tool_calls"] = serde_json::Value::Array(tool_calls);
        }
        messages.push(message);
    }
    messages.extend(tool_returns);
}

/// Map the Chat Completions SSE wire format onto [`ResponseEvent`] so the
/// rest of the pipeline stays agnostic of it.
async fn process_chat_sse<S>(stream: S, tx_event: mpsc::Sender<Result<ResponseEvent>>)
where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    let mut stream = stream.eventsource();
    let idle_timeout = *AUTOPOIESIS_STREAM_IDLE_TIMEOUT_MS;

    // Tool-call arguments arrive in fragments until the chunk whose
    // finish_reason is `tool_calls`; collect per-index here.
    #[derive(Default)]
    struct FnCallState {
        call_id: Option<String>,
        name: Option<String>,
        arguments: String,
    }
    let mut fn_calls: Vec<FnCallState> = Vec::new();
    let mut usage: Option<TokenUsage> = None;

    loop {
        let sse = match timeout(idle_timeout, stream.next()).await {
            Ok(Some(Ok(ev))) => ev,
            Ok(Some(Err(e))) => {
                let _ = tx_event
                    .send(Err(AutopoiesisErr::Stream(e.to_string(), None)))
                    .await;
                return;
            }
            Ok(None) => {
                let _ = tx_event
                    .send(Ok(ResponseEvent::Completed { token_usage: usage }))
                    .await;
                return;
            }
            Err(_) => {
                let _ = tx_event
                    .send(Err(AutopoiesisErr::Stream(
                        "idle timeout waiting for SSE".into(),
                        None,
                    )))
                    .await;
                return;
            }
        };

        if sse.data.trim() == "[DONE]" {
            flush_tool_calls(&mut fn_calls, &tx_event).await;
            let _ = tx_event
                .send(Ok(ResponseEvent::Completed { token_usage: usage }))
                .await;
            return;
        }

        let chunk: serde_json::Value = match serde_json::from_str(&sse.data) {
            Ok(chunk) => chunk,
            Err(e) => {
                let _ = tx_event
                    .send(Err(AutopoiesisErr::Stream(
                        format!("malformed SSE chunk: {e}"),
                        None,
                    )))
                    .await;
                return;
            }
        };

        if let Some(u) = chunk.get("usage").filter(|u| !u.is_null()) {
            usage = Some(TokenUsage {
                prompt_tokens: u["prompt_tokens"].as_u64().unwrap_or(0),
                completion_tokens: u["completion_tokens"].as_u64().unwrap_or(0),
            });
        }

        let Some(choice) = chunk["choices"].get(0) else {
            continue;
        };
        let delta = &choice["delta"];

        if let Some(content) = delta["content"].as_str()
            && !content.is_empty()
        {
            let _ = tx_event
                .send(Ok(ResponseEvent::OutputTextDelta(content.to_string())))
                .await;
        }
        if let Some(reasoning) = delta["reasoning_content"].as_str()
            && !reasoning.is_empty()
        {
            let _ = tx_event
                .send(Ok(ResponseEvent::ReasoningDelta(reasoning.to_string())))
                .await;
        }

        if let Some(calls) = delta["tool_calls"].as_array() {
            for call in calls {
                let index = call["index"].as_u64().unwrap_or(0) as usize;
                while fn_calls.len() <= index {
                    fn_calls.push(FnCallState::default());
                }
                let state = &mut fn_calls[index];
                if let Some(id) = call["id"].as_str() {
                    state.call_id = Some(id.to_string());
                }
                if let Some(name) = call["function"]["name"].as_str() {
                    state.name = Some(name.to_string());
                }
                if let Some(fragment) = call["function"]["arguments"].as_str() {
                    state.arguments.push_str(fragment);
                }
            }
        }

        if choice["finish_reason"].as_str() == Some("tool_calls") {
            flush_tool_calls(&mut fn_calls, &tx_event).await;
        }
    }

    async fn flush_tool_calls(
        fn_calls: &mut Vec<FnCallState>,
        tx_event: &mpsc::Sender<Result<ResponseEvent>>,
    ) {
        for state in fn_calls.drain(..) {
            let (Some(call_id), Some(name)) = (state.call_id, state.name) else {
                continue;
            };
            let args = serde_json::from_str(&state.arguments)
                .unwrap_or(serde_json::Value::String(state.arguments));
            let _ = tx_event
                .send(Ok(ResponseEvent::ToolCall(ToolCallRequest {
                    tool_call_id: call_id,
                    tool_name: name,
                    args,
                })))
                .await;
        }
    }
}
