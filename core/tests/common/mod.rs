//! Shared test support: a scriptable model client and runtime fixtures.

#![allow(clippy::unwrap_used, dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use autopoiesis_core::Result;
use autopoiesis_core::client_common::ModelClient;
use autopoiesis_core::client_common::Prompt;
use autopoiesis_core::client_common::ResponseEvent;
use autopoiesis_core::client_common::ResponseStream;
use autopoiesis_core::runtime::Runtime;
use autopoiesis_core::runtime::RuntimeOptions;
use autopoiesis_protocol::Priority;
use autopoiesis_protocol::ToolCallRequest;
use autopoiesis_protocol::WorkItem;
use autopoiesis_protocol::WorkItemInput;
use autopoiesis_protocol::WorkItemType;
use tokio::sync::mpsc;

/// Plays back a scripted sequence of model responses, one per `stream`
/// call. Exhausted scripts reply with an empty completed response.
pub struct ScriptedClient {
    turns: Mutex<VecDeque<Vec<ResponseEvent>>>,
}

impl ScriptedClient {
    pub fn new(turns: Vec<Vec<ResponseEvent>>) -> Arc<Self> {
        Arc::new(Self {
            turns: Mutex::new(turns.into()),
        })
    }
}

#[async_trait]
impl ModelClient for ScriptedClient {
    async fn stream(&self, _prompt: &Prompt) -> Result<ResponseStream> {
        let events = self
            .turns
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| vec![ResponseEvent::Completed { token_usage: None }]);
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for event in events {
                if tx.send(Ok(event)).await.is_err() {
                    break;
                }
            }
        });
        Ok(ResponseStream::new(rx))
    }

    fn model_name(&self) -> String {
        "scripted".to_string()
    }
}

/// A plain-text model response.
pub fn text_turn(text: &str) -> Vec<ResponseEvent> {
    vec![
        ResponseEvent::OutputTextDelta(text.to_string()),
        ResponseEvent::Completed { token_usage: None },
    ]
}

/// A model response requesting one shell invocation.
pub fn shell_turn(call_id: &str, command: &str) -> Vec<ResponseEvent> {
    vec![
        ResponseEvent::ToolCall(ToolCallRequest {
            tool_call_id: call_id.to_string(),
            tool_name: "shell".to_string(),
            args: serde_json::json!({"command": command}),
        }),
        ResponseEvent::Completed { token_usage: None },
    ]
}

/// Build a runtime rooted in `home` with a scripted client.
pub fn scripted_runtime(
    home: &std::path::Path,
    agent: &str,
    turns: Vec<Vec<ResponseEvent>>,
) -> Arc<Runtime> {
    let mut options = RuntimeOptions::new(agent, ScriptedClient::new(turns));
    options.home = Some(home.to_path_buf());
    Runtime::initialize(options).unwrap()
}

pub fn prompt_item(id: &str, agent: &str, prompt: &str) -> WorkItem {
    WorkItem {
        id: id.to_string(),
        item_type: WorkItemType::Chat,
        priority: Priority::Normal,
        agent_id: agent.to_string(),
        topic_ref: None,
        input: WorkItemInput {
            prompt: Some(prompt.to_string()),
            ..Default::default()
        },
    }
}

pub fn continuation_item(
    id: &str,
    agent: &str,
    approval_context_id: &str,
    results_json: &str,
) -> WorkItem {
    WorkItem {
        id: id.to_string(),
        item_type: WorkItemType::Chat,
        priority: Priority::Normal,
        agent_id: agent.to_string(),
        topic_ref: None,
        input: WorkItemInput {
            deferred_tool_results_json: Some(results_json.to_string()),
            approval_context_id: Some(approval_context_id.to_string()),
            ..Default::default()
        },
    }
}
