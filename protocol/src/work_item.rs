//! Job descriptors and turn outputs transported through the work queue, plus
//! the payloads exchanged during the deferred-tool approval round trip.

use serde::Deserialize;
use serde::Serialize;

/// Immutable job descriptor routed to a per-agent queue.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WorkItem {
    /// Opaque unique id, used to key checkpoints and approval scopes.
    pub id: String,
    #[serde(rename = "type")]
    pub item_type: WorkItemType,
    pub priority: Priority,
    /// Routes the item to its agent queue; unknown ids auto-create a queue.
    pub agent_id: String,
    #[serde(default)]
    pub topic_ref: Option<String>,
    pub input: WorkItemInput,
}

impl WorkItem {
    /// A continuation answers a previously deferred turn: it carries signed
    /// decisions instead of a prompt.
    pub fn is_continuation(&self) -> bool {
        self.input.deferred_tool_results_json.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemType {
    Chat,
    Code,
    Review,
    Planning,
}

/// Queue priority. Higher-priority items are dequeued ahead of lower ones;
/// within one priority the queue is FIFO.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Numeric rank used by the dispatcher's ordering (higher dequeues first).
    pub fn rank(self) -> u8 {
        match self {
            Priority::Critical => 2,
            Priority::Normal => 1,
            Priority::Low => 0,
        }
    }
}

/// Exactly one of `prompt` or `deferred_tool_results_json` is set.
/// `message_history_json` is a stale carry-over: when a checkpoint exists for
/// the work item it wins over this field.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct WorkItemInput {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub message_history_json: Option<String>,
    #[serde(default)]
    pub deferred_tool_results_json: Option<String>,
    /// Links a continuation to the pending turn it answers. Must equal the
    /// `work_item_id` bound into the approval envelope's scope.
    #[serde(default)]
    pub approval_context_id: Option<String>,
}

/// Result of one turn. Exactly one of `text` or `deferred_tool_requests_json`
/// is set.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WorkItemOutput {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub deferred_tool_requests_json: Option<String>,
    /// Complete message history through this turn.
    pub message_history_json: String,
}

/// One pending tool call inside a deferred-requests payload.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ToolCallRequest {
    pub tool_call_id: String,
    pub tool_name: String,
    pub args: serde_json::Value,
}

/// Producer → approver payload describing the calls awaiting a decision.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DeferredRequestsPayload {
    pub nonce: String,
    /// First 8 hex chars of the envelope's plan hash, shown to the approver.
    pub plan_hash_prefix: String,
    pub requests: Vec<ToolCallRequest>,
}

/// Approver → worker submission answering a deferred-requests payload.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DecisionsSubmission {
    pub nonce: String,
    pub decisions: Vec<Decision>,
}

/// One per-call decision. `denial_message` is only meaningful when
/// `approved` is false.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Decision {
    pub tool_call_id: String,
    pub approved: bool,
    #[serde(default)]
    pub denial_message: Option<String>,
}
