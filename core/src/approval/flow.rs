//! Serialisation half of the approval round trip: turn deferred-tool
//! requests into a persisted envelope payload, and signed decisions back
//! into per-call results for resumption.

use std::collections::HashMap;
use std::path::Path;

use autopoiesis_protocol::DeferredRequestsPayload;
use autopoiesis_protocol::ToolCallRequest;

use crate::approval::ApprovalScope;
use crate::approval::keys::ApprovalKeyManager;
use crate::approval::store::ApprovalStore;
use crate::error::Result;
use crate::tools::ToolPolicyRegistry;

const DEFAULT_DENIAL_MESSAGE: &str = "User denied this action.";

/// Tool calls the executor intercepted instead of running, in model order.
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredToolRequests {
    pub calls: Vec<ToolCallRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolApproval {
    Approved,
    Denied(String),
}

/// Verified per-call decisions, keyed by tool_call_id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeferredToolResults {
    pub approvals: HashMap<String, ToolApproval>,
}

impl DeferredToolResults {
    pub fn get(&self, tool_call_id: &str) -> Option<&ToolApproval> {
        self.approvals.get(tool_call_id)
    }
}

/// Build the signed approval scope for a work item context.
pub fn build_approval_scope(
    approval_context_id: &str,
    workspace_root: &Path,
    agent_name: &str,
) -> ApprovalScope {
    ApprovalScope {
        workspace_root: workspace_root.to_string_lossy().into_owned(),
        work_item_id: approval_context_id.to_string(),
        agent_name: agent_name.to_string(),
    }
}

/// Persist a pending envelope for `requests` and serialise the payload sent
/// to the approver.
pub fn serialize_deferred_requests(
    requests: &DeferredToolRequests,
    scope: &ApprovalScope,
    approval_store: &ApprovalStore,
    key_manager: &ApprovalKeyManager,
    tool_policy: &ToolPolicyRegistry,
) -> Result<String> {
    tool_policy.validate_deferred_calls(&requests.calls)?;
    let (nonce, plan_hash) =
        approval_store.create_envelope(scope, &requests.calls, &key_manager.current_key_id()?)?;
    let payload = DeferredRequestsPayload {
        nonce,
        plan_hash_prefix: plan_hash.chars().take(8).collect(),
        requests: requests.calls.clone(),
    };
    Ok(serde_json::to_string(&payload)?)
}

/// Verify and consume a decisions submission, hydrating the approved/denied
/// map the executor resumes with. Fail-closed: any verification error
/// propagates and no tool runs.
pub fn deserialize_deferred_results(
    results_json: &str,
    scope: &ApprovalScope,
    approval_store: &ApprovalStore,
    key_manager: &ApprovalKeyManager,
) -> Result<DeferredToolResults> {
    let decisions = approval_store.verify_and_consume(results_json, scope, key_manager)?;
    let mut results = DeferredToolResults::default();
    for decision in decisions {
        let approval = if decision.approved {
            ToolApproval::Approved
        } else {
            let message = decision
                .denial_message
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| DEFAULT_DENIAL_MESSAGE.to_string());
            ToolApproval::Denied(message)
        };
        results.approvals.insert(decision.tool_call_id, approval);
    }
    Ok(results)
}
