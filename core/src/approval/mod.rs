//! Cryptographic approval subsystem: signed, nonce-bound, TTL-bounded
//! envelopes gating privileged tool calls.

pub mod canonical;
pub mod flow;
pub mod keys;
pub mod store;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

pub use flow::DeferredToolRequests;
pub use flow::DeferredToolResults;
pub use flow::ToolApproval;
pub use keys::ApprovalKeyManager;
pub use store::ApprovalStore;
pub use store::ApprovalStoreConfig;
pub use store::EnvelopeState;

/// Context string baked into every signed approval object.
pub const SIGNED_OBJECT_CONTEXT: &str = "approval.v1";

/// Binds an envelope to one workspace, work item and agent. Stored in
/// canonical JSON so byte equality is scope equality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalScope {
    pub workspace_root: String,
    pub work_item_id: String,
    pub agent_name: String,
}

/// The decision shape that gets signed: submitted decisions normalised down
/// to `(tool_call_id, approved)`. Denial messages ride alongside in the
/// submission but are not part of the signed payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedDecision {
    pub tool_call_id: String,
    pub approved: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationErrorCode {
    InvalidSubmission,
    ExpiredOrUnknown,
    ScopeMismatch,
    InvalidSignature,
    UnknownKeyId,
    BijectionMismatch,
}

impl VerificationErrorCode {
    /// Stable code surfaced to the approver.
    pub fn as_str(self) -> &'static str {
        match self {
            VerificationErrorCode::InvalidSubmission => "invalid_submission",
            VerificationErrorCode::ExpiredOrUnknown => "expired_or_unknown",
            VerificationErrorCode::ScopeMismatch => "scope_mismatch",
            VerificationErrorCode::InvalidSignature => "invalid_signature",
            VerificationErrorCode::UnknownKeyId => "unknown_key_id",
            VerificationErrorCode::BijectionMismatch => "bijection_mismatch",
        }
    }
}

impl std::fmt::Display for VerificationErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed verification stage. Fail-closed: the worker denies the tool
/// calls and the approver sees `code` as a stable string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct ApprovalVerificationError {
    pub code: VerificationErrorCode,
    pub message: String,
}

impl ApprovalVerificationError {
    pub fn new(code: VerificationErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}
