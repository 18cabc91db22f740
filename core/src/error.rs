use std::io;
use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;
use tokio::task::JoinError;

use crate::approval::ApprovalVerificationError;

pub type Result<T> = std::result::Result<T, AutopoiesisErr>;

#[derive(Error, Debug)]
pub enum AutopoiesisErr {
    /// A deferred-approval submission failed one of the verification stages.
    /// The embedded error carries the stable code shown to the approver.
    #[error(transparent)]
    ApprovalVerification(#[from] ApprovalVerificationError),

    /// Tier classifier said `block`: the command is unconditionally denied.
    #[error("command blocked: {0}")]
    CommandBlocked(String),

    /// A non-free command was attempted while the agent has no approval
    /// keyring to route it through.
    #[error("approval required: {0}")]
    ApprovalRequired(String),

    #[error("Partial result: tool loop iteration cap reached and execution was stopped.")]
    ToolLoopExceeded,

    #[error("Partial result: work item token budget reached and execution was stopped.")]
    TokenBudgetExceeded,

    #[error("Partial result: work item exceeded wall-clock timeout and was stopped.")]
    TimeoutExceeded,

    /// Signing requested before `unlock` succeeded.
    #[error("approval keys are locked; unlock with the signing passphrase first")]
    LockedKey,

    #[error("unknown signing key: {0}")]
    UnknownKeyId(String),

    #[error("passphrase does not decrypt the stored signing key")]
    BadPassphrase,

    #[error("approval keyring is not initialised; run `autopoiesis keys init`")]
    KeyringMissing,

    #[error("approval keyring already initialised; use `keys rotate` instead")]
    KeyringExists,

    #[error("no runtime registered for agent '{0}'")]
    UnknownAgent(String),

    #[error("multiple runtimes registered ({0}); specify an agent_id")]
    AmbiguousRuntime(String),

    #[error("{0}")]
    EnvVar(EnvVarError),

    #[error("invalid work item: {0}")]
    InvalidWorkItem(String),

    #[error("tool '{0}' cannot be routed through the approval flow")]
    UnapprovableTool(String),

    /// Downstream LLM transport or schema failure, flattened to
    /// `<ClassName>: <message>` so it survives the queue boundary.
    #[error("{class}: {message}")]
    Provider { class: String, message: String },

    /// SSE stream disconnected or errored after the HTTP handshake
    /// succeeded. Optionally carries a requested retry delay.
    #[error("stream disconnected before completion: {0}")]
    Stream(String, Option<Duration>),

    #[error("unexpected status {0}: {1}")]
    UnexpectedStatus(StatusCode, String),

    #[error("exceeded retry limit, last status: {0}")]
    RetryLimit(StatusCode),

    #[error("work item was cancelled")]
    Cancelled,

    #[error("internal error; queue worker died unexpectedly")]
    InternalAgentDied,

    // -----------------------------------------------------------------
    // Automatic conversions for common external error types
    // -----------------------------------------------------------------
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    TokioJoin(#[from] JoinError),
}

impl AutopoiesisErr {
    /// Guard breaches degrade to a partial result instead of failing the
    /// work item.
    pub fn is_limit_breach(&self) -> bool {
        matches!(
            self,
            AutopoiesisErr::ToolLoopExceeded
                | AutopoiesisErr::TokenBudgetExceeded
                | AutopoiesisErr::TimeoutExceeded
        )
    }

    /// Flatten a provider-side failure into a `<ClassName>: <message>`
    /// string pair that crosses the queue boundary intact.
    pub fn provider(class: impl Into<String>, message: impl Into<String>) -> Self {
        AutopoiesisErr::Provider {
            class: class.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug)]
pub struct EnvVarError {
    /// Name of the environment variable that is missing or malformed.
    pub var: String,

    /// Optional instructions to help the user set a valid value.
    pub instructions: Option<String>,
}

impl std::fmt::Display for EnvVarError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Invalid environment variable: `{}`.", self.var)?;
        if let Some(instructions) = &self.instructions {
            write!(f, " {instructions}")?;
        }
        Ok(())
    }
}
