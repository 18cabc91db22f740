//! Tool surface for the turn executor: the shell tool gated by the tier
//! classifier, tool policy for the approval flow, and the audit log.

use std::collections::BTreeSet;
use std::io::Write;
use std::time::Duration;

use autopoiesis_protocol::ToolCallRequest;
use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use tracing::warn;

use crate::client_common::ToolDefinition;
use crate::command_tier::Tier;
use crate::command_tier::classify;
use crate::error::AutopoiesisErr;
use crate::error::Result;
use crate::exec::DEFAULT_EXEC_TIMEOUT;
use crate::exec::ExecParams;
use crate::exec::run_shell_command;
use crate::exec_env::create_env;
use crate::runtime::Runtime;
use crate::util::utc_now_epoch;

pub const SHELL_TOOL: &str = "shell";

/// Which tools exist and which may be routed through the approval flow.
#[derive(Debug, Clone)]
pub struct ToolPolicyRegistry {
    known: BTreeSet<String>,
    approvable: BTreeSet<String>,
}

impl Default for ToolPolicyRegistry {
    fn default() -> Self {
        let mut known = BTreeSet::new();
        known.insert(SHELL_TOOL.to_string());
        Self {
            approvable: known.clone(),
            known,
        }
    }
}

impl ToolPolicyRegistry {
    /// Reject deferred calls naming tools that cannot be approved. Runs
    /// before an envelope is created so a confused model cannot smuggle an
    /// unknown tool into the approval flow.
    pub fn validate_deferred_calls(&self, calls: &[ToolCallRequest]) -> Result<()> {
        for call in calls {
            if !self.known.contains(&call.tool_name) || !self.approvable.contains(&call.tool_name)
            {
                return Err(AutopoiesisErr::UnapprovableTool(call.tool_name.clone()));
            }
        }
        Ok(())
    }
}

/// Tool schemas advertised to the model.
pub fn tool_definitions() -> Vec<ToolDefinition> {
    vec![ToolDefinition {
        name: SHELL_TOOL.to_string(),
        description: "Run a shell command inside the agent workspace.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The command to execute."
                },
                "timeout_ms": {
                    "type": "number",
                    "description": "Optional timeout in milliseconds."
                }
            },
            "required": ["command"]
        }),
    }]
}

#[derive(Debug, Deserialize)]
struct ShellArgs {
    command: String,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

/// What the turn executor should do with one model-requested tool call.
#[derive(Debug)]
pub enum ToolDispatch {
    /// The tool ran (or was denied in-band); the turn continues with this
    /// content as the tool return.
    Completed { content: String, status: String },
    /// The call must be routed through the approval envelope flow.
    Deferred,
}

/// Outcome of tier enforcement for one shell command.
#[derive(Debug, PartialEq)]
pub enum TierDecision {
    Run,
    Defer(Tier),
    Deny { tier: Tier, message: String },
}

/// Apply the enforcement contract: `block` is unconditionally denied; free
/// commands run; anything else defers into the approval flow when the agent
/// has an approval keyring, and is denied with an unlock hint otherwise.
pub fn enforce_tier(command: &str, approval_available: bool) -> TierDecision {
    let tier = classify(command);
    match tier {
        Tier::Block => TierDecision::Deny {
            tier,
            message: format!("Blocked: command classified as {}.", tier.as_str()),
        },
        Tier::Free => TierDecision::Run,
        _ if !approval_available => TierDecision::Deny {
            tier,
            message: format!(
                "Approval required: command classified as {}. \
                 Initialise approval keys with `autopoiesis keys init`.",
                tier.as_str()
            ),
        },
        _ => TierDecision::Defer(tier),
    }
}

/// Dispatch one model-requested tool call, enforcing the tier gate.
pub async fn dispatch_tool_call(rt: &Runtime, call: &ToolCallRequest) -> Result<ToolDispatch> {
    if call.tool_name != SHELL_TOOL {
        // Unknown function: structured failure so the model can adapt.
        return Ok(ToolDispatch::Completed {
            content: format!("unsupported call: {}", call.tool_name),
            status: "failed".to_string(),
        });
    }
    let args: ShellArgs = match serde_json::from_value(call.args.clone()) {
        Ok(args) => args,
        Err(e) => {
            return Ok(ToolDispatch::Completed {
                content: format!("failed to parse function arguments: {e}"),
                status: "failed".to_string(),
            });
        }
    };

    match enforce_tier(&args.command, rt.approval_available()) {
        TierDecision::Deny { tier, message } => {
            audit_shell(rt, &args.command, None, true, false);
            Ok(ToolDispatch::Completed {
                content: blocked_payload(&message, tier)?,
                status: "blocked".to_string(),
            })
        }
        TierDecision::Defer(_) => Ok(ToolDispatch::Deferred),
        TierDecision::Run => {
            let content = execute_shell(rt, &args).await?;
            Ok(ToolDispatch::Completed {
                content,
                status: "completed".to_string(),
            })
        }
    }
}

/// Execute a call whose approval was verified and consumed. The tier gate
/// is not re-applied: the signed decision is the authority, except for
/// `block`-tier commands which stay denied even when signed.
pub async fn run_approved_call(rt: &Runtime, call: &ToolCallRequest) -> Result<String> {
    if call.tool_name != SHELL_TOOL {
        return Ok(format!("unsupported call: {}", call.tool_name));
    }
    let args: ShellArgs = match serde_json::from_value(call.args.clone()) {
        Ok(args) => args,
        Err(e) => return Ok(format!("failed to parse function arguments: {e}")),
    };
    if classify(&args.command) == Tier::Block {
        audit_shell(rt, &args.command, None, true, false);
        return blocked_payload(
            "Blocked: command classified as block.",
            Tier::Block,
        );
    }
    execute_shell(rt, &args).await
}

async fn execute_shell(rt: &Runtime, args: &ShellArgs) -> Result<String> {
    let params = ExecParams {
        command: args.command.clone(),
        cwd: rt.paths.workspace.clone(),
        timeout: args
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_EXEC_TIMEOUT),
        env: create_env(),
    };
    let output = run_shell_command(params, &rt.sandbox_limits, &rt.paths.tmp).await?;
    audit_shell(
        rt,
        &args.command,
        Some(output.exit_code),
        false,
        output.truncated,
    );

    #[derive(Serialize)]
    struct ShellPayload<'a> {
        stdout: &'a str,
        stderr: &'a str,
        exit_code: i32,
        timed_out: bool,
        truncated: bool,
    }
    Ok(serde_json::to_string(&ShellPayload {
        stdout: &output.stdout,
        stderr: &output.stderr,
        exit_code: output.exit_code,
        timed_out: output.timed_out,
        truncated: output.truncated,
    })?)
}

/// Structured denial the model sees; the turn continues.
fn blocked_payload(message: &str, tier: Tier) -> Result<String> {
    Ok(serde_json::to_string(&json!({
        "blocked": true,
        "tier": tier.as_str(),
        "message": message,
    }))?)
}

/// Append one JSONL record to the agent's audit log. Best-effort.
fn audit_shell(
    rt: &Runtime,
    command: &str,
    exit_code: Option<i32>,
    blocked: bool,
    truncated: bool,
) {
    let record = json!({
        "ts": utc_now_epoch(),
        "command": command,
        "exit_code": exit_code,
        "blocked": blocked,
        "truncated": truncated,
    });
    let path = rt.paths.audit_log();
    let result = std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(&path)
        .and_then(|mut file| writeln!(file, "{record}"));
    if let Err(err) = result {
        warn!("failed to append audit log: {err}");
    }
}
