//! Interactive half of the approval protocol: render pending tool calls,
//! collect per-call decisions, and sign them.

use std::io::BufRead;
use std::io::Write;

use autopoiesis_core::approval::SignedDecision;
use autopoiesis_protocol::Decision;
use autopoiesis_protocol::DeferredRequestsPayload;
use autopoiesis_protocol::ToolCallRequest;
use owo_colors::OwoColorize;

const APPROVE_CHOICES: &[&str] = &["", "y", "yes"];
const DEFAULT_DENIAL_MESSAGE: &str = "User denied this action.";

/// Render the pending approval requests, one line per call with
/// pretty-printed args.
pub fn display_approval_requests(payload: &DeferredRequestsPayload, with_ansi: bool) {
    if with_ansi {
        eprintln!("\n{}", "Tool approval required:".bold());
    } else {
        eprintln!("\nTool approval required:");
    }
    eprintln!("  Plan hash: {}", payload.plan_hash_prefix);
    for (i, req) in payload.requests.iter().enumerate() {
        eprintln!("  [{}] {}", i + 1, req.tool_name);
        let serialized = serde_json::to_string_pretty(&req.args)
            .unwrap_or_else(|_| req.args.to_string());
        eprintln!("      args:");
        for line in serialized.lines() {
            eprintln!("        {line}");
        }
    }
}

/// Collect decisions from the user. One request gets a single Y/n prompt;
/// a batch supports approve-all, deny-all, or pick-one-by-one.
pub fn gather_decisions(
    payload: &DeferredRequestsPayload,
    input: &mut impl BufRead,
) -> std::io::Result<Vec<Decision>> {
    if payload.requests.len() == 1 {
        let approved = ask_yes_no(
            input,
            &format!("  Approve {}? [Y/n] ", payload.requests[0].tool_name),
        )?;
        let denial = if approved {
            None
        } else {
            prompt_denial_reason(input)?
        };
        return Ok(vec![decision_entry(
            &payload.requests[0],
            approved,
            denial,
        )]);
    }

    let answer = prompt_line(input, "  Approve all? [Y/n/pick] ")?;
    let answer = answer.trim().to_lowercase();
    if APPROVE_CHOICES.contains(&answer.as_str()) {
        return Ok(payload
            .requests
            .iter()
            .map(|req| decision_entry(req, true, None))
            .collect());
    }
    if answer == "pick" || answer == "p" {
        let mut decisions = Vec::new();
        for (i, req) in payload.requests.iter().enumerate() {
            let approved = ask_yes_no(
                input,
                &format!("  [{}] {} - approve? [Y/n] ", i + 1, req.tool_name),
            )?;
            let denial = if approved {
                None
            } else {
                prompt_denial_reason(input)?
            };
            decisions.push(decision_entry(req, approved, denial));
        }
        return Ok(decisions);
    }

    // Deny all, with one shared reason.
    let denial = prompt_denial_reason(input)?;
    Ok(payload
        .requests
        .iter()
        .map(|req| decision_entry(req, false, denial.clone()))
        .collect())
}

/// The signable projection of a decision list.
pub fn to_signed_decisions(decisions: &[Decision]) -> Vec<SignedDecision> {
    decisions
        .iter()
        .map(|d| SignedDecision {
            tool_call_id: d.tool_call_id.clone(),
            approved: d.approved,
        })
        .collect()
}

fn decision_entry(
    request: &ToolCallRequest,
    approved: bool,
    denial_message: Option<String>,
) -> Decision {
    let denial_message = if approved {
        None
    } else {
        denial_message
            .filter(|m| !m.is_empty())
            .or_else(|| Some(DEFAULT_DENIAL_MESSAGE.to_string()))
    };
    Decision {
        tool_call_id: request.tool_call_id.clone(),
        approved,
        denial_message,
    }
}

fn ask_yes_no(input: &mut impl BufRead, prompt: &str) -> std::io::Result<bool> {
    let answer = prompt_line(input, prompt)?;
    Ok(APPROVE_CHOICES.contains(&answer.trim().to_lowercase().as_str()))
}

fn prompt_denial_reason(input: &mut impl BufRead) -> std::io::Result<Option<String>> {
    let reason = prompt_line(input, "  Denial reason (optional): ")?;
    let reason = reason.trim();
    Ok((!reason.is_empty()).then(|| reason.to_string()))
}

fn prompt_line(input: &mut impl BufRead, prompt: &str) -> std::io::Result<String> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;
    let mut line = String::new();
    // EOF reads as an empty line, which the callers treat as the default.
    input.read_line(&mut line)?;
    Ok(line)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;

    fn payload(n: usize) -> DeferredRequestsPayload {
        DeferredRequestsPayload {
            nonce: "n".to_string(),
            plan_hash_prefix: "deadbeef".to_string(),
            requests: (0..n)
                .map(|i| ToolCallRequest {
                    tool_call_id: format!("c{i}"),
                    tool_name: "shell".to_string(),
                    args: serde_json::json!({"command": "rm x"}),
                })
                .collect(),
        }
    }

    #[test]
    fn single_request_defaults_to_approve() {
        let decisions = gather_decisions(&payload(1), &mut "\n".as_bytes()).unwrap();
        assert_eq!(decisions.len(), 1);
        assert!(decisions[0].approved);
        assert_eq!(decisions[0].denial_message, None);
    }

    #[test]
    fn single_request_denial_captures_reason() {
        let decisions =
            gather_decisions(&payload(1), &mut "n\nit is dangerous\n".as_bytes()).unwrap();
        assert!(!decisions[0].approved);
        assert_eq!(
            decisions[0].denial_message.as_deref(),
            Some("it is dangerous")
        );
    }

    #[test]
    fn batch_approve_all() {
        let decisions = gather_decisions(&payload(3), &mut "y\n".as_bytes()).unwrap();
        assert_eq!(decisions.len(), 3);
        assert!(decisions.iter().all(|d| d.approved));
    }

    #[test]
    fn batch_deny_all_shares_the_reason() {
        let decisions = gather_decisions(&payload(2), &mut "n\nnope\n".as_bytes()).unwrap();
        assert!(decisions.iter().all(|d| !d.approved));
        assert!(
            decisions
                .iter()
                .all(|d| d.denial_message.as_deref() == Some("nope"))
        );
    }

    #[test]
    fn batch_pick_mixes_decisions() {
        let decisions =
            gather_decisions(&payload(2), &mut "pick\ny\nn\n\n".as_bytes()).unwrap();
        assert!(decisions[0].approved);
        assert!(!decisions[1].approved);
        assert_eq!(
            decisions[1].denial_message.as_deref(),
            Some(DEFAULT_DENIAL_MESSAGE)
        );
    }

    #[test]
    fn signed_projection_drops_denial_messages() {
        let decisions = vec![Decision {
            tool_call_id: "c0".to_string(),
            approved: false,
            denial_message: Some("reason".to_string()),
        }];
        let signed = to_signed_decisions(&decisions);
        assert_eq!(signed[0].tool_call_id, "c0");
        assert!(!signed[0].approved);
    }
}
