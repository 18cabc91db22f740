//! Non-interactive batch execution: enqueue one task, drive any approval
//! rounds, print the batch-result envelope, exit 0/1.

use std::io::IsTerminal;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use autopoiesis_core::client::ChatCompletionsClient;
use autopoiesis_core::config::ContextConfig;
use autopoiesis_core::config::LoopGuards;
use autopoiesis_core::queue::WorkQueueRegistry;
use autopoiesis_core::runtime::AgentRegistry;
use autopoiesis_core::runtime::Runtime;
use autopoiesis_core::runtime::RuntimeOptions;
use autopoiesis_core::worker::CoreWorkHandler;
use autopoiesis_core::workspace::resolve_agent_name;
use autopoiesis_core::AutopoiesisErr;
use autopoiesis_protocol::DecisionsSubmission;
use autopoiesis_protocol::DeferredRequestsPayload;
use autopoiesis_protocol::WorkItem;
use autopoiesis_protocol::WorkItemInput;
use autopoiesis_protocol::WorkItemOutput;
use serde::Serialize;
use uuid::Uuid;

use crate::approve::display_approval_requests;
use crate::approve::gather_decisions;
use crate::approve::to_signed_decisions;
use crate::cli::RunArgs;
use crate::display::TerminalStreamHandle;

/// Structured output from a batch run.
#[derive(Debug, Serialize)]
struct BatchResult {
    success: bool,
    result: Option<String>,
    error: Option<String>,
    approval_rounds: u64,
    elapsed_seconds: f64,
}

/// Run the batch flow; the returned code is the process exit status.
pub async fn run_batch(args: RunArgs, with_ansi: bool) -> anyhow::Result<i32> {
    let task = resolve_task(args.prompt.as_deref())?;
    let agent_id = resolve_agent_name(args.agent.as_deref());

    let registry = Arc::new(AgentRegistry::new());
    let handler = CoreWorkHandler::new(Arc::clone(&registry), |agent_id| {
        let mut options =
            RuntimeOptions::new(agent_id, Arc::new(ChatCompletionsClient::from_env()));
        options.context = ContextConfig::from_env()?;
        Runtime::initialize(options)
    })
    .with_stream_factory(move || Arc::new(TerminalStreamHandle::new(with_ansi)));
    let queues = WorkQueueRegistry::new(Arc::new(handler));

    let started = Instant::now();
    let flow = drive_approval_rounds(&queues, &registry, &agent_id, &args, task, with_ansi);
    let outcome = match args.timeout {
        Some(secs) if secs > 0 => {
            match tokio::time::timeout(std::time::Duration::from_secs(secs), flow).await {
                Ok(outcome) => outcome,
                Err(_) => Err(anyhow::anyhow!("Batch run exceeded {secs}s timeout.")),
            }
        }
        _ => flow.await,
    };

    let batch_result = match outcome {
        Ok((output, approval_rounds)) => BatchResult {
            success: true,
            result: output.text,
            error: None,
            approval_rounds,
            elapsed_seconds: round_elapsed(started),
        },
        Err(err) => BatchResult {
            success: false,
            result: None,
            error: Some(err.to_string()),
            approval_rounds: 0,
            elapsed_seconds: round_elapsed(started),
        },
    };

    emit(&batch_result, args.output.as_deref())?;
    Ok(if batch_result.success { 0 } else { 1 })
}

/// Enqueue the initial item, then loop: every deferred output is rendered,
/// decided, signed, and answered with a continuation carrying the same
/// approval context.
async fn drive_approval_rounds(
    queues: &Arc<WorkQueueRegistry>,
    registry: &Arc<AgentRegistry>,
    agent_id: &str,
    args: &RunArgs,
    task: String,
    with_ansi: bool,
) -> anyhow::Result<(WorkItemOutput, u64)> {
    let work_item_id = Uuid::new_v4().to_string();
    let mut item = WorkItem {
        id: work_item_id.clone(),
        item_type: args.item_type.into(),
        priority: args.priority.into(),
        agent_id: agent_id.to_string(),
        topic_ref: args.topic.clone(),
        input: WorkItemInput {
            prompt: Some(task),
            ..Default::default()
        },
    };

    let mut approval_rounds: u64 = 0;
    loop {
        let output = queues.enqueue_and_wait(item.clone()).await?;
        let Some(requests_json) = output.deferred_tool_requests_json.as_deref() else {
            return Ok((output, approval_rounds));
        };

        approval_rounds += 1;
        tracing::debug!(approval_rounds, "turn deferred; collecting decisions");
        if approval_rounds > LoopGuards::default().deferred_max_rounds {
            anyhow::bail!("deferred approval rounds exceeded the configured limit");
        }

        let payload: DeferredRequestsPayload = serde_json::from_str(requests_json)?;
        display_approval_requests(&payload, with_ansi);
        let decisions = gather_decisions(&payload, &mut std::io::stdin().lock())?;

        // Sign locally with the agent's key manager; the worker will verify
        // and consume on the continuation.
        let runtime = registry.get(Some(agent_id))?;
        unlock_for_signing(&runtime)?;
        runtime.approval_store.store_signed_approval(
            &payload.nonce,
            &to_signed_decisions(&decisions),
            &runtime.key_manager,
        )?;

        let submission = DecisionsSubmission {
            nonce: payload.nonce,
            decisions,
        };
        item = WorkItem {
            id: work_item_id.clone(),
            item_type: args.item_type.into(),
            priority: args.priority.into(),
            agent_id: agent_id.to_string(),
            topic_ref: None,
            input: WorkItemInput {
                deferred_tool_results_json: Some(serde_json::to_string(&submission)?),
                approval_context_id: Some(work_item_id.clone()),
                ..Default::default()
            },
        };
    }
}

fn unlock_for_signing(runtime: &Runtime) -> anyhow::Result<()> {
    if runtime.key_manager.is_unlocked() {
        return Ok(());
    }
    let passphrase = match std::env::var("AUTOPOIESIS_PASSPHRASE") {
        Ok(passphrase) if !passphrase.is_empty() => passphrase,
        _ => {
            eprint!("Signing passphrase: ");
            let mut line = String::new();
            std::io::stdin().read_line(&mut line)?;
            line.trim_end_matches('\n').to_string()
        }
    };
    match runtime.key_manager.unlock(&passphrase) {
        Ok(()) => Ok(()),
        Err(err @ AutopoiesisErr::KeyringMissing) => Err(anyhow::anyhow!(
            "{err}. Approvals cannot be signed without a keyring."
        )),
        Err(err) => Err(err.into()),
    }
}

fn resolve_task(prompt: Option<&str>) -> anyhow::Result<String> {
    match prompt {
        Some(task) if task != "-" => Ok(task.to_string()),
        maybe_dash => {
            let force_stdin = maybe_dash == Some("-");
            if std::io::stdin().is_terminal() && !force_stdin {
                anyhow::bail!(
                    "No task provided. Either specify one as an argument or pipe it into stdin."
                );
            }
            if !force_stdin {
                eprintln!("Reading task from stdin...");
            }
            let mut buffer = String::new();
            std::io::stdin().read_to_string(&mut buffer)?;
            let task = buffer.trim().to_string();
            if task.is_empty() {
                anyhow::bail!("Error: empty task from stdin.");
            }
            Ok(task)
        }
    }
}

fn round_elapsed(started: Instant) -> f64 {
    (started.elapsed().as_secs_f64() * 1000.0).round() / 1000.0
}

fn emit(result: &BatchResult, output_path: Option<&Path>) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(result)?;
    match output_path {
        Some(path) => std::fs::write(path, format!("{json}\n"))?,
        None => println!("{json}"),
    }
    Ok(())
}
