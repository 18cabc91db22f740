//! Work-item orchestration: checkpoint rehydration, approval continuation
//! verification, the bounded turn, envelope creation on defer, and partial
//! results on guard breach.

use std::sync::Arc;

use async_trait::async_trait;
use autopoiesis_protocol::WorkItem;
use autopoiesis_protocol::WorkItemOutput;
use autopoiesis_protocol::history_from_json;
use autopoiesis_protocol::history_to_json;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::approval::flow::DeferredToolResults;
use crate::approval::flow::build_approval_scope;
use crate::approval::flow::deserialize_deferred_results;
use crate::approval::flow::serialize_deferred_requests;
use crate::checkpoint::CheckpointScope;
use crate::checkpoint::with_checkpoint_scope;
use crate::error::AutopoiesisErr;
use crate::error::Result;
use crate::queue::WorkHandler;
use crate::runtime::AgentRegistry;
use crate::runtime::Runtime;
use crate::stream::StreamHandle;
use crate::turn::TurnOutput;
use crate::turn::TurnParams;
use crate::turn::run_turn;
use crate::workspace::DEFAULT_TMP_MAX_SIZE_MB;
use crate::workspace::DEFAULT_TMP_RETENTION_DAYS;
use crate::workspace::cleanup_tmp;

/// Queue handler backed by the runtime registry. Runtimes are created at
/// first use per agent id and reused thereafter.
pub struct CoreWorkHandler {
    registry: Arc<AgentRegistry>,
    factory: Box<dyn Fn(&str) -> Result<Arc<Runtime>> + Send + Sync>,
    stream_factory: Option<Box<dyn Fn() -> Arc<dyn StreamHandle> + Send + Sync>>,
}

impl CoreWorkHandler {
    pub fn new(
        registry: Arc<AgentRegistry>,
        factory: impl Fn(&str) -> Result<Arc<Runtime>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            registry,
            factory: Box::new(factory),
            stream_factory: None,
        }
    }

    /// Attach a fresh stream handle to every processed item.
    pub fn with_stream_factory(
        mut self,
        stream_factory: impl Fn() -> Arc<dyn StreamHandle> + Send + Sync + 'static,
    ) -> Self {
        self.stream_factory = Some(Box::new(stream_factory));
        self
    }
}

#[async_trait]
impl WorkHandler for CoreWorkHandler {
    async fn process(&self, item: WorkItem) -> Result<WorkItemOutput> {
        let runtime = self
            .registry
            .get_or_init(&item.agent_id, || (self.factory)(&item.agent_id))?;
        let stream = self.stream_factory.as_ref().map(|factory| factory());
        process_work_item(runtime, item, stream).await
    }
}

/// Run one work item end to end against its runtime.
pub async fn process_work_item(
    rt: Arc<Runtime>,
    item: WorkItem,
    stream: Option<Arc<dyn StreamHandle>>,
) -> Result<WorkItemOutput> {
    validate_item(&item)?;

    if let Some(topic_ref) = &item.topic_ref {
        rt.topics.activate(topic_ref);
    }

    // A checkpoint left by a prior crash wins over whatever stale history
    // the submitter carried along.
    let checkpointed = rt.checkpoints.load(&item.id)?;
    if checkpointed.is_some() {
        info!(work_item_id = %item.id, "resuming from checkpoint");
    }
    let history_json = checkpointed.or_else(|| item.input.message_history_json.clone());
    let history = history_from_json(history_json.as_deref())?;

    let deferred_results = resolve_continuation(&rt, &item)?;

    let scope = CheckpointScope {
        store: Arc::clone(&rt.checkpoints),
        work_item_id: item.id.clone(),
    };
    let params = TurnParams {
        work_item_id: item.id.clone(),
        prompt: item.input.prompt.clone(),
        history,
        deferred_results,
        stream,
    };
    let turn = with_checkpoint_scope(scope, run_turn(&rt, params)).await;

    let output = match turn {
        Ok(execution) => {
            let message_history_json = history_to_json(&execution.messages)?;
            match execution.output {
                TurnOutput::Text(text) => {
                    rt.checkpoints.clear(&item.id)?;
                    WorkItemOutput {
                        text: Some(text),
                        deferred_tool_requests_json: None,
                        message_history_json,
                    }
                }
                TurnOutput::Deferred(requests) => {
                    let scope = build_approval_scope(
                        &item.id,
                        &rt.paths.workspace,
                        &rt.agent_name,
                    );
                    let payload = serialize_deferred_requests(
                        &requests,
                        &scope,
                        &rt.approval_store,
                        &rt.key_manager,
                        &rt.tool_policy,
                    )?;
                    debug!(work_item_id = %item.id, "turn deferred for approval");
                    WorkItemOutput {
                        text: None,
                        deferred_tool_requests_json: Some(payload),
                        message_history_json,
                    }
                }
            }
        }
        Err(err) if err.is_limit_breach() => {
            // Graceful degrade: a partial result is better than a lost one.
            warn!(work_item_id = %item.id, "guard breach: {err}");
            let history = rt
                .checkpoints
                .load(&item.id)?
                .unwrap_or_else(|| "[]".to_string());
            rt.checkpoints.clear(&item.id)?;
            WorkItemOutput {
                text: Some(err.to_string()),
                deferred_tool_requests_json: None,
                message_history_json: history,
            }
        }
        Err(err) => return Err(err),
    };

    if let Err(err) = cleanup_tmp(
        &rt.paths.tmp,
        DEFAULT_TMP_RETENTION_DAYS,
        DEFAULT_TMP_MAX_SIZE_MB,
    ) {
        warn!("tmp cleanup failed: {err}");
    }
    // Sweeping piggybacks on worker traffic; a dedicated timer is
    // unnecessary at per-agent queue rates.
    if let Err(err) = rt.approval_store.sweep_expired() {
        warn!("envelope sweep failed: {err}");
    }
    if let Err(err) = rt.checkpoints.cleanup_stale(STALE_CHECKPOINT_MAX_AGE_HOURS) {
        warn!("stale checkpoint cleanup failed: {err}");
    }

    Ok(output)
}

/// Checkpoints older than this are abandoned work; their items will never
/// be re-enqueued.
const STALE_CHECKPOINT_MAX_AGE_HOURS: i64 = 7 * 24;

fn validate_item(item: &WorkItem) -> Result<()> {
    let has_prompt = item.input.prompt.is_some();
    let has_deferred = item.input.deferred_tool_results_json.is_some();
    if has_prompt == has_deferred {
        return Err(AutopoiesisErr::InvalidWorkItem(
            "exactly one of prompt or deferred_tool_results_json must be set".to_string(),
        ));
    }
    if has_deferred && item.input.approval_context_id.is_none() {
        return Err(AutopoiesisErr::InvalidWorkItem(
            "a continuation must carry approval_context_id".to_string(),
        ));
    }
    Ok(())
}

/// Verify and consume the approval envelope of a continuation. Fail-closed:
/// any verification error aborts the item before the model runs.
fn resolve_continuation(rt: &Runtime, item: &WorkItem) -> Result<Option<DeferredToolResults>> {
    let Some(results_json) = &item.input.deferred_tool_results_json else {
        return Ok(None);
    };
    let Some(approval_context_id) = &item.input.approval_context_id else {
        return Err(AutopoiesisErr::InvalidWorkItem(
            "a continuation must carry approval_context_id".to_string(),
        ));
    };
    let scope = build_approval_scope(approval_context_id, &rt.paths.workspace, &rt.agent_name);
    let results = deserialize_deferred_results(
        results_json,
        &scope,
        &rt.approval_store,
        &rt.key_manager,
    )?;
    Ok(Some(results))
}
