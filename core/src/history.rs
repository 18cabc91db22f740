//! The fixed, order-sensitive history-processor pipeline applied before
//! each turn: truncate oversized tool returns, compact on token pressure,
//! materialise subscriptions, inject topic context, checkpoint.

use std::path::PathBuf;
use std::sync::Arc;

use autopoiesis_protocol::Message;

use crate::checkpoint::checkpoint_processor;
use crate::config::ContextConfig;
use crate::context::compact_history;
use crate::subscriptions::SubscriptionRegistry;
use crate::subscriptions::materialize_subscriptions;
use crate::topics::TopicRegistry;
use crate::topics::inject_topic_context;
use crate::truncation::truncate_tool_results;

/// Messages preserved verbatim through compaction.
pub const DEFAULT_KEEP_RECENT: usize = 10;

#[derive(Clone)]
pub struct HistoryPipeline {
    pub context: ContextConfig,
    pub keep_recent: usize,
    pub max_tool_result_bytes: usize,
    pub tmp_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub knowledge_dir: PathBuf,
    pub subscriptions: Arc<SubscriptionRegistry>,
    pub topics: Arc<TopicRegistry>,
}

impl HistoryPipeline {
    /// Apply the full pipeline. The checkpoint step writes under the work
    /// item bound by [`crate::checkpoint::with_checkpoint_scope`], making
    /// this call the single path through which active history mutations
    /// reach disk.
    pub fn process(&self, messages: Vec<Message>) -> Vec<Message> {
        let messages =
            truncate_tool_results(messages, &self.tmp_dir, self.max_tool_result_bytes);
        let messages = compact_history(messages, &self.context, self.keep_recent);
        let messages = materialize_subscriptions(
            messages,
            &self.subscriptions,
            &self.workspace_root,
            &self.knowledge_dir,
        );
        let messages = inject_topic_context(messages, &self.topics);
        checkpoint_processor(messages)
    }
}
