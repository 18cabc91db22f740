//! Per-agent work queues with single-writer dispatch.
//!
//! One queue per `agent_id`, auto-created on first use; each queue runs at
//! most one work item at a time, which is what serialises every per-agent
//! store (history, checkpoints, envelopes, subscriptions). Distinct agents
//! proceed in parallel. Higher-priority items dequeue first; within a
//! priority, FIFO.

use std::collections::BinaryHeap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use autopoiesis_protocol::WorkItem;
use autopoiesis_protocol::WorkItemOutput;
use tokio::sync::Notify;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;

use crate::error::AutopoiesisErr;
use crate::error::Result;

/// Processes one work item end to end. Implemented by the worker module;
/// injected here so the queue stays free of turn-execution concerns.
#[async_trait]
pub trait WorkHandler: Send + Sync + 'static {
    async fn process(&self, item: WorkItem) -> Result<WorkItemOutput>;
}

struct QueuedEntry {
    priority_rank: u8,
    seq: u64,
    item: WorkItem,
    reply: Option<oneshot::Sender<Result<WorkItemOutput>>>,
}

impl PartialEq for QueuedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority_rank == other.priority_rank && self.seq == other.seq
    }
}
impl Eq for QueuedEntry {}

impl Ord for QueuedEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher priority first, then lower sequence (FIFO).
        self.priority_rank
            .cmp(&other.priority_rank)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for QueuedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<QueuedEntry>,
    cancelled: HashSet<String>,
    next_seq: u64,
}

struct AgentQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    in_flight: Mutex<Option<(String, CancellationToken)>>,
}

impl AgentQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            in_flight: Mutex::new(None),
        }
    }

    fn push(&self, item: WorkItem, reply: Option<oneshot::Sender<Result<WorkItemOutput>>>) {
        {
            let mut state = self.lock_state();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.heap.push(QueuedEntry {
                priority_rank: item.priority.rank(),
                seq,
                item,
                reply,
            });
        }
        self.notify.notify_one();
    }

    // Poisoned mutex means a panic mid-mutation; propagate it.
    #[allow(clippy::unwrap_used)]
    fn lock_state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap()
    }

    #[allow(clippy::unwrap_used)]
    fn lock_in_flight(
        &self,
    ) -> std::sync::MutexGuard<'_, Option<(String, CancellationToken)>> {
        self.in_flight.lock().unwrap()
    }
}

/// Process-wide `agent_id → queue` map. Singleton by convention: created at
/// process start, reset explicitly in tests.
pub struct WorkQueueRegistry {
    queues: Mutex<HashMap<String, Arc<AgentQueue>>>,
    handler: Arc<dyn WorkHandler>,
}

impl WorkQueueRegistry {
    pub fn new(handler: Arc<dyn WorkHandler>) -> Arc<Self> {
        Arc::new(Self {
            queues: Mutex::new(HashMap::new()),
            handler,
        })
    }

    /// Enqueue without waiting. Failures of the item are logged by the
    /// worker; the submitter learns nothing.
    pub fn enqueue(self: &Arc<Self>, item: WorkItem) {
        self.queue_for(&item.agent_id).push(item, None);
    }

    /// Enqueue and block until the worker returns an output or propagates a
    /// failure.
    pub async fn enqueue_and_wait(self: &Arc<Self>, item: WorkItem) -> Result<WorkItemOutput> {
        let (tx, rx) = oneshot::channel();
        self.queue_for(&item.agent_id).push(item, Some(tx));
        rx.await.map_err(|_| AutopoiesisErr::InternalAgentDied)?
    }

    /// Best-effort cancellation: a queued item is dropped; an in-flight one
    /// is cancelled at its next suspension point.
    pub fn cancel(self: &Arc<Self>, agent_id: &str, work_item_id: &str) {
        let queue = self.queue_for(agent_id);
        queue
            .lock_state()
            .cancelled
            .insert(work_item_id.to_string());
        if let Some((current_id, token)) = queue.lock_in_flight().as_ref()
            && current_id.as_str() == work_item_id
        {
            token.cancel();
        }
    }

    fn queue_for(self: &Arc<Self>, agent_id: &str) -> Arc<AgentQueue> {
        let mut queues = self.lock_queues();
        if let Some(queue) = queues.get(agent_id) {
            return Arc::clone(queue);
        }
        let queue = Arc::new(AgentQueue::new());
        queues.insert(agent_id.to_string(), Arc::clone(&queue));
        debug!(agent_id, "created agent work queue");
        tokio::spawn(queue_worker(
            Arc::clone(&queue),
            Arc::clone(&self.handler),
            agent_id.to_string(),
        ));
        queue
    }

    fn lock_queues(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<AgentQueue>>> {
        // Poisoned mutex means a panic mid-mutation; propagate it.
        #[allow(clippy::unwrap_used)]
        self.queues.lock().unwrap()
    }
}

/// One worker per agent queue: concurrency = 1 by construction.
async fn queue_worker(queue: Arc<AgentQueue>, handler: Arc<dyn WorkHandler>, agent_id: String) {
    loop {
        let entry = {
            let mut state = queue.lock_state();
            match state.heap.pop() {
                Some(entry) => {
                    if state.cancelled.remove(&entry.item.id) {
                        if let Some(reply) = entry.reply {
                            let _ = reply.send(Err(AutopoiesisErr::Cancelled));
                        }
                        continue;
                    }
                    Some(entry)
                }
                None => None,
            }
        };
        let Some(entry) = entry else {
            queue.notify.notified().await;
            continue;
        };

        let token = CancellationToken::new();
        *queue.lock_in_flight() = Some((entry.item.id.clone(), token.clone()));

        let item_id = entry.item.id.clone();
        let result = tokio::select! {
            result = handler.process(entry.item) => result,
            _ = token.cancelled() => Err(AutopoiesisErr::Cancelled),
        };

        *queue.lock_in_flight() = None;
        match entry.reply {
            Some(reply) => {
                let _ = reply.send(result);
            }
            None => {
                if let Err(err) = result {
                    error!(agent_id, work_item_id = %item_id, "work item failed: {err}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use std::time::Duration;

    use autopoiesis_protocol::Priority;
    use autopoiesis_protocol::WorkItemInput;
    use autopoiesis_protocol::WorkItemType;
    use tokio::sync::Mutex as AsyncMutex;

    use super::*;

    fn item(id: &str, agent: &str, priority: Priority) -> WorkItem {
        WorkItem {
            id: id.to_string(),
            item_type: WorkItemType::Chat,
            priority,
            agent_id: agent.to_string(),
            topic_ref: None,
            input: WorkItemInput {
                prompt: Some("hi".to_string()),
                ..Default::default()
            },
        }
    }

    fn output(id: &str) -> WorkItemOutput {
        WorkItemOutput {
            text: Some(id.to_string()),
            deferred_tool_requests_json: None,
            message_history_json: "[]".to_string(),
        }
    }

    /// Records processing order; optionally stalls per item.
    struct RecordingHandler {
        order: AsyncMutex<Vec<String>>,
        delay: Duration,
    }

    #[async_trait]
    impl WorkHandler for RecordingHandler {
        async fn process(&self, item: WorkItem) -> Result<WorkItemOutput> {
            tokio::time::sleep(self.delay).await;
            self.order.lock().await.push(item.id.clone());
            Ok(output(&item.id))
        }
    }

    #[tokio::test]
    async fn enqueue_and_wait_returns_the_output() {
        let handler = Arc::new(RecordingHandler {
            order: AsyncMutex::new(Vec::new()),
            delay: Duration::ZERO,
        });
        let registry = WorkQueueRegistry::new(handler);
        let out = registry
            .enqueue_and_wait(item("w1", "alpha", Priority::Normal))
            .await
            .unwrap();
        assert_eq!(out.text.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn higher_priority_dequeues_first() {
        let handler = Arc::new(RecordingHandler {
            order: AsyncMutex::new(Vec::new()),
            delay: Duration::from_millis(30),
        });
        let registry = WorkQueueRegistry::new(Arc::clone(&handler) as Arc<dyn WorkHandler>);

        // First item occupies the worker while the rest pile up.
        registry.enqueue(item("first", "alpha", Priority::Normal));
        tokio::time::sleep(Duration::from_millis(5)).await;
        registry.enqueue(item("low", "alpha", Priority::Low));
        registry.enqueue(item("normal", "alpha", Priority::Normal));
        registry.enqueue(item("critical", "alpha", Priority::Critical));
        let out = registry
            .enqueue_and_wait(item("tail", "alpha", Priority::Low))
            .await
            .unwrap();
        assert_eq!(out.text.as_deref(), Some("tail"));

        let order = handler.order.lock().await.clone();
        assert_eq!(order, vec!["first", "critical", "normal", "low", "tail"]);
    }

    #[tokio::test]
    async fn fifo_within_one_priority() {
        let handler = Arc::new(RecordingHandler {
            order: AsyncMutex::new(Vec::new()),
            delay: Duration::from_millis(20),
        });
        let registry = WorkQueueRegistry::new(Arc::clone(&handler) as Arc<dyn WorkHandler>);

        registry.enqueue(item("a", "alpha", Priority::Normal));
        tokio::time::sleep(Duration::from_millis(5)).await;
        registry.enqueue(item("b", "alpha", Priority::Normal));
        registry.enqueue(item("c", "alpha", Priority::Normal));
        let _ = registry
            .enqueue_and_wait(item("d", "alpha", Priority::Normal))
            .await
            .unwrap();

        let order = handler.order.lock().await.clone();
        assert_eq!(order, vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn cross_agent_work_is_parallel() {
        struct SlowHandler;
        #[async_trait]
        impl WorkHandler for SlowHandler {
            async fn process(&self, item: WorkItem) -> Result<WorkItemOutput> {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(output(&item.id))
            }
        }
        let registry = WorkQueueRegistry::new(Arc::new(SlowHandler));
        let start = std::time::Instant::now();
        let (a, b) = tokio::join!(
            registry.enqueue_and_wait(item("a", "alpha", Priority::Normal)),
            registry.enqueue_and_wait(item("b", "beta", Priority::Normal)),
        );
        a.unwrap();
        b.unwrap();
        // Two agents at ~50ms each in parallel finish well under 100ms.
        assert!(start.elapsed() < Duration::from_millis(95));
    }

    #[tokio::test]
    async fn queued_cancellation_drops_the_item() {
        let handler = Arc::new(RecordingHandler {
            order: AsyncMutex::new(Vec::new()),
            delay: Duration::from_millis(40),
        });
        let registry = WorkQueueRegistry::new(Arc::clone(&handler) as Arc<dyn WorkHandler>);

        registry.enqueue(item("busy", "alpha", Priority::Normal));
        tokio::time::sleep(Duration::from_millis(5)).await;

        let (tx, rx) = oneshot::channel();
        registry
            .queue_for("alpha")
            .push(item("victim", "alpha", Priority::Normal), Some(tx));
        registry.cancel("alpha", "victim");

        assert!(matches!(rx.await.unwrap(), Err(AutopoiesisErr::Cancelled)));
        let order = handler.order.lock().await.clone();
        assert!(!order.contains(&"victim".to_string()));
    }

    #[tokio::test]
    async fn in_flight_cancellation_lands_at_a_suspension_point() {
        struct StallingHandler;
        #[async_trait]
        impl WorkHandler for StallingHandler {
            async fn process(&self, item: WorkItem) -> Result<WorkItemOutput> {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(output(&item.id))
            }
        }
        let registry = WorkQueueRegistry::new(Arc::new(StallingHandler));

        let registry_clone = Arc::clone(&registry);
        let wait = tokio::spawn(async move {
            registry_clone
                .enqueue_and_wait(item("stuck", "alpha", Priority::Normal))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.cancel("alpha", "stuck");

        let result = tokio::time::timeout(Duration::from_secs(1), wait)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(AutopoiesisErr::Cancelled)));
    }
}
