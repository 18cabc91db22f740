//! Per-agent runtime bundles and the process-wide registry that maps
//! `agent_id → Runtime`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use crate::approval::keys::ApprovalKeyManager;
use crate::approval::store::ApprovalStore;
use crate::checkpoint::CheckpointStore;
use crate::client_common::ModelClient;
use crate::config::ContextConfig;
use crate::config::LoopGuards;
use crate::error::AutopoiesisErr;
use crate::error::Result;
use crate::exec::SandboxLimits;
use crate::history::DEFAULT_KEEP_RECENT;
use crate::history::HistoryPipeline;
use crate::subscriptions::SubscriptionRegistry;
use crate::tools::ToolPolicyRegistry;
use crate::topics::TopicRegistry;
use crate::truncation::DEFAULT_MAX_TOOL_RESULT_BYTES;
use crate::workspace::AgentPaths;
use crate::workspace::resolve_agent_workspace;
use crate::workspace::resolve_agent_workspace_in;

/// Everything one agent's turns need: workspace paths, stores, keys, tool
/// policy, model client and budgets. Created at first use per agent id and
/// reused thereafter.
pub struct Runtime {
    pub agent_name: String,
    pub paths: AgentPaths,
    pub approval_store: Arc<ApprovalStore>,
    pub key_manager: Arc<ApprovalKeyManager>,
    pub checkpoints: Arc<CheckpointStore>,
    pub subscriptions: Arc<SubscriptionRegistry>,
    pub topics: Arc<TopicRegistry>,
    pub tool_policy: ToolPolicyRegistry,
    pub client: Arc<dyn ModelClient>,
    pub instructions: Option<String>,
    pub loop_guards: LoopGuards,
    pub context: ContextConfig,
    pub sandbox_limits: SandboxLimits,
}

/// Construction options; everything except the client has a sensible
/// default resolved from the environment.
pub struct RuntimeOptions {
    pub agent_name: String,
    /// Overrides `AUTOPOIESIS_HOME` resolution when set (tests).
    pub home: Option<PathBuf>,
    pub client: Arc<dyn ModelClient>,
    pub instructions: Option<String>,
    pub loop_guards: LoopGuards,
    pub context: ContextConfig,
    pub sandbox_limits: SandboxLimits,
}

impl RuntimeOptions {
    pub fn new(agent_name: impl Into<String>, client: Arc<dyn ModelClient>) -> Self {
        Self {
            agent_name: agent_name.into(),
            home: None,
            client,
            instructions: None,
            loop_guards: LoopGuards::default(),
            context: ContextConfig::default(),
            sandbox_limits: SandboxLimits::default(),
        }
    }
}

impl Runtime {
    pub fn initialize(options: RuntimeOptions) -> Result<Arc<Self>> {
        let paths = match &options.home {
            Some(home) => resolve_agent_workspace_in(home, &options.agent_name)?,
            None => resolve_agent_workspace(Some(&options.agent_name))?,
        };
        paths.ensure_layout()?;

        let approval_store = Arc::new(ApprovalStore::open(paths.approval_db())?);
        let key_manager = Arc::new(ApprovalKeyManager::open(&paths.keys)?);
        let checkpoints = Arc::new(CheckpointStore::open(paths.history_db())?);
        let subscriptions = Arc::new(SubscriptionRegistry::open(paths.subscriptions_db())?);

        Ok(Arc::new(Self {
            agent_name: options.agent_name,
            paths,
            approval_store,
            key_manager,
            checkpoints,
            subscriptions,
            topics: Arc::new(TopicRegistry::new()),
            tool_policy: ToolPolicyRegistry::default(),
            client: options.client,
            instructions: options.instructions,
            loop_guards: options.loop_guards,
            context: options.context,
            sandbox_limits: options.sandbox_limits,
        }))
    }

    /// The worker-side approval gate: an initialised keyring is what lets
    /// non-free commands defer into the envelope flow.
    pub fn approval_available(&self) -> bool {
        self.key_manager.has_keys()
    }

    /// Assemble the fixed history pipeline for this agent.
    pub fn pipeline(&self) -> HistoryPipeline {
        HistoryPipeline {
            context: self.context,
            keep_recent: DEFAULT_KEEP_RECENT,
            max_tool_result_bytes: DEFAULT_MAX_TOOL_RESULT_BYTES,
            tmp_dir: self.paths.tmp.clone(),
            workspace_root: self.paths.workspace.clone(),
            knowledge_dir: self.paths.knowledge.clone(),
            subscriptions: Arc::clone(&self.subscriptions),
            topics: Arc::clone(&self.topics),
        }
    }
}

const DEFAULT_KEY: &str = "__default__";

/// Thread-safe `agent_id → Runtime` map with explicit reset for tests.
#[derive(Default)]
pub struct AgentRegistry {
    runtimes: Mutex<HashMap<String, Arc<Runtime>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `runtime` under `agent_id`, replacing any existing entry.
    pub fn register(&self, agent_id: &str, runtime: Arc<Runtime>) {
        self.lock_runtimes()
            .insert(agent_id.to_string(), runtime);
    }

    /// Store `runtime` under the default sentinel, for call-sites that do
    /// not carry an agent id.
    pub fn set_default(&self, runtime: Arc<Runtime>) {
        self.register(DEFAULT_KEY, runtime);
    }

    /// Resolve a runtime.
    ///
    /// With an `agent_id`, exact lookup. Without one: the sole registered
    /// runtime if exactly one exists; otherwise the default sentinel;
    /// otherwise an error asking for an explicit id.
    pub fn get(&self, agent_id: Option<&str>) -> Result<Arc<Runtime>> {
        let runtimes = self.lock_runtimes();
        if let Some(agent_id) = agent_id {
            return runtimes
                .get(agent_id)
                .cloned()
                .ok_or_else(|| AutopoiesisErr::UnknownAgent(agent_id.to_string()));
        }
        if runtimes.is_empty() {
            return Err(AutopoiesisErr::UnknownAgent(
                "runtime not initialised".to_string(),
            ));
        }
        if runtimes.len() == 1 {
            if let Some(runtime) = runtimes.values().next() {
                return Ok(Arc::clone(runtime));
            }
        }
        if let Some(runtime) = runtimes.get(DEFAULT_KEY) {
            return Ok(Arc::clone(runtime));
        }
        let mut visible: Vec<&str> = runtimes
            .keys()
            .filter(|k| k.as_str() != DEFAULT_KEY)
            .map(String::as_str)
            .collect();
        visible.sort_unstable();
        Err(AutopoiesisErr::AmbiguousRuntime(visible.join(", ")))
    }

    /// Resolve or lazily create the runtime for `agent_id`.
    pub fn get_or_init<F>(&self, agent_id: &str, init: F) -> Result<Arc<Runtime>>
    where
        F: FnOnce() -> Result<Arc<Runtime>>,
    {
        if let Some(runtime) = self.lock_runtimes().get(agent_id) {
            return Ok(Arc::clone(runtime));
        }
        // Initialisation happens outside the lock; a concurrent first-use
        // race resolves to whichever registration lands last, which is
        // harmless because both point at the same on-disk stores.
        let runtime = init()?;
        self.register(agent_id, Arc::clone(&runtime));
        Ok(runtime)
    }

    /// Registered agent ids, excluding the default sentinel.
    pub fn list_agents(&self) -> Vec<String> {
        let mut agents: Vec<String> = self
            .lock_runtimes()
            .keys()
            .filter(|k| k.as_str() != DEFAULT_KEY)
            .cloned()
            .collect();
        agents.sort_unstable();
        agents
    }

    /// Clear the registry, or a single agent's entry. Test isolation hook.
    pub fn reset(&self, agent_id: Option<&str>) {
        let mut runtimes = self.lock_runtimes();
        match agent_id {
            Some(agent_id) => {
                runtimes.remove(agent_id);
            }
            None => runtimes.clear(),
        }
    }

    // Poisoned mutex means a panic mid-mutation; propagate it.
    #[allow(clippy::unwrap_used)]
    fn lock_runtimes(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Runtime>>> {
        self.runtimes.lock().unwrap()
    }
}
