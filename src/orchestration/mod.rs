//! Orchestration layer for the agent tree.
//!
//! Components are leaf-first: the scheduler and phase machine only touch
//! node state, the branch coordinator adds git, the spawn coordinator
//! combines admission with branch and node creation, and the propagator
//! drives cascades. `Orchestrator` wires them over one shared
//! `TreeContext` and is the entry point for callers.

mod audit;
mod branch;
mod context;
mod cost;
mod engine;
mod ledger;
mod phase;
mod propagator;
mod scheduler;
mod spawn;

use std::sync::Arc;

use crossbeam_channel::Sender;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::git::VersionControl;
use crate::store::{MemoryStore, NodeStore};
use crate::tree::{AgentNode, CompletionReport, NodeId, Phase, PhaseReport, PhaseTransition, Specialization, TreeEvent};
use crate::{Error, Result};

pub use audit::{check_tree, TreeAuditor};
pub use branch::{GitBranchCoordinator, MergeResult};
pub use context::{Delivery, Signals, TreeContext, TreeGuard, TreeLocks, TreeState};
pub use crate::tree::SpawnRequest;
pub use cost::{CostAggregator, Usage, UsageReceipt};
pub use engine::{ChannelEngine, ChildNotice, EngineMessage, ExecutionEngine, NullEngine, SpawnNotice};
pub use ledger::{BudgetLedger, CreditLedger, LedgerDenial, UnlimitedLedger};
pub use phase::PhaseStateMachine;
pub use propagator::{Completion, ExecutionResultPropagator, MergeRetry, Termination};
pub use scheduler::{is_queueable, Admitted, TreeScheduler};
pub use spawn::{SpawnCoordinator, SpawnOutcome};

pub struct Orchestrator {
    ctx: Arc<TreeContext>,
    scheduler: Arc<TreeScheduler>,
    phases: PhaseStateMachine,
    branches: Arc<GitBranchCoordinator>,
    spawner: Arc<SpawnCoordinator>,
    propagator: Arc<ExecutionResultPropagator>,
    costs: CostAggregator,
    auditor: TreeAuditor,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    pub fn context(&self) -> &Arc<TreeContext> {
        &self.ctx
    }

    pub fn config(&self) -> &Config {
        self.ctx.config()
    }

    pub fn store(&self) -> &Arc<dyn NodeStore> {
        self.ctx.store()
    }

    pub fn scheduler(&self) -> &TreeScheduler {
        &self.scheduler
    }

    pub fn phases(&self) -> &PhaseStateMachine {
        &self.phases
    }

    pub fn branches(&self) -> &GitBranchCoordinator {
        &self.branches
    }

    pub fn spawner(&self) -> &SpawnCoordinator {
        &self.spawner
    }

    pub fn propagator(&self) -> &ExecutionResultPropagator {
        &self.propagator
    }

    pub fn costs(&self) -> &CostAggregator {
        &self.costs
    }

    pub fn auditor(&self) -> &TreeAuditor {
        &self.auditor
    }

    /// Signal that fires when `node` or any of its ancestors is cancelled
    /// or failed. The engine uses it to interrupt in-flight work. Live nodes
    /// loaded from a persisted store get theirs on first request; terminal
    /// nodes have none.
    pub fn cancellation_token(&self, node: NodeId) -> Option<CancellationToken> {
        if let Some(token) = self.ctx.signals.token(node) {
            return Some(token);
        }
        let stored = self.ctx.store().read_node(node).ok()?;
        if stored.status.is_terminal() {
            return None;
        }
        self.ctx.signal_for(&stored).ok()
    }

    pub async fn spawn_root(
        &self,
        task: &str,
        owner: &str,
        base_branch: &str,
        specialization: Specialization,
        max_depth: Option<u32>,
    ) -> Result<AgentNode> {
        self.spawner
            .spawn_root(task, owner, base_branch, specialization, max_depth)
            .await
    }

    pub async fn spawn_child(
        &self,
        parent_id: NodeId,
        specialization: Specialization,
        task: &str,
    ) -> Result<SpawnOutcome> {
        self.spawner.spawn_child(parent_id, specialization, task).await
    }

    pub async fn advance(
        &self,
        node_id: NodeId,
        to: Phase,
        report: PhaseReport,
        seq: u64,
    ) -> Result<Delivery<PhaseTransition>> {
        self.phases.advance(node_id, to, report, seq).await
    }

    pub async fn record_usage(&self, node_id: NodeId, usage: Usage, seq: u64) -> Result<Delivery<UsageReceipt>> {
        self.costs.record_usage(node_id, usage, seq).await
    }

    pub async fn complete(
        &self,
        node_id: NodeId,
        report: CompletionReport,
        seq: u64,
    ) -> Result<Delivery<Completion>> {
        self.propagator.complete(node_id, report, seq).await
    }

    pub async fn fail(&self, node_id: NodeId, reason: &str, seq: Option<u64>) -> Result<Delivery<Termination>> {
        self.propagator.fail(node_id, reason, seq).await
    }

    pub async fn cancel(&self, node_id: NodeId, reason: &str, seq: Option<u64>) -> Result<Delivery<Termination>> {
        self.propagator.cancel(node_id, reason, seq).await
    }

    pub async fn retry_merge(&self, child_id: NodeId) -> Result<MergeRetry> {
        self.propagator.retry_merge(child_id).await
    }

    pub async fn verify_tree(&self, root_id: NodeId) -> Result<()> {
        self.auditor.verify_tree(root_id).await
    }

    pub fn subtree(&self, node_id: NodeId) -> Result<Vec<AgentNode>> {
        self.ctx.store().read_subtree(node_id)
    }
}

/// Builds an `Orchestrator`. Only the version control backend is required;
/// the rest defaults to an in-memory store, no engine, and unlimited credit.
#[derive(Default)]
pub struct OrchestratorBuilder {
    config: Option<Config>,
    store: Option<Arc<dyn NodeStore>>,
    vcs: Option<Arc<dyn VersionControl>>,
    engine: Option<Arc<dyn ExecutionEngine>>,
    ledger: Option<Arc<dyn CreditLedger>>,
    sink: Option<Sender<TreeEvent>>,
}

impl OrchestratorBuilder {
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn store(mut self, store: Arc<dyn NodeStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn vcs(mut self, vcs: Arc<dyn VersionControl>) -> Self {
        self.vcs = Some(vcs);
        self
    }

    pub fn engine(mut self, engine: Arc<dyn ExecutionEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn ledger(mut self, ledger: Arc<dyn CreditLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn sink(mut self, sink: Sender<TreeEvent>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        let vcs = self
            .vcs
            .ok_or_else(|| Error::Validation("orchestrator needs a version control backend".to_string()))?;
        let store = self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let engine = self.engine.unwrap_or_else(|| Arc::new(NullEngine));
        let ledger = self.ledger.unwrap_or_else(|| Arc::new(UnlimitedLedger));

        let ctx = Arc::new(TreeContext::new(store, config, self.sink));
        let scheduler = Arc::new(TreeScheduler::new(Arc::clone(&ctx)));
        let branches = Arc::new(GitBranchCoordinator::new(Arc::clone(&ctx), vcs));
        let spawner = Arc::new(SpawnCoordinator::new(
            Arc::clone(&ctx),
            Arc::clone(&scheduler),
            Arc::clone(&branches),
            Arc::clone(&engine),
        ));
        let propagator = Arc::new(ExecutionResultPropagator::new(
            Arc::clone(&ctx),
            Arc::clone(&scheduler),
            Arc::clone(&branches),
            Arc::clone(&spawner),
            engine,
        ));
        Ok(Orchestrator {
            phases: PhaseStateMachine::new(Arc::clone(&ctx)),
            costs: CostAggregator::new(Arc::clone(&ctx), ledger, Arc::clone(&propagator)),
            auditor: TreeAuditor::new(Arc::clone(&ctx)),
            ctx,
            scheduler,
            branches,
            spawner,
            propagator,
        })
    }
}
