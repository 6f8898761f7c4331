//! Spawning: admission, branch allocation and node creation as one
//! all-or-nothing sequence, plus the per-parent spawn queue.

use std::sync::Arc;

use uuid::Uuid;

use crate::config::SiblingPolicy;
use crate::store::WriteBatch;
use crate::tree::{AgentNode, CoordinationEvent, CoordinationKind, NodeId, NodeStatus, SpawnRequest, Specialization};
use crate::{alog, alog_debug, alog_warn, Result};

use super::branch::GitBranchCoordinator;
use super::context::{TreeContext, TreeState};
use super::engine::{ExecutionEngine, SpawnNotice};
use super::scheduler::{is_queueable, TreeScheduler};

#[derive(Debug, Clone, PartialEq)]
pub enum SpawnOutcome {
    Spawned(AgentNode),
    /// Parked behind the running sibling; admitted automatically later.
    Queued { request_id: Uuid, position: usize },
}

impl SpawnOutcome {
    pub fn spawned(self) -> Option<AgentNode> {
        match self {
            SpawnOutcome::Spawned(node) => Some(node),
            SpawnOutcome::Queued { .. } => None,
        }
    }
}

pub struct SpawnCoordinator {
    ctx: Arc<TreeContext>,
    scheduler: Arc<TreeScheduler>,
    branches: Arc<GitBranchCoordinator>,
    engine: Arc<dyn ExecutionEngine>,
}

impl SpawnCoordinator {
    pub fn new(
        ctx: Arc<TreeContext>,
        scheduler: Arc<TreeScheduler>,
        branches: Arc<GitBranchCoordinator>,
        engine: Arc<dyn ExecutionEngine>,
    ) -> Self {
        Self {
            ctx,
            scheduler,
            branches,
            engine,
        }
    }

    /// Create a new tree. The root starts running in EXPLORE on a fresh
    /// branch cut from `base_branch`.
    pub async fn spawn_root(
        &self,
        task: &str,
        owner: &str,
        base_branch: &str,
        specialization: Specialization,
        max_depth: Option<u32>,
    ) -> Result<AgentNode> {
        let ceiling = self.ctx.config.max_recursion_depth;
        let max_depth = max_depth.map_or(ceiling, |d| d.min(ceiling));
        let mut root = AgentNode::new_root(task, owner, specialization, "", max_depth);
        let _tree = self.ctx.locks.lock(root.id).await?;

        let proposed = self.branches.root_branch_name(root.id);
        root.branch_name = self.branches.create_branch(base_branch, &proposed, root.id).await?;
        root.set_status(NodeStatus::Running)?;

        let mut batch = WriteBatch::new();
        batch.event(CoordinationEvent::new(
            root.id,
            root.id,
            CoordinationKind::NodeSpawned,
            format!("root {} on {} from {}", specialization, root.branch_name, base_branch),
        ));
        batch.create(root.clone());
        if let Err(e) = self.ctx.commit(batch) {
            self.branches.discard_branch(&root.branch_name).await;
            return Err(e);
        }

        alog!("Spawned root {} on {} (max depth {})", root.id, root.branch_name, max_depth);
        self.announce(&root)?;
        self.ctx.store.read_node(root.id)
    }

    /// Request a child of `parent_id`. Under the queue policy a request that
    /// has to wait for a running sibling is parked rather than rejected.
    pub async fn spawn_child(
        &self,
        parent_id: NodeId,
        specialization: Specialization,
        task: &str,
    ) -> Result<SpawnOutcome> {
        self.submit(SpawnRequest::new(parent_id, specialization, task)).await
    }

    pub async fn submit(&self, request: SpawnRequest) -> Result<SpawnOutcome> {
        let tree = self.ctx.lock_tree_of(request.parent_id).await?;
        let queueing = self.scheduler.policy() == SiblingPolicy::Queue;

        // earlier requests keep their turn
        if queueing && !self.ctx.store.read_node(request.parent_id)?.spawn_queue.is_empty() {
            return self.enqueue(&tree, request);
        }

        match self.spawn_locked(&tree, &request, false).await {
            Ok(node) => Ok(SpawnOutcome::Spawned(node)),
            Err(e) if queueing && is_queueable(&e) => {
                alog_debug!("Queueing spawn for {}: {}", request.parent_id, e);
                self.enqueue(&tree, request)
            }
            Err(e) => {
                let mut batch = WriteBatch::new();
                batch.event(CoordinationEvent::new(
                    request.parent_id,
                    tree.root,
                    CoordinationKind::SpawnDenied,
                    format!("{}: {}", request.specialization, e),
                ));
                if let Err(record_err) = self.ctx.commit(batch) {
                    alog_warn!("Failed to record spawn denial: {}", record_err);
                }
                Err(e)
            }
        }
    }

    fn enqueue(&self, tree: &TreeState, request: SpawnRequest) -> Result<SpawnOutcome> {
        let parent_id = request.parent_id;
        let request_id = request.id;
        let detail = format!("request {} ({})", request_id, request.specialization);

        let mut batch = WriteBatch::new();
        let position = self.scheduler.enqueue(&mut batch, request)?;
        batch.event(CoordinationEvent::new(
            parent_id,
            tree.root,
            CoordinationKind::SpawnQueued,
            format!("{} at position {}", detail, position),
        ));
        self.ctx.commit(batch)?;
        Ok(SpawnOutcome::Queued {
            request_id,
            position,
        })
    }

    /// Admit and create one child. Nothing is persisted unless every step
    /// succeeds; the admission slot only exists inside the uncommitted batch.
    /// With `dequeue` the request is the parent's queue head and leaves the
    /// queue in the same batch.
    pub(crate) async fn spawn_locked(
        &self,
        tree: &TreeState,
        request: &SpawnRequest,
        dequeue: bool,
    ) -> Result<AgentNode> {
        let mut batch = WriteBatch::new();
        let admitted = self
            .scheduler
            .admit_spawn(tree, &mut batch, request.parent_id, request.specialization)?;
        if dequeue {
            self.scheduler.pop_queue(&mut batch, request.parent_id)?;
        }
        let parent = self.ctx.current(&batch, request.parent_id)?;
        let max_depth = request
            .max_depth
            .map_or(parent.max_recursion_depth, |d| d.min(parent.max_recursion_depth));

        let child_id = NodeId::new();
        let proposed = self
            .branches
            .child_branch_name(&parent, request.specialization, admitted.execution_order);
        let branch = self
            .branches
            .create_branch(&parent.branch_name, &proposed, child_id)
            .await?;

        let mut child = AgentNode::new_child(
            child_id,
            &parent,
            admitted.execution_order,
            request.specialization,
            &request.task,
            &branch,
            max_depth,
        );
        child.set_status(NodeStatus::Running)?;
        batch.create(child.clone());
        batch.event(CoordinationEvent::new(
            child_id,
            child.root_id,
            CoordinationKind::NodeSpawned,
            format!(
                "{} child #{} of {} on {}",
                request.specialization, admitted.execution_order, parent.id, branch
            ),
        ));
        if dequeue {
            batch.event(CoordinationEvent::new(
                parent.id,
                tree.root,
                CoordinationKind::SpawnDequeued,
                format!("request {} became {}", request.id, child_id),
            ));
        }
        if let Err(e) = self.ctx.commit(batch) {
            self.branches.discard_branch(&branch).await;
            return Err(e);
        }

        alog!(
            "Spawned {} {} under {} (order {}, depth {}) on {}",
            request.specialization,
            child_id,
            parent.id,
            admitted.execution_order,
            admitted.depth,
            branch
        );
        self.announce(&child)?;
        self.ctx.store.read_node(child_id)
    }

    fn announce(&self, node: &AgentNode) -> Result<()> {
        let cancel = self.ctx.signal_for(node)?;
        self.engine.dispatch(SpawnNotice {
            node_id: node.id,
            root_id: node.root_id,
            parent_id: node.parent_id,
            specialization: node.specialization,
            task: node.task.clone(),
            branch_name: node.branch_name.clone(),
            parent_branch_name: node.parent_branch_name.clone(),
            cancel,
        });
        Ok(())
    }

    /// Admit queued requests of `parent_id` in FIFO order until one is
    /// spawned or the head has to keep waiting. Requests that can never be
    /// admitted (depth, phase, terminal parent) are dropped.
    pub(crate) async fn drain_queue(&self, tree: &TreeState, parent_id: NodeId) -> Result<Option<AgentNode>> {
        while let Some(next) = self.scheduler.peek_queue(&WriteBatch::new(), parent_id)? {
            match self.spawn_locked(tree, &next, true).await {
                Ok(node) => return Ok(Some(node)),
                Err(e) if is_queueable(&e) => {
                    alog_debug!("Queue head for {} still waiting: {}", parent_id, e);
                    return Ok(None);
                }
                Err(e) => {
                    alog_warn!("Dropping queued spawn {} for {}: {}", next.id, parent_id, e);
                    let mut batch = WriteBatch::new();
                    self.scheduler.pop_queue(&mut batch, parent_id)?;
                    batch.event(CoordinationEvent::new(
                        parent_id,
                        tree.root,
                        CoordinationKind::SpawnDropped,
                        format!("request {}: {}", next.id, e),
                    ));
                    self.ctx.commit(batch)?;
                }
            }
        }
        Ok(None)
    }

    /// Drop every queued request of a parent that can no longer spawn.
    pub(crate) fn drop_queued(
        &self,
        tree: &TreeState,
        batch: &mut WriteBatch,
        parent_id: NodeId,
        reason: &str,
    ) -> Result<()> {
        for request in self.scheduler.drop_queue(batch, parent_id)? {
            batch.event(CoordinationEvent::new(
                parent_id,
                tree.root,
                CoordinationKind::SpawnDropped,
                format!("request {}: {}", request.id, reason),
            ));
        }
        Ok(())
    }
}
