//! Final node outcomes and their cascade: cancellation flows down to every
//! live descendant before the node itself turns terminal, then the parent
//! is told and may admit its next queued child. A terminal node's signal
//! is fired (or just dropped, on completion) once its batch is committed.

use std::sync::Arc;

use crate::config::FailurePolicy;
use crate::error::TransitionError;
use crate::store::WriteBatch;
use crate::tree::{
    AgentNode, CompletionReport, CoordinationEvent, CoordinationKind, MergeStatus, NodeId, NodeStatus, Phase,
    SpawnRequest,
};
use crate::{alog, alog_debug, alog_warn, Error, Result};

use super::branch::{GitBranchCoordinator, MergeResult};
use super::context::{Delivery, TreeContext, TreeState};
use super::engine::{ChildNotice, ExecutionEngine};
use super::scheduler::TreeScheduler;
use super::spawn::SpawnCoordinator;

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub node: AgentNode,
    /// `None` for the root, or when the merge attempt itself errored.
    pub merge: Option<MergeResult>,
    pub merge_error: Option<String>,
    /// Queued sibling admitted as a consequence of this completion.
    pub next_spawned: Option<AgentNode>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Termination {
    pub node: AgentNode,
    /// Live descendants cancelled by the cascade, deepest first.
    pub cancelled_descendants: Vec<NodeId>,
    /// Ancestors failed under `FailurePolicy::FailParent`.
    pub escalated: Vec<NodeId>,
    pub next_spawned: Option<AgentNode>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeRetry {
    pub merge: MergeResult,
    pub next_spawned: Option<AgentNode>,
}

pub struct ExecutionResultPropagator {
    ctx: Arc<TreeContext>,
    scheduler: Arc<TreeScheduler>,
    branches: Arc<GitBranchCoordinator>,
    spawner: Arc<SpawnCoordinator>,
    engine: Arc<dyn ExecutionEngine>,
}

impl ExecutionResultPropagator {
    pub fn new(
        ctx: Arc<TreeContext>,
        scheduler: Arc<TreeScheduler>,
        branches: Arc<GitBranchCoordinator>,
        spawner: Arc<SpawnCoordinator>,
        engine: Arc<dyn ExecutionEngine>,
    ) -> Self {
        Self {
            ctx,
            scheduler,
            branches,
            spawner,
            engine,
        }
    }

    /// Mark a node completed and release the parent's slot in one batch,
    /// then merge it into its parent. A merge conflict or git error leaves
    /// the node completed but unmerged; `retry_merge` picks it up from
    /// there. Until then the unmerged child keeps the parent's queue parked.
    pub async fn complete(
        &self,
        node_id: NodeId,
        report: CompletionReport,
        seq: u64,
    ) -> Result<Delivery<Completion>> {
        let tree = self.ctx.lock_tree_of(node_id).await?;
        let mut node = self.ctx.store.read_node(node_id)?;
        if seq <= node.last_seq {
            alog_warn!("complete: duplicate delivery seq={} for node {}", seq, node_id);
            return Ok(Delivery::Duplicate);
        }
        if node.phase != Phase::Complete {
            return Err(TransitionError::PhaseViolation {
                node: node_id,
                reason: format!("completion requires phase complete, node is in {}", node.phase),
            }
            .into());
        }
        if node.active_child_count > 0 {
            return Err(TransitionError::PhaseViolation {
                node: node_id,
                reason: format!("{} child(ren) still active", node.active_child_count),
            }
            .into());
        }
        report.validate()?;

        node.accept_seq(seq);
        node.set_status(NodeStatus::Completed)?;
        node.completion_result = Some(report);
        let mut batch = WriteBatch::new();
        batch.event(CoordinationEvent::new(
            node_id,
            node.root_id,
            CoordinationKind::NodeCompleted,
            node.completion_result
                .as_ref()
                .map(|r| r.summary.clone())
                .unwrap_or_default(),
        ));
        batch.update(node.clone());
        let next = self.scheduler.on_child_terminal(&mut batch, &node)?;
        self.ctx.commit(batch)?;
        self.ctx.signals.forget(node_id);
        alog!("Node {} completed", node_id);

        let Some(parent_id) = node.parent_id else {
            let node = self.ctx.store.read_node(node_id)?;
            self.ctx.release(tree)?;
            return Ok(Delivery::Applied(Completion {
                node,
                merge: None,
                merge_error: None,
                next_spawned: None,
            }));
        };

        let (merge, merge_error) = match self.branches.merge_to_parent(&tree, node_id).await {
            Ok(result) => (Some(result), None),
            Err(e) => {
                alog_warn!("Merge-back of {} failed, left unmerged: {}", node_id, e);
                (None, Some(e.to_string()))
            }
        };

        self.engine.child_terminal(ChildNotice {
            parent_id,
            child_id: node_id,
            status: NodeStatus::Completed,
            reason: None,
        });

        let next_spawned = self.admit_next(&tree, parent_id, next).await?;
        Ok(Delivery::Applied(Completion {
            node: self.ctx.store.read_node(node_id)?,
            merge,
            merge_error,
            next_spawned,
        }))
    }

    /// Fail a node in any phase. Live descendants are cancelled first.
    pub async fn fail(&self, node_id: NodeId, reason: &str, seq: Option<u64>) -> Result<Delivery<Termination>> {
        self.terminate(node_id, NodeStatus::Failed, reason, seq).await
    }

    pub async fn cancel(&self, node_id: NodeId, reason: &str, seq: Option<u64>) -> Result<Delivery<Termination>> {
        self.terminate(node_id, NodeStatus::Cancelled, reason, seq).await
    }

    async fn terminate(
        &self,
        node_id: NodeId,
        target: NodeStatus,
        reason: &str,
        seq: Option<u64>,
    ) -> Result<Delivery<Termination>> {
        let tree = self.ctx.lock_tree_of(node_id).await?;
        let Some((node, mut cancelled, mut next)) = self.terminate_locked(&tree, node_id, target, reason, seq)? else {
            return Ok(Delivery::Duplicate);
        };

        let escalate = target == NodeStatus::Failed && self.ctx.config.failure_policy == FailurePolicy::FailParent;
        let mut escalated = Vec::new();
        let mut current = node.clone();
        let mut next_spawned = None;
        while let Some(parent_id) = current.parent_id {
            if escalate {
                let cause = format!("child {} failed: {}", current.id, reason);
                match self.terminate_locked(&tree, parent_id, NodeStatus::Failed, &cause, None)? {
                    Some((parent, more, _)) => {
                        escalated.push(parent.id);
                        cancelled.extend(more);
                        current = parent;
                        continue;
                    }
                    None => break,
                }
            }
            self.engine.child_terminal(ChildNotice {
                parent_id,
                child_id: current.id,
                status: current.status,
                reason: current.failure_reason.clone(),
            });
            next_spawned = self.admit_next(&tree, parent_id, next.take()).await?;
            break;
        }

        let node = self.ctx.store.read_node(node_id)?;
        self.ctx.release(tree)?;
        Ok(Delivery::Applied(Termination {
            node,
            cancelled_descendants: cancelled,
            escalated,
            next_spawned,
        }))
    }

    /// Terminate one node and cascade down, all in one committed batch.
    /// Returns `None` if the node was already terminal or `seq` is stale.
    #[allow(clippy::type_complexity)]
    fn terminate_locked(
        &self,
        tree: &TreeState,
        node_id: NodeId,
        target: NodeStatus,
        reason: &str,
        seq: Option<u64>,
    ) -> Result<Option<(AgentNode, Vec<NodeId>, Option<SpawnRequest>)>> {
        let stored = self.ctx.store.read_node(node_id)?;
        if seq.is_some_and(|s| s <= stored.last_seq) || stored.status.is_terminal() {
            alog_warn!(
                "Ignoring {} for node {}: already {} (last_seq={})",
                target,
                node_id,
                stored.status,
                stored.last_seq
            );
            return Ok(None);
        }

        let mut batch = WriteBatch::new();
        let cancelled = self.cascade_cancel(tree, &mut batch, &stored, reason)?;
        self.spawner
            .drop_queued(tree, &mut batch, node_id, &format!("parent {}", target))?;

        let mut node = self.ctx.current(&batch, node_id)?;
        if let Some(seq) = seq {
            node.accept_seq(seq);
        }
        node.set_status(target)?;
        node.failure_reason = Some(reason.to_string());
        let kind = match target {
            NodeStatus::Failed => CoordinationKind::NodeFailed,
            _ => CoordinationKind::NodeCancelled,
        };
        batch.event(CoordinationEvent::new(node_id, node.root_id, kind, reason));
        batch.update(node.clone());
        let next = self.scheduler.on_child_terminal(&mut batch, &node)?;
        self.ctx.commit(batch)?;

        self.ctx.signals.cancel(node_id);
        for id in &cancelled {
            self.ctx.signals.cancel(*id);
        }
        alog!(
            "Node {} {}: {} ({} descendant(s) cancelled)",
            node_id,
            target,
            reason,
            cancelled.len()
        );
        Ok(Some((node, cancelled, next)))
    }

    /// Cancel every live descendant of `node`, deepest first, keeping each
    /// parent's active count in step.
    fn cascade_cancel(
        &self,
        tree: &TreeState,
        batch: &mut WriteBatch,
        node: &AgentNode,
        reason: &str,
    ) -> Result<Vec<NodeId>> {
        let subtree = self.ctx.store.read_subtree(node.id)?;
        let mut cancelled = Vec::new();
        for descendant in subtree.iter().skip(1).rev() {
            self.spawner
                .drop_queued(tree, batch, descendant.id, &format!("ancestor {} terminated", node.id))?;
            let mut current = self.ctx.current(batch, descendant.id)?;
            if current.status.is_terminal() {
                continue;
            }
            current.set_status(NodeStatus::Cancelled)?;
            current.failure_reason = Some(format!("ancestor {} terminated: {}", node.id, reason));
            batch.event(CoordinationEvent::new(
                current.id,
                current.root_id,
                CoordinationKind::NodeCancelled,
                format!("cascade from {}", node.id),
            ));
            batch.update(current.clone());
            self.scheduler.on_child_terminal(batch, &current)?;
            alog_debug!("Cascade cancelled {} under {}", current.id, node.id);
            cancelled.push(current.id);
        }
        Ok(cancelled)
    }

    /// Merge a completed child that is still unmerged or in conflict, e.g.
    /// after its conflicts were resolved on the child branch. A successful
    /// merge lets the parent's queue move again.
    pub async fn retry_merge(&self, child_id: NodeId) -> Result<MergeRetry> {
        let tree = self.ctx.lock_tree_of(child_id).await?;
        let child = self.ctx.store.read_node(child_id)?;
        let Some(parent_id) = child.parent_id else {
            return Err(Error::MergeNotEligible {
                node: child_id,
                reason: "root has no parent branch".to_string(),
            });
        };
        if !matches!(child.merge_status, Some(MergeStatus::Unmerged) | Some(MergeStatus::Conflict) | Some(MergeStatus::Merged)) {
            return Err(Error::MergeNotEligible {
                node: child_id,
                reason: format!("merge status is {:?}", child.merge_status),
            });
        }

        let merge = self.branches.merge_to_parent(&tree, child_id).await?;
        if let MergeResult::NotEligible { reason } = merge {
            return Err(Error::MergeNotEligible { node: child_id, reason });
        }
        let next_spawned = if merge.is_merged() {
            self.spawner.drain_queue(&tree, parent_id).await?
        } else {
            None
        };
        Ok(MergeRetry { merge, next_spawned })
    }

    async fn admit_next(
        &self,
        tree: &TreeState,
        parent_id: NodeId,
        next: Option<SpawnRequest>,
    ) -> Result<Option<AgentNode>> {
        if next.is_none() {
            return Ok(None);
        }
        let parent = self.ctx.store.read_node(parent_id)?;
        if parent.status.is_terminal() {
            return Ok(None);
        }
        self.spawner.drain_queue(tree, parent_id).await
    }
}
