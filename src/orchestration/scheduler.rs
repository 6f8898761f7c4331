//! Tree scheduler: admission control for spawns and the bookkeeping that
//! runs when a child reaches a terminal state.
//!
//! "One active lineage at a time" is a property of this scheduler rather
//! than of any call stack. A parent admits at most one running child; the
//! next sibling is only considered when `on_child_terminal` frees the slot.
//! Everything here runs under the tree lock and stages its writes into the
//! caller's `WriteBatch`, so a caller that never commits the batch has
//! rolled the admission back. Spawn queues live on the parent node and go
//! through the same batches, so they survive a restart.

use std::sync::Arc;

use crate::config::SiblingPolicy;
use crate::error::AdmissionError;
use crate::store::WriteBatch;
use crate::tree::{
    AgentNode, CoordinationEvent, CoordinationKind, NodeId, NodeStatus, Phase, SpawnRequest, Specialization,
};
use crate::{alog_debug, alog_error, Error, Result};

use super::context::{TreeContext, TreeState};

/// A slot granted by `admit_spawn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admitted {
    pub execution_order: u32,
    pub depth: u32,
}

pub struct TreeScheduler {
    ctx: Arc<TreeContext>,
}

impl TreeScheduler {
    pub fn new(ctx: Arc<TreeContext>) -> Self {
        Self { ctx }
    }

    pub fn policy(&self) -> SiblingPolicy {
        self.ctx.config.sibling_policy
    }

    /// Try to reserve the single child slot of `parent_id`.
    ///
    /// On success the parent's `active_child_count` and
    /// `admitted_child_count` are incremented in `batch` and the new
    /// execution order is returned.
    pub fn admit_spawn(
        &self,
        tree: &TreeState,
        batch: &mut WriteBatch,
        parent_id: NodeId,
        specialization: Specialization,
    ) -> Result<Admitted> {
        let mut parent = self.ctx.current(batch, parent_id)?;

        if parent.status.is_terminal() {
            return Err(AdmissionError::ParentTerminal {
                parent: parent_id,
                status: parent.status,
            }
            .into());
        }
        if parent.phase != Phase::Summon {
            return Err(AdmissionError::InvalidParentPhase {
                parent: parent_id,
                phase: parent.phase,
            }
            .into());
        }
        if self.ctx.current(batch, tree.root)?.spawns_blocked {
            return Err(AdmissionError::SpawnsBlocked { root: tree.root }.into());
        }
        let depth = parent.tree_depth + 1;
        if depth > parent.max_recursion_depth {
            return Err(AdmissionError::DepthExceeded {
                depth,
                max: parent.max_recursion_depth,
            }
            .into());
        }
        if let Some(pending) = self
            .ctx
            .current_children(batch, parent_id)?
            .into_iter()
            .find(|c| c.awaiting_merge())
        {
            return Err(AdmissionError::MergePending {
                parent: parent_id,
                child: pending.id,
            }
            .into());
        }
        if parent.active_child_count > 0 {
            return Err(AdmissionError::SequentialViolation {
                parent: parent_id,
                active: parent.active_child_count,
            }
            .into());
        }

        parent.active_child_count += 1;
        parent.admitted_child_count += 1;
        let admitted = Admitted {
            execution_order: parent.admitted_child_count,
            depth,
        };
        alog_debug!(
            "TreeScheduler::admit_spawn parent={} spec={} order={} depth={}",
            parent_id,
            specialization,
            admitted.execution_order,
            depth
        );
        batch.update(parent);
        Ok(admitted)
    }

    /// Release the parent's slot for a child that just became terminal.
    ///
    /// `child` must already carry its terminal status (staged or stored).
    /// Returns the head of the parent's queue if one is waiting; the spawn
    /// coordinator decides whether it can actually be admitted now.
    pub fn on_child_terminal(&self, batch: &mut WriteBatch, child: &AgentNode) -> Result<Option<SpawnRequest>> {
        let Some(parent_id) = child.parent_id else {
            return Ok(None);
        };
        let mut parent = self.ctx.current(batch, parent_id)?;
        if parent.active_child_count == 0 {
            alog_error!(
                "on_child_terminal: parent {} has no active child to release for {}",
                parent_id,
                child.id
            );
            return Err(Error::InvariantViolation {
                root: child.root_id,
                detail: format!(
                    "child {} terminated while parent {} had activeChildCount=0",
                    child.id, parent_id
                ),
            });
        }
        parent.active_child_count -= 1;
        if child.status == NodeStatus::Completed {
            parent.completed_child_count += 1;
        }
        alog_debug!(
            "TreeScheduler::on_child_terminal parent={} child={} status={} active={} completed={}",
            parent_id,
            child.id,
            child.status,
            parent.active_child_count,
            parent.completed_child_count
        );
        let next = parent.spawn_queue.front().cloned();
        batch.update(parent);
        batch.event(CoordinationEvent::new(
            parent_id,
            child.root_id,
            CoordinationKind::ChildTerminal,
            format!("child {} {}", child.id, child.status),
        ));
        Ok(next)
    }

    /// Append to the parent's FIFO queue; returns the 1-based position.
    pub fn enqueue(&self, batch: &mut WriteBatch, request: SpawnRequest) -> Result<usize> {
        let mut parent = self.ctx.current(batch, request.parent_id)?;
        parent.spawn_queue.push_back(request);
        let position = parent.spawn_queue.len();
        batch.update(parent);
        Ok(position)
    }

    pub fn peek_queue(&self, batch: &WriteBatch, parent: NodeId) -> Result<Option<SpawnRequest>> {
        Ok(self.ctx.current(batch, parent)?.spawn_queue.front().cloned())
    }

    pub fn pop_queue(&self, batch: &mut WriteBatch, parent: NodeId) -> Result<Option<SpawnRequest>> {
        let mut node = self.ctx.current(batch, parent)?;
        let request = node.spawn_queue.pop_front();
        if request.is_some() {
            batch.update(node);
        }
        Ok(request)
    }

    /// Remove every queued request of `parent`, e.g. once it is terminal.
    pub fn drop_queue(&self, batch: &mut WriteBatch, parent: NodeId) -> Result<Vec<SpawnRequest>> {
        let mut node = self.ctx.current(batch, parent)?;
        if node.spawn_queue.is_empty() {
            return Ok(Vec::new());
        }
        let dropped = node.spawn_queue.drain(..).collect();
        batch.update(node);
        Ok(dropped)
    }
}

/// Admission errors that clear up by themselves once the running child
/// (or its merge) finishes. Only these are eligible for queueing.
pub fn is_queueable(err: &Error) -> bool {
    matches!(
        err,
        Error::Admission(AdmissionError::SequentialViolation { .. })
            | Error::Admission(AdmissionError::MergePending { .. })
    )
}
