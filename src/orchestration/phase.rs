//! Per-node phase state machine.
//!
//! Phases only move forward, one step at a time, and each step must carry
//! the report for the phase being left. Entering SUMMON is what opens the
//! node for child admission; entering COMPLETE is refused while any child
//! is running, waiting to merge, or still queued.

use std::sync::Arc;

use chrono::Utc;

use crate::error::TransitionError;
use crate::store::WriteBatch;
use crate::tree::{
    AgentNode, CoordinationEvent, CoordinationKind, NodeId, NodeStatus, Phase, PhaseReport, PhaseTransition,
};
use crate::{alog_debug, alog_warn, Result};

use super::context::{Delivery, TreeContext};

pub struct PhaseStateMachine {
    ctx: Arc<TreeContext>,
}

impl PhaseStateMachine {
    pub fn new(ctx: Arc<TreeContext>) -> Self {
        Self { ctx }
    }

    /// Move `node_id` into `to`, the immediate successor of its current phase.
    ///
    /// `seq` is the engine's per-node delivery sequence number; a repeated
    /// or older `seq` is acknowledged as `Duplicate` without any change.
    pub async fn advance(
        &self,
        node_id: NodeId,
        to: Phase,
        report: PhaseReport,
        seq: u64,
    ) -> Result<Delivery<PhaseTransition>> {
        let _tree = self.ctx.lock_tree_of(node_id).await?;
        let mut node = self.ctx.store.read_node(node_id)?;
        if seq <= node.last_seq {
            alog_warn!(
                "advance: duplicate delivery seq={} for node {} (last_seq={})",
                seq,
                node_id,
                node.last_seq
            );
            return Ok(Delivery::Duplicate);
        }

        let from = node.phase;
        self.validate(&node, to)?;
        report.validate_for(from)?;

        let now = Utc::now();
        let transition = PhaseTransition {
            node_id,
            root_id: node.root_id,
            from_phase: from,
            to_phase: to,
            timestamp: now,
            duration_ms: (now - node.phase_entered_at).num_milliseconds(),
            summary: report.summary().to_string(),
            confidence: report.confidence(),
        };
        node.accept_seq(seq);
        node.phase = to;
        node.phase_entered_at = now;

        let mut batch = WriteBatch::new();
        batch.event(CoordinationEvent::new(
            node_id,
            node.root_id,
            CoordinationKind::PhaseAdvanced,
            format!("{} -> {}", from, to),
        ));
        batch.update(node).transition(transition.clone());
        self.ctx.commit(batch)?;

        alog_debug!("Node {} advanced {} -> {} (seq={})", node_id, from, to, seq);
        Ok(Delivery::Applied(transition))
    }

    fn validate(&self, node: &AgentNode, to: Phase) -> Result<()> {
        if node.status != NodeStatus::Running {
            return Err(TransitionError::PhaseViolation {
                node: node.id,
                reason: format!("node is {}, only running nodes change phase", node.status),
            }
            .into());
        }
        if node.phase.successor(node.is_root()) != Some(to) {
            return Err(TransitionError::InvalidTransition { from: node.phase, to }.into());
        }
        if to != Phase::Complete {
            return Ok(());
        }

        if node.active_child_count > 0 {
            return Err(TransitionError::PhaseViolation {
                node: node.id,
                reason: format!("{} child(ren) still active", node.active_child_count),
            }
            .into());
        }
        if let Some(child) = self
            .ctx
            .store
            .children(node.id)?
            .into_iter()
            .find(|c| c.awaiting_merge())
        {
            return Err(TransitionError::PhaseViolation {
                node: node.id,
                reason: format!("child {} has not been merged back", child.id),
            }
            .into());
        }
        let queued = node.spawn_queue.len();
        if queued > 0 {
            return Err(TransitionError::PhaseViolation {
                node: node.id,
                reason: format!("{} spawn request(s) still queued", queued),
            }
            .into());
        }
        Ok(())
    }
}
