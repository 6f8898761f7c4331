//! Read-side invariant checks over a whole tree.
//!
//! Violations are reported, logged and recorded. Nothing here repairs the
//! tree: a mismatch means a bug or an out-of-band write, and an operator has
//! to look at it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::store::{NodeStore, WriteBatch};
use crate::tree::{AgentNode, Cost, CoordinationEvent, CoordinationKind, NodeId, NodeStatus};
use crate::{alog_debug, alog_error, Error, Result};

use super::context::TreeContext;

/// Check every structural invariant of the tree rooted at `root_id`.
/// Returns one human-readable line per violation.
pub fn check_tree(store: &dyn NodeStore, root_id: NodeId) -> Result<Vec<String>> {
    let nodes = store.read_subtree(root_id)?;
    let by_id: HashMap<NodeId, &AgentNode> = nodes.iter().map(|n| (n.id, n)).collect();
    let mut children: HashMap<NodeId, Vec<&AgentNode>> = HashMap::new();
    for node in &nodes {
        if let Some(parent) = node.parent_id {
            children.entry(parent).or_default().push(node);
        }
    }

    let mut violations = Vec::new();
    let mut branches = HashSet::new();

    if let Some(root) = by_id.get(&root_id) {
        if root.parent_id.is_some() {
            violations.push(format!("{} is not a root (parent {:?})", root_id, root.parent_id));
        }
    }

    for node in &nodes {
        if node.root_id != root_id {
            violations.push(format!("{}: root_id {} != {}", node.id, node.root_id, root_id));
        }
        if !branches.insert(node.branch_name.as_str()) {
            violations.push(format!("{}: branch {} is not unique", node.id, node.branch_name));
        }

        let kids = children.get(&node.id).map(Vec::as_slice).unwrap_or(&[]);
        let cost_expected: Cost = node.cost_local + kids.iter().map(|c| c.cost_subtree).sum::<Cost>();
        if node.cost_subtree != cost_expected {
            violations.push(format!(
                "{}: cost_subtree {} != cost_local + children {}",
                node.id, node.cost_subtree, cost_expected
            ));
        }
        let tokens_expected = node.tokens_local + kids.iter().map(|c| c.tokens_subtree).sum::<u64>();
        if node.tokens_subtree != tokens_expected {
            violations.push(format!(
                "{}: tokens_subtree {} != tokens_local + children {}",
                node.id, node.tokens_subtree, tokens_expected
            ));
        }

        let running = kids.iter().filter(|c| c.status == NodeStatus::Running).count();
        if running > 1 {
            violations.push(format!("{}: {} children running at once", node.id, running));
        }
        if node.active_child_count as usize != running {
            violations.push(format!(
                "{}: active_child_count {} but {} running child(ren)",
                node.id, node.active_child_count, running
            ));
        }
        if node.status.is_terminal() && !node.spawn_queue.is_empty() {
            violations.push(format!(
                "{}: {} with {} queued spawn(s)",
                node.id,
                node.status,
                node.spawn_queue.len()
            ));
        }

        let mut orders = HashSet::new();
        for child in kids {
            if !orders.insert(child.execution_order) {
                violations.push(format!(
                    "{}: execution order {} used twice",
                    node.id, child.execution_order
                ));
            }
            if child.tree_depth != node.tree_depth + 1 {
                violations.push(format!(
                    "{}: depth {} under parent at depth {}",
                    child.id, child.tree_depth, node.tree_depth
                ));
            }
            if child.tree_depth > node.max_recursion_depth {
                violations.push(format!(
                    "{}: depth {} exceeds parent ceiling {}",
                    child.id, child.tree_depth, node.max_recursion_depth
                ));
            }
            if child.parent_branch_name.as_deref() != Some(node.branch_name.as_str()) {
                violations.push(format!(
                    "{}: parent branch {:?} != {}",
                    child.id, child.parent_branch_name, node.branch_name
                ));
            }
        }
    }
    Ok(violations)
}

pub struct TreeAuditor {
    ctx: Arc<TreeContext>,
}

impl TreeAuditor {
    pub fn new(ctx: Arc<TreeContext>) -> Self {
        Self { ctx }
    }

    /// Check a tree under its lock. Each violation is logged at ERROR and
    /// recorded as an `InvariantViolation` event before the call fails.
    pub async fn verify_tree(&self, root_id: NodeId) -> Result<()> {
        let _tree = self.ctx.locks.lock(root_id).await?;
        let violations = check_tree(self.ctx.store.as_ref(), root_id)?;
        if violations.is_empty() {
            alog_debug!("verify_tree {}: ok", root_id);
            return Ok(());
        }

        let mut batch = WriteBatch::new();
        for violation in &violations {
            alog_error!("Invariant violation in tree {}: {}", root_id, violation);
            batch.event(CoordinationEvent::new(
                root_id,
                root_id,
                CoordinationKind::InvariantViolation,
                violation.clone(),
            ));
        }
        self.ctx.commit(batch)?;
        Err(Error::InvariantViolation {
            root: root_id,
            detail: violations.join("; "),
        })
    }
}
