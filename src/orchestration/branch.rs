//! Branch lifecycle: naming, creation, and ordered merge-back of completed
//! children into their parent's branch.

use std::sync::Arc;

use crate::git::{ConflictFile, MergeOutcome, VersionControl};
use crate::store::WriteBatch;
use crate::tree::{
    AgentNode, CoordinationEvent, CoordinationKind, MergeStatus, NodeId, NodeStatus, Specialization,
};
use crate::util::{blocking, sanitize_ref_component};
use crate::{alog_debug, alog_warn, Error, Result};

use super::context::{TreeContext, TreeState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeResult {
    Merged { commit: String },
    Conflict { files: Vec<ConflictFile> },
    NotEligible { reason: String },
}

impl MergeResult {
    pub fn is_merged(&self) -> bool {
        matches!(self, MergeResult::Merged { .. })
    }
}

pub struct GitBranchCoordinator {
    ctx: Arc<TreeContext>,
    vcs: Arc<dyn VersionControl>,
}

impl GitBranchCoordinator {
    pub fn new(ctx: Arc<TreeContext>, vcs: Arc<dyn VersionControl>) -> Self {
        Self { ctx, vcs }
    }

    /// `agent/1a2b3c4d-root`
    pub fn root_branch_name(&self, root_id: NodeId) -> String {
        format!("{}/{}-root", self.ctx.config.effective_branch_prefix(), root_id.short())
    }

    /// `agent/1a2b3c4d-d2-backend-3`: flat rather than nested under the
    /// parent's name, since git cannot hold both `a/b` and `a/b/c` as refs.
    pub fn child_branch_name(&self, parent: &AgentNode, specialization: Specialization, order: u32) -> String {
        format!(
            "{}/{}-d{}-{}-{}",
            self.ctx.config.effective_branch_prefix(),
            parent.root_id.short(),
            parent.tree_depth + 1,
            sanitize_ref_component(specialization.as_str()),
            order
        )
    }

    /// Create `proposed` at the tip of `base`. If the name is taken, the
    /// node's short id is appended instead of failing.
    pub async fn create_branch(&self, base: &str, proposed: &str, node_id: NodeId) -> Result<String> {
        let vcs = Arc::clone(&self.vcs);
        let base = base.to_string();
        let proposed = proposed.to_string();
        let name = proposed.clone();
        blocking(move || {
            let name = if vcs.branch_exists(&proposed)? {
                let suffixed = format!("{}-{}", proposed, node_id.short());
                alog_warn!("Branch {} exists, using {}", proposed, suffixed);
                suffixed
            } else {
                proposed
            };
            vcs.create_branch(&base, &name)
        })
        .await
        .map_err(|e| match e {
            Error::BranchCreateFailed { .. } => e,
            other => Error::BranchCreateFailed {
                name,
                reason: other.to_string(),
            },
        })
    }

    /// Best-effort removal of a branch whose node never got persisted.
    pub async fn discard_branch(&self, name: &str) {
        let vcs = Arc::clone(&self.vcs);
        let owned = name.to_string();
        if let Err(e) = blocking(move || vcs.delete_branch(&owned)).await {
            alog_warn!("Failed to discard branch {}: {}", name, e);
        }
    }

    /// Merge a completed child's branch into its parent's branch.
    ///
    /// Must be called with the child's tree lock held, which is what keeps
    /// merges into one parent strictly sequential. Calling it again on a
    /// merged child returns the recorded commit and writes nothing.
    pub async fn merge_to_parent(&self, tree: &TreeState, child_id: NodeId) -> Result<MergeResult> {
        let mut child = self.ctx.store.read_node(child_id)?;
        if child.merge_status == Some(MergeStatus::Merged) {
            return Ok(MergeResult::Merged {
                commit: child.merge_commit.clone().unwrap_or_default(),
            });
        }
        if let Some(reason) = self.ineligible(&child)? {
            alog_debug!("merge_to_parent: {} not eligible: {}", child_id, reason);
            return Ok(MergeResult::NotEligible { reason });
        }
        let parent_branch = child
            .parent_branch_name
            .clone()
            .ok_or_else(|| Error::Validation(format!("node {} has no parent branch", child_id)))?;

        let previous = child.merge_status.unwrap_or_default();
        child.set_merge_status(MergeStatus::MergeInProgress)?;
        let mut batch = WriteBatch::new();
        batch.event(CoordinationEvent::new(
            child_id,
            tree.root,
            CoordinationKind::MergeStarted,
            format!("{} -> {}", child.branch_name, parent_branch),
        ));
        batch.update(child.clone());
        self.ctx.commit(batch)?;

        let vcs = Arc::clone(&self.vcs);
        let child_branch = child.branch_name.clone();
        let target = parent_branch.clone();
        let outcome = blocking(move || vcs.merge(&child_branch, &target)).await;

        let mut child = self.ctx.store.read_node(child_id)?;
        let mut batch = WriteBatch::new();
        let result = match outcome {
            Ok(MergeOutcome::Merged { commit }) => {
                child.set_merge_status(MergeStatus::Merged)?;
                child.merge_commit = Some(commit.clone());
                batch.event(CoordinationEvent::new(
                    child_id,
                    tree.root,
                    CoordinationKind::Merged,
                    format!("{} into {} at {}", child.branch_name, parent_branch, commit),
                ));
                alog_debug!("Merged {} into {} at {}", child.branch_name, parent_branch, commit);
                Ok(MergeResult::Merged { commit })
            }
            Ok(MergeOutcome::Conflict { files }) => {
                child.set_merge_status(MergeStatus::Conflict)?;
                let paths: Vec<String> = files.iter().map(|f| f.path.display().to_string()).collect();
                batch.event(CoordinationEvent::new(
                    child_id,
                    tree.root,
                    CoordinationKind::MergeConflict,
                    paths.join(", "),
                ));
                alog_warn!(
                    "Merge of {} into {} conflicted in {} file(s)",
                    child.branch_name,
                    parent_branch,
                    files.len()
                );
                Ok(MergeResult::Conflict { files })
            }
            Err(e) => {
                child.set_merge_status(previous)?;
                batch.event(CoordinationEvent::new(
                    child_id,
                    tree.root,
                    CoordinationKind::MergeFailed,
                    e.to_string(),
                ));
                alog_warn!("Merge of {} failed: {}", child.branch_name, e);
                Err(Error::GitOperationFailed { reason: e.to_string() })
            }
        };
        batch.update(child);
        self.ctx.commit(batch)?;
        result
    }

    fn ineligible(&self, child: &AgentNode) -> Result<Option<String>> {
        let Some(parent_id) = child.parent_id else {
            return Ok(Some("root has no parent branch".to_string()));
        };
        if child.status != NodeStatus::Completed {
            return Ok(Some(format!("status is {}", child.status)));
        }
        if child.merge_status == Some(MergeStatus::MergeInProgress) {
            return Ok(Some("merge already in progress".to_string()));
        }
        for sibling in self.ctx.store.children(parent_id)? {
            if sibling.id == child.id {
                continue;
            }
            if sibling.status == NodeStatus::Running {
                return Ok(Some(format!("sibling {} is the active child", sibling.id)));
            }
            if sibling.merge_status == Some(MergeStatus::MergeInProgress) {
                return Ok(Some(format!("sibling {} is merging", sibling.id)));
            }
        }
        Ok(None)
    }
}
