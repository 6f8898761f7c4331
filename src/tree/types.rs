//! Core tree data model: node identity, lifecycle enums, cost units and the
//! `AgentNode` record itself.

use std::collections::{BTreeSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

use super::report::CompletionReport;

/// Unique identifier for a node. The root's id doubles as the tree id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub Uuid);

impl NodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display and branch names.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for NodeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Declared role of a node, used by the engine for task routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Specialization {
    Frontend,
    Backend,
    Database,
    Testing,
    Security,
    Devops,
    General,
}

impl Specialization {
    pub const ALL: [Specialization; 7] = [
        Specialization::Frontend,
        Specialization::Backend,
        Specialization::Database,
        Specialization::Testing,
        Specialization::Security,
        Specialization::Devops,
        Specialization::General,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Specialization::Frontend => "frontend",
            Specialization::Backend => "backend",
            Specialization::Database => "database",
            Specialization::Testing => "testing",
            Specialization::Security => "security",
            Specialization::Devops => "devops",
            Specialization::General => "general",
        }
    }
}

impl std::fmt::Display for Specialization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Specialization {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Specialization::ALL
            .into_iter()
            .find(|spec| spec.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::Validation(format!("unknown specialization '{}'", s)))
    }
}

/// Lifecycle status. Only pending -> running -> {completed, failed, cancelled};
/// terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Completed | NodeStatus::Failed | NodeStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, target: NodeStatus) -> bool {
        matches!(
            (self, target),
            (NodeStatus::Pending, NodeStatus::Running)
                | (NodeStatus::Pending, NodeStatus::Failed)
                | (NodeStatus::Pending, NodeStatus::Cancelled)
                | (NodeStatus::Running, NodeStatus::Completed)
                | (NodeStatus::Running, NodeStatus::Failed)
                | (NodeStatus::Running, NodeStatus::Cancelled)
        )
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Pending => write!(f, "pending"),
            NodeStatus::Running => write!(f, "running"),
            NodeStatus::Completed => write!(f, "completed"),
            NodeStatus::Failed => write!(f, "failed"),
            NodeStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Position of a node in EXPLORE -> PLAN -> FOUND -> SUMMON -> COMPLETE.
///
/// FOUND is the root-only foundation step; every other node goes straight
/// from PLAN to SUMMON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Explore,
    Plan,
    Found,
    Summon,
    Complete,
}

impl Phase {
    /// The only phase a node may advance into from `self`.
    pub fn successor(&self, is_root: bool) -> Option<Phase> {
        match self {
            Phase::Explore => Some(Phase::Plan),
            Phase::Plan if is_root => Some(Phase::Found),
            Phase::Plan => Some(Phase::Summon),
            Phase::Found => Some(Phase::Summon),
            Phase::Summon => Some(Phase::Complete),
            Phase::Complete => None,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Explore => write!(f, "explore"),
            Phase::Plan => write!(f, "plan"),
            Phase::Found => write!(f, "found"),
            Phase::Summon => write!(f, "summon"),
            Phase::Complete => write!(f, "complete"),
        }
    }
}

/// Merge-back state of a non-root node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    #[default]
    Unmerged,
    MergeInProgress,
    Merged,
    Conflict,
}

impl MergeStatus {
    pub fn can_transition_to(&self, target: MergeStatus) -> bool {
        matches!(
            (self, target),
            (MergeStatus::Unmerged, MergeStatus::MergeInProgress)
                | (MergeStatus::Conflict, MergeStatus::MergeInProgress)
                | (MergeStatus::MergeInProgress, MergeStatus::Merged)
                | (MergeStatus::MergeInProgress, MergeStatus::Conflict)
                // git failure before a result: back to where we were
                | (MergeStatus::MergeInProgress, MergeStatus::Unmerged)
        )
    }
}

impl std::fmt::Display for MergeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MergeStatus::Unmerged => write!(f, "unmerged"),
            MergeStatus::MergeInProgress => write!(f, "merge_in_progress"),
            MergeStatus::Merged => write!(f, "merged"),
            MergeStatus::Conflict => write!(f, "conflict"),
        }
    }
}

const MICROS_PER_UNIT: u64 = 1_000_000;
const FRACTION_DIGITS: usize = 6;

/// Monetary cost in fixed-precision micro-units (1e-6 of a currency unit).
///
/// Integer arithmetic keeps rollups exact no matter how many increments land.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Cost(u64);

impl Cost {
    pub const ZERO: Cost = Cost(0);

    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    pub const fn micros(&self) -> u64 {
        self.0
    }

    pub fn checked_add(self, other: Cost) -> Option<Cost> {
        self.0.checked_add(other.0).map(Cost)
    }

    pub fn checked_sub(self, other: Cost) -> Option<Cost> {
        self.0.checked_sub(other.0).map(Cost)
    }
}

impl std::ops::Add for Cost {
    type Output = Cost;

    fn add(self, rhs: Cost) -> Cost {
        Cost(self.0.saturating_add(rhs.0))
    }
}

impl std::ops::AddAssign for Cost {
    fn add_assign(&mut self, rhs: Cost) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl std::iter::Sum for Cost {
    fn sum<I: Iterator<Item = Cost>>(iter: I) -> Cost {
        iter.fold(Cost::ZERO, |acc, c| acc + c)
    }
}

impl std::fmt::Display for Cost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{:06}",
            self.0 / MICROS_PER_UNIT,
            self.0 % MICROS_PER_UNIT
        )
    }
}

/// Parses decimal strings such as `"0.05"` or `"12"` without going through floats.
impl std::str::FromStr for Cost {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = || Error::Validation(format!("invalid cost '{}'", s));
        let (whole, frac) = match s.split_once('.') {
            Some((w, f)) => (w, f),
            None => (s, ""),
        };
        if whole.is_empty() && frac.is_empty() {
            return Err(invalid());
        }
        if frac.len() > FRACTION_DIGITS
            || !whole.chars().all(|c| c.is_ascii_digit())
            || !frac.chars().all(|c| c.is_ascii_digit())
        {
            return Err(invalid());
        }
        let whole: u64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid())?
        };
        let frac_micros: u64 = if frac.is_empty() {
            0
        } else {
            format!("{:0<width$}", frac, width = FRACTION_DIGITS)
                .parse()
                .map_err(|_| invalid())?
        };
        whole
            .checked_mul(MICROS_PER_UNIT)
            .and_then(|w| w.checked_add(frac_micros))
            .map(Cost)
            .ok_or_else(invalid)
    }
}

/// A spawn request, either being admitted right now or parked in its
/// parent's queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub id: Uuid,
    pub parent_id: NodeId,
    pub specialization: Specialization,
    pub task: String,
    /// Requested recursion ceiling; the parent's ceiling still caps it.
    pub max_depth: Option<u32>,
    pub requested_at: DateTime<Utc>,
}

impl SpawnRequest {
    pub fn new(parent_id: NodeId, specialization: Specialization, task: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id,
            specialization,
            task: task.into(),
            max_depth: None,
            requested_at: Utc::now(),
        }
    }

    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = Some(max_depth);
        self
    }
}

/// Applied usage seqs kept per node before the oldest fold into the floor.
pub const USAGE_SEQ_WINDOW: usize = 256;

/// One execution unit in the tree, bound to a specialization and a git branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentNode {
    pub id: NodeId,
    pub parent_id: Option<NodeId>,
    pub root_id: NodeId,
    pub tree_depth: u32,
    /// 1-based sibling sequence index assigned at admission; 0 for the root.
    pub execution_order: u32,
    pub specialization: Specialization,
    pub task: String,
    /// Billing identity, inherited from the root.
    pub owner: String,
    pub branch_name: String,
    pub parent_branch_name: Option<String>,
    pub status: NodeStatus,
    pub phase: Phase,
    pub phase_entered_at: DateTime<Utc>,
    /// `None` for the root, which is never merged anywhere.
    pub merge_status: Option<MergeStatus>,
    pub merge_commit: Option<String>,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub max_recursion_depth: u32,
    pub active_child_count: u32,
    pub completed_child_count: u32,
    /// Children ever admitted; the next admission gets this plus one.
    pub admitted_child_count: u32,
    pub cost_local: Cost,
    pub cost_subtree: Cost,
    pub tokens_local: u64,
    pub tokens_subtree: u64,
    pub extended_pricing_events: u32,
    pub completion_result: Option<CompletionReport>,
    pub failure_reason: Option<String>,
    /// Spawn requests waiting for this node's child slot, oldest first.
    #[serde(default)]
    pub spawn_queue: VecDeque<SpawnRequest>,
    /// Set on the root once the ledger refuses a debit under `block_spawns`.
    #[serde(default)]
    pub spawns_blocked: bool,
    /// Highest engine delivery sequence number applied to this node.
    pub last_seq: u64,
    /// Usage reports may arrive out of order, so their seqs are tracked
    /// individually: every seq at or below the floor, plus the set above it.
    #[serde(default)]
    pub usage_seq_floor: u64,
    #[serde(default)]
    pub usage_seqs: BTreeSet<u64>,
    /// Store revision this copy was read at; bumped on every committed update.
    pub revision: u64,
}

impl AgentNode {
    pub fn new_root(
        task: &str,
        owner: &str,
        specialization: Specialization,
        branch_name: &str,
        max_recursion_depth: u32,
    ) -> Self {
        let id = NodeId::new();
        Self::build(
            id,
            None,
            id,
            0,
            0,
            specialization,
            task,
            owner,
            branch_name,
            None,
            max_recursion_depth,
        )
    }

    pub fn new_child(
        id: NodeId,
        parent: &AgentNode,
        execution_order: u32,
        specialization: Specialization,
        task: &str,
        branch_name: &str,
        max_recursion_depth: u32,
    ) -> Self {
        Self::build(
            id,
            Some(parent.id),
            parent.root_id,
            parent.tree_depth + 1,
            execution_order,
            specialization,
            task,
            &parent.owner,
            branch_name,
            Some(parent.branch_name.clone()),
            max_recursion_depth,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        id: NodeId,
        parent_id: Option<NodeId>,
        root_id: NodeId,
        tree_depth: u32,
        execution_order: u32,
        specialization: Specialization,
        task: &str,
        owner: &str,
        branch_name: &str,
        parent_branch_name: Option<String>,
        max_recursion_depth: u32,
    ) -> Self {
        let now = Utc::now();
        let merge_status = parent_id.map(|_| MergeStatus::Unmerged);
        Self {
            id,
            parent_id,
            root_id,
            tree_depth,
            execution_order,
            specialization,
            task: task.to_string(),
            owner: owner.to_string(),
            branch_name: branch_name.to_string(),
            parent_branch_name,
            status: NodeStatus::Pending,
            phase: Phase::Explore,
            phase_entered_at: now,
            merge_status,
            merge_commit: None,
            created_at: now,
            start_time: None,
            end_time: None,
            max_recursion_depth,
            active_child_count: 0,
            completed_child_count: 0,
            admitted_child_count: 0,
            cost_local: Cost::ZERO,
            cost_subtree: Cost::ZERO,
            tokens_local: 0,
            tokens_subtree: 0,
            extended_pricing_events: 0,
            completion_result: None,
            failure_reason: None,
            spawn_queue: VecDeque::new(),
            spawns_blocked: false,
            last_seq: 0,
            usage_seq_floor: 0,
            usage_seqs: BTreeSet::new(),
            revision: 0,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Apply a status change, stamping start/end times.
    pub fn set_status(&mut self, target: NodeStatus) -> Result<()> {
        if !self.status.can_transition_to(target) {
            return Err(Error::IllegalStatusChange {
                node: self.id,
                from: self.status,
                to: target,
            });
        }
        let now = Utc::now();
        match target {
            NodeStatus::Running => self.start_time = Some(now),
            s if s.is_terminal() => self.end_time = Some(now),
            _ => {}
        }
        self.status = target;
        Ok(())
    }

    pub fn set_merge_status(&mut self, target: MergeStatus) -> Result<()> {
        let current = self
            .merge_status
            .ok_or_else(|| Error::Validation(format!("root node {} has no merge state", self.id)))?;
        if !current.can_transition_to(target) {
            return Err(Error::Validation(format!(
                "illegal merge status change on {}: {} -> {}",
                self.id, current, target
            )));
        }
        self.merge_status = Some(target);
        Ok(())
    }

    /// Record a delivery sequence number. Returns false for duplicates and
    /// stale redeliveries.
    pub fn accept_seq(&mut self, seq: u64) -> bool {
        if seq <= self.last_seq {
            return false;
        }
        self.last_seq = seq;
        true
    }

    /// Record a usage report's sequence number. Returns false only for a
    /// seq already applied (or older than the retained window).
    pub fn accept_usage_seq(&mut self, seq: u64) -> bool {
        if seq <= self.usage_seq_floor || !self.usage_seqs.insert(seq) {
            return false;
        }
        while self.usage_seqs.len() > USAGE_SEQ_WINDOW {
            match self.usage_seqs.pop_first() {
                Some(lowest) => self.usage_seq_floor = lowest,
                None => break,
            }
        }
        true
    }

    /// Completed, and its work is still waiting to reach the parent branch.
    pub fn awaiting_merge(&self) -> bool {
        self.status == NodeStatus::Completed
            && matches!(
                self.merge_status,
                Some(MergeStatus::Unmerged) | Some(MergeStatus::Conflict) | Some(MergeStatus::MergeInProgress)
            )
    }
}
