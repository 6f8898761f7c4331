use thiserror::Error;

use crate::tree::{NodeId, NodeStatus, Phase};

/// Reasons a spawn request is refused by the scheduler.
///
/// Admission errors are synchronous and never retried automatically; the
/// caller decides whether to try again later.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("Sequential violation: node {parent} already has {active} running child(ren)")]
    SequentialViolation { parent: NodeId, active: u32 },

    #[error("Depth exceeded: child depth {depth} exceeds ceiling {max}")]
    DepthExceeded { depth: u32, max: u32 },

    #[error("Invalid parent phase: node {parent} is in {phase}, spawning requires summon")]
    InvalidParentPhase { parent: NodeId, phase: Phase },

    #[error("Parent terminal: node {parent} is {status}")]
    ParentTerminal { parent: NodeId, status: NodeStatus },

    #[error("Merge pending: child {child} of node {parent} has not been merged back")]
    MergePending { parent: NodeId, child: NodeId },

    #[error("Spawns blocked for tree {root}: credit ledger denied a debit")]
    SpawnsBlocked { root: NodeId },
}

/// Reasons a phase advance is refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Invalid phase transition from {from} to {to}")]
    InvalidTransition { from: Phase, to: Phase },

    #[error("Phase violation on node {node}: {reason}")]
    PhaseViolation { node: NodeId, reason: String },

    #[error("Report mismatch: leaving {phase} requires a {expected} report, got {actual}")]
    ReportMismatch {
        phase: Phase,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Invalid report: {0}")]
    InvalidReport(String),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Admission denied: {0}")]
    Admission(#[from] AdmissionError),

    #[error("Transition rejected: {0}")]
    Transition(#[from] TransitionError),

    #[error("Git operation failed: {reason}")]
    GitOperationFailed { reason: String },

    #[error("Branch create failed for {name}: {reason}")]
    BranchCreateFailed { name: String, reason: String },

    #[error("Merge not eligible for node {node}: {reason}")]
    MergeNotEligible { node: NodeId, reason: String },

    #[error("Ledger denied debit of {amount} for node {node}: {reason}")]
    LedgerDenied {
        node: NodeId,
        amount: crate::tree::Cost,
        reason: String,
    },

    #[error("Invariant violation in tree {root}: {detail}")]
    InvariantViolation { root: NodeId, detail: String },

    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Node already exists: {0}")]
    NodeExists(NodeId),

    #[error("Illegal status change on node {node}: {from} -> {to}")]
    IllegalStatusChange {
        node: NodeId,
        from: NodeStatus,
        to: NodeStatus,
    },

    #[error("Stale write on node {node}: expected revision {expected}, found {found}")]
    StaleWrite {
        node: NodeId,
        expected: u64,
        found: u64,
    },

    #[error("Store error: {0}")]
    Store(String),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

impl Error {
    /// True for errors a caller can fix by retrying the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::StaleWrite { .. } | Error::GitOperationFailed { .. } | Error::TaskJoin(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
