//! Tree data model for the agent orchestrator.
//!
//! `AgentNode` is the persisted unit of the tree. `PhaseTransition` and
//! `CoordinationEvent` are append-only audit records; nodes are never
//! deleted.

mod event;
mod report;
mod types;

pub use event::{CoordinationEvent, CoordinationKind, PhaseTransition, TreeEvent};
pub use report::{
    CompletionReport, ExploreReport, FoundationReport, PhaseReport, PlanReport, SummonReport,
};
pub use types::{AgentNode, Cost, MergeStatus, NodeId, NodeStatus, Phase, SpawnRequest, Specialization};
