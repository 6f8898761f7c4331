//! Append-only audit records and the events streamed to the notification sink.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{NodeId, Phase};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub node_id: NodeId,
    pub root_id: NodeId,
    pub from_phase: Phase,
    pub to_phase: Phase,
    pub timestamp: DateTime<Utc>,
    /// Time spent in `from_phase`, in milliseconds.
    pub duration_ms: i64,
    pub summary: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinationKind {
    NodeSpawned,
    SpawnQueued,
    SpawnDequeued,
    SpawnDropped,
    SpawnDenied,
    PhaseAdvanced,
    UsageRecorded,
    LedgerDenied,
    SpawnsBlocked,
    MergeStarted,
    Merged,
    MergeConflict,
    MergeFailed,
    NodeCompleted,
    NodeFailed,
    NodeCancelled,
    ChildTerminal,
    InvariantViolation,
}

impl CoordinationKind {
    /// Records that mark a node reaching a terminal status.
    pub fn is_terminal_record(&self) -> bool {
        matches!(
            self,
            CoordinationKind::NodeCompleted
                | CoordinationKind::NodeFailed
                | CoordinationKind::NodeCancelled
        )
    }
}

impl std::fmt::Display for CoordinationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // serde's snake_case names double as display names
        let name = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_default();
        f.write_str(&name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinationEvent {
    pub node_id: NodeId,
    pub root_id: NodeId,
    pub kind: CoordinationKind,
    pub timestamp: DateTime<Utc>,
    pub detail: String,
}

impl CoordinationEvent {
    pub fn new(node_id: NodeId, root_id: NodeId, kind: CoordinationKind, detail: impl Into<String>) -> Self {
        Self {
            node_id,
            root_id,
            kind,
            timestamp: Utc::now(),
            detail: detail.into(),
        }
    }
}

/// Everything the core emits for external streaming.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TreeEvent {
    Phase(PhaseTransition),
    Coordination(CoordinationEvent),
}

impl TreeEvent {
    pub fn node_id(&self) -> NodeId {
        match self {
            TreeEvent::Phase(t) => t.node_id,
            TreeEvent::Coordination(e) => e.node_id,
        }
    }
}
