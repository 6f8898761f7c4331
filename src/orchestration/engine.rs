//! Contract with the agent execution engine.
//!
//! The core tells the engine about new nodes and about children reaching a
//! terminal state; the engine calls back into `PhaseStateMachine::advance`,
//! `CostAggregator::record_usage` and `ExecutionResultPropagator`. Both
//! notifications must return immediately; the engine does its real work on
//! its own tasks.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::tree::{NodeId, NodeStatus, Specialization};

/// A node is running and needs an agent.
#[derive(Debug, Clone)]
pub struct SpawnNotice {
    pub node_id: NodeId,
    pub root_id: NodeId,
    pub parent_id: Option<NodeId>,
    pub specialization: Specialization,
    pub task: String,
    pub branch_name: String,
    pub parent_branch_name: Option<String>,
    /// Fires when the core cancels or fails this node or any ancestor.
    pub cancel: CancellationToken,
}

/// A child of `parent_id` reached a terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildNotice {
    pub parent_id: NodeId,
    pub child_id: NodeId,
    pub status: NodeStatus,
    pub reason: Option<String>,
}

pub trait ExecutionEngine: Send + Sync {
    fn dispatch(&self, notice: SpawnNotice);

    fn child_terminal(&self, _notice: ChildNotice) {}
}

/// Drops every notification. Useful when the caller drives nodes by hand.
pub struct NullEngine;

impl ExecutionEngine for NullEngine {
    fn dispatch(&self, _notice: SpawnNotice) {}
}

#[derive(Debug, Clone)]
pub enum EngineMessage {
    Spawn(SpawnNotice),
    ChildTerminal(ChildNotice),
}

/// Forwards notifications over an unbounded tokio channel to an engine
/// running on its own tasks.
pub struct ChannelEngine {
    tx: mpsc::UnboundedSender<EngineMessage>,
}

impl ChannelEngine {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EngineMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ExecutionEngine for ChannelEngine {
    fn dispatch(&self, notice: SpawnNotice) {
        let _ = self.tx.send(EngineMessage::Spawn(notice));
    }

    fn child_terminal(&self, notice: ChildNotice) {
        let _ = self.tx.send(EngineMessage::ChildTerminal(notice));
    }
}
