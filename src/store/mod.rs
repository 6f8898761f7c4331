//! Persistence for the agent tree.
//!
//! The orchestrator only needs a handful of transactional primitives, so any
//! backend that can honour `NodeStore` is substitutable. Writes go through
//! `WriteBatch`: node creations, conditional node updates, and appended
//! audit records are applied all-or-nothing.

mod file;
mod memory;

use serde::{Deserialize, Serialize};

use crate::tree::{AgentNode, CoordinationEvent, NodeId, PhaseTransition};
use crate::Result;

pub use file::JsonFileStore;
pub use memory::MemoryStore;

pub const SNAPSHOT_VERSION: u32 = 1;

/// A set of writes committed atomically.
///
/// Every updated node carries the `revision` it was read at; if the stored
/// revision has moved on, the whole batch is rejected with `StaleWrite`.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    creates: Vec<AgentNode>,
    updates: Vec<AgentNode>,
    transitions: Vec<PhaseTransition>,
    events: Vec<CoordinationEvent>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, node: AgentNode) -> &mut Self {
        self.creates.push(node);
        self
    }

    /// Stage an update. A later update of the same node replaces the earlier
    /// one; updating a node created in this batch rewrites the creation.
    pub fn update(&mut self, node: AgentNode) -> &mut Self {
        if let Some(created) = self.creates.iter_mut().find(|n| n.id == node.id) {
            *created = node;
        } else if let Some(existing) = self.updates.iter_mut().find(|n| n.id == node.id) {
            *existing = node;
        } else {
            self.updates.push(node);
        }
        self
    }

    pub fn transition(&mut self, transition: PhaseTransition) -> &mut Self {
        self.transitions.push(transition);
        self
    }

    pub fn event(&mut self, event: CoordinationEvent) -> &mut Self {
        self.events.push(event);
        self
    }

    /// The staged copy of a node, if this batch already touches it.
    pub fn staged(&self, id: NodeId) -> Option<&AgentNode> {
        self.updates
            .iter()
            .chain(self.creates.iter())
            .find(|n| n.id == id)
    }

    pub fn creates(&self) -> &[AgentNode] {
        &self.creates
    }

    pub fn updates(&self) -> &[AgentNode] {
        &self.updates
    }

    pub fn transitions(&self) -> &[PhaseTransition] {
        &self.transitions
    }

    pub fn events(&self) -> &[CoordinationEvent] {
        &self.events
    }

    pub fn is_empty(&self) -> bool {
        self.creates.is_empty()
            && self.updates.is_empty()
            && self.transitions.is_empty()
            && self.events.is_empty()
    }
}

/// Transactional primitives the orchestrator consumes.
pub trait NodeStore: Send + Sync {
    /// Create a single node. Fails with `NodeExists` if the id is taken.
    fn create_node(&self, node: AgentNode) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.create(node);
        self.commit(batch)
    }

    /// Conditionally update a single node (see `WriteBatch`).
    fn update_node(&self, node: AgentNode) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.update(node);
        self.commit(batch)
    }

    fn append_phase_transition(&self, transition: PhaseTransition) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.transition(transition);
        self.commit(batch)
    }

    fn append_coordination_event(&self, event: CoordinationEvent) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.event(event);
        self.commit(batch)
    }

    fn commit(&self, batch: WriteBatch) -> Result<()>;

    fn read_node(&self, id: NodeId) -> Result<AgentNode>;

    /// Direct children ordered by execution order.
    fn children(&self, id: NodeId) -> Result<Vec<AgentNode>>;

    /// The node and all its descendants, parents before children.
    fn read_subtree(&self, id: NodeId) -> Result<Vec<AgentNode>>;

    fn roots(&self) -> Result<Vec<AgentNode>>;

    fn phase_transitions(&self, id: NodeId) -> Result<Vec<PhaseTransition>>;

    fn coordination_events(&self, id: NodeId) -> Result<Vec<CoordinationEvent>>;
}

/// Serialized form of a whole store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub version: u32,
    pub nodes: Vec<AgentNode>,
    pub transitions: Vec<PhaseTransition>,
    pub events: Vec<CoordinationEvent>,
}
