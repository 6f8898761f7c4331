use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::tree::{AgentNode, CoordinationEvent, NodeId, PhaseTransition};
use crate::{alog_trace, Error, Result};

use super::{NodeStore, StoreSnapshot, WriteBatch, SNAPSHOT_VERSION};

#[derive(Debug, Default, Clone)]
struct Inner {
    nodes: HashMap<NodeId, AgentNode>,
    children: HashMap<NodeId, Vec<NodeId>>,
    transitions: Vec<PhaseTransition>,
    events: Vec<CoordinationEvent>,
}

impl Inner {
    fn insert(&mut self, node: AgentNode) {
        if let Some(parent) = node.parent_id {
            self.children.entry(parent).or_default().push(node.id);
        }
        self.nodes.insert(node.id, node);
    }

    fn validate(&self, batch: &WriteBatch) -> Result<()> {
        for node in batch.creates() {
            if self.nodes.contains_key(&node.id) {
                return Err(Error::NodeExists(node.id));
            }
        }
        for node in batch.updates() {
            let stored = self.nodes.get(&node.id).ok_or(Error::NodeNotFound(node.id))?;
            if stored.revision != node.revision {
                return Err(Error::StaleWrite {
                    node: node.id,
                    expected: node.revision,
                    found: stored.revision,
                });
            }
        }
        Ok(())
    }

    fn apply(&mut self, batch: WriteBatch) {
        alog_trace!(
            "MemoryStore::commit creates={} updates={} transitions={} events={}",
            batch.creates().len(),
            batch.updates().len(),
            batch.transitions().len(),
            batch.events().len()
        );
        let WriteBatch {
            creates,
            updates,
            transitions,
            events,
        } = batch;
        for mut node in creates {
            node.revision += 1;
            self.insert(node);
        }
        for mut node in updates {
            node.revision += 1;
            self.nodes.insert(node.id, node);
        }
        self.transitions.extend(transitions);
        self.events.extend(events);
    }

    fn snapshot(&self) -> StoreSnapshot {
        let mut nodes: Vec<AgentNode> = self.nodes.values().cloned().collect();
        nodes.sort_by_key(|n| (n.created_at, n.id));
        StoreSnapshot {
            version: SNAPSHOT_VERSION,
            nodes,
            transitions: self.transitions.clone(),
            events: self.events.clone(),
        }
    }
}

/// In-process store. All writes take one write lock, which makes every
/// `WriteBatch` atomic with respect to readers.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let mut inner = Inner::default();
        let mut nodes = snapshot.nodes;
        // parents first so the children index keeps execution order
        nodes.sort_by_key(|n| (n.tree_depth, n.execution_order));
        for node in nodes {
            inner.insert(node);
        }
        inner.transitions = snapshot.transitions;
        inner.events = snapshot.events;
        Self {
            inner: RwLock::new(inner),
        }
    }

    pub fn snapshot(&self) -> Result<StoreSnapshot> {
        Ok(self.read()?.snapshot())
    }

    /// Commit `batch` only once `durable` has accepted the snapshot it
    /// produces. If `durable` fails, readers keep seeing the previous state.
    pub fn commit_durable<F>(&self, batch: WriteBatch, durable: F) -> Result<()>
    where
        F: FnOnce(&StoreSnapshot) -> Result<()>,
    {
        let mut inner = self.write()?;
        inner.validate(&batch)?;
        let mut staged = inner.clone();
        staged.apply(batch);
        durable(&staged.snapshot())?;
        *inner = staged;
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| Error::Store("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| Error::Store("memory store lock poisoned".to_string()))
    }
}

impl NodeStore for MemoryStore {
    fn commit(&self, batch: WriteBatch) -> Result<()> {
        let mut inner = self.write()?;
        // validate everything before touching anything
        inner.validate(&batch)?;
        inner.apply(batch);
        Ok(())
    }

    fn read_node(&self, id: NodeId) -> Result<AgentNode> {
        self.read()?
            .nodes
            .get(&id)
            .cloned()
            .ok_or(Error::NodeNotFound(id))
    }

    fn children(&self, id: NodeId) -> Result<Vec<AgentNode>> {
        let inner = self.read()?;
        if !inner.nodes.contains_key(&id) {
            return Err(Error::NodeNotFound(id));
        }
        let mut children: Vec<AgentNode> = inner
            .children
            .get(&id)
            .map(|ids| ids.iter().filter_map(|c| inner.nodes.get(c).cloned()).collect())
            .unwrap_or_default();
        children.sort_by_key(|c| c.execution_order);
        Ok(children)
    }

    fn read_subtree(&self, id: NodeId) -> Result<Vec<AgentNode>> {
        let inner = self.read()?;
        let root = inner.nodes.get(&id).ok_or(Error::NodeNotFound(id))?;
        let mut out = vec![root.clone()];
        let mut cursor = 0;
        while cursor < out.len() {
            let current = out[cursor].id;
            if let Some(ids) = inner.children.get(&current) {
                let mut kids: Vec<&AgentNode> =
                    ids.iter().filter_map(|c| inner.nodes.get(c)).collect();
                kids.sort_by_key(|c| c.execution_order);
                out.extend(kids.into_iter().cloned());
            }
            cursor += 1;
        }
        Ok(out)
    }

    fn roots(&self) -> Result<Vec<AgentNode>> {
        let inner = self.read()?;
        let mut roots: Vec<AgentNode> = inner
            .nodes
            .values()
            .filter(|n| n.is_root())
            .cloned()
            .collect();
        roots.sort_by_key(|n| n.created_at);
        Ok(roots)
    }

    fn phase_transitions(&self, id: NodeId) -> Result<Vec<PhaseTransition>> {
        Ok(self
            .read()?
            .transitions
            .iter()
            .filter(|t| t.node_id == id)
            .cloned()
            .collect())
    }

    fn coordination_events(&self, id: NodeId) -> Result<Vec<CoordinationEvent>> {
        Ok(self
            .read()?
            .events
            .iter()
            .filter(|e| e.node_id == id)
            .cloned()
            .collect())
    }
}
