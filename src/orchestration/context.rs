//! Shared state behind every orchestration component: the store, per-tree
//! locks, the event sink, and per-node cancellation signals.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Sender, TrySendError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::store::{NodeStore, WriteBatch};
use crate::tree::{AgentNode, NodeId, TreeEvent};
use crate::{alog_debug, alog_trace, alog_warn, Error, Result};

/// Outcome of an engine callback delivered at-least-once.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery<T> {
    Applied(T),
    /// Sequence number already seen; nothing changed.
    Duplicate,
}

impl<T> Delivery<T> {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Delivery::Duplicate)
    }

    pub fn applied(self) -> Option<T> {
        match self {
            Delivery::Applied(v) => Some(v),
            Delivery::Duplicate => None,
        }
    }
}

/// Per-tree state that lives only as long as the lock entry. Everything
/// that must survive a restart is kept on the nodes themselves.
#[derive(Debug)]
pub struct TreeState {
    pub root: NodeId,
}

impl TreeState {
    fn new(root: NodeId) -> Self {
        Self { root }
    }
}

pub type TreeGuard = OwnedMutexGuard<TreeState>;

/// One async mutex per tree. Trees never share a lock, so independent trees
/// proceed in parallel; all mutations inside a tree are serialized.
#[derive(Default)]
pub struct TreeLocks {
    trees: Mutex<HashMap<NodeId, Arc<AsyncMutex<TreeState>>>>,
}

impl TreeLocks {
    pub async fn lock(&self, root: NodeId) -> Result<TreeGuard> {
        let lock = {
            let mut trees = self
                .trees
                .lock()
                .map_err(|_| Error::Store("tree lock table poisoned".to_string()))?;
            Arc::clone(
                trees
                    .entry(root)
                    .or_insert_with(|| Arc::new(AsyncMutex::new(TreeState::new(root)))),
            )
        };
        Ok(lock.lock_owned().await)
    }

    /// Release `guard` and forget the tree's lock entry if nobody else holds
    /// or waits on it. Waiters clone the entry under the table lock, so a
    /// count of one here means no caller can still reach the old mutex.
    pub fn evict(&self, guard: TreeGuard) -> Result<()> {
        let root = guard.root;
        drop(guard);
        let mut trees = self
            .trees
            .lock()
            .map_err(|_| Error::Store("tree lock table poisoned".to_string()))?;
        if trees.get(&root).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            trees.remove(&root);
            alog_debug!("Evicted lock entry for tree {}", root);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.trees.lock().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cooperative cancellation handles handed to the engine, one per node.
#[derive(Default)]
pub struct Signals {
    tokens: Mutex<HashMap<NodeId, CancellationToken>>,
}

impl Signals {
    /// Token of the last node in `lineage` (oldest ancestor first), creating
    /// any missing tokens along the way so each is a child of the one above.
    pub fn register_lineage(&self, lineage: &[NodeId]) -> Result<CancellationToken> {
        let mut tokens = self
            .tokens
            .lock()
            .map_err(|_| Error::Store("signal table poisoned".to_string()))?;
        let mut above: Option<CancellationToken> = None;
        for id in lineage {
            let token = match tokens.get(id) {
                Some(existing) => existing.clone(),
                None => {
                    let token = above
                        .as_ref()
                        .map_or_else(CancellationToken::new, |p| p.child_token());
                    tokens.insert(*id, token.clone());
                    token
                }
            };
            above = Some(token);
        }
        above.ok_or_else(|| Error::Validation("empty lineage".to_string()))
    }

    pub fn token(&self, node: NodeId) -> Option<CancellationToken> {
        self.tokens.lock().ok()?.get(&node).cloned()
    }

    /// Fire the node's token and drop it from the table.
    pub fn cancel(&self, node: NodeId) {
        if let Some(token) = self.forget(node) {
            token.cancel();
        }
    }

    /// Drop the node's token without firing it.
    pub fn forget(&self, node: NodeId) -> Option<CancellationToken> {
        self.tokens.lock().ok()?.remove(&node)
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct TreeContext {
    pub(crate) store: Arc<dyn NodeStore>,
    pub(crate) config: Config,
    pub(crate) locks: TreeLocks,
    pub(crate) signals: Signals,
    sink: Option<Sender<TreeEvent>>,
}

impl TreeContext {
    pub fn new(store: Arc<dyn NodeStore>, config: Config, sink: Option<Sender<TreeEvent>>) -> Self {
        Self {
            store,
            config,
            locks: TreeLocks::default(),
            signals: Signals::default(),
            sink,
        }
    }

    pub fn signals(&self) -> &Signals {
        &self.signals
    }

    pub fn locks(&self) -> &TreeLocks {
        &self.locks
    }

    pub fn store(&self) -> &Arc<dyn NodeStore> {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Look up which tree a node belongs to. `root_id` never changes, so
    /// this read does not need the tree lock.
    pub fn root_of(&self, node: NodeId) -> Result<NodeId> {
        Ok(self.store.read_node(node)?.root_id)
    }

    pub async fn lock_tree_of(&self, node: NodeId) -> Result<TreeGuard> {
        let root = self.root_of(node)?;
        self.locks.lock(root).await
    }

    /// Unlock a tree; once its root is terminal the lock entry is dropped too.
    pub fn release(&self, guard: TreeGuard) -> Result<()> {
        if self.store.read_node(guard.root)?.status.is_terminal() {
            self.locks.evict(guard)
        } else {
            drop(guard);
            Ok(())
        }
    }

    /// The node's cancellation token. Nodes loaded from a snapshot get
    /// theirs lazily, linked under their ancestors' tokens.
    pub fn signal_for(&self, node: &AgentNode) -> Result<CancellationToken> {
        let mut lineage = vec![node.id];
        let mut next = node.parent_id;
        while let Some(id) = next {
            lineage.push(id);
            if self.signals.token(id).is_some() {
                break;
            }
            next = self.store.read_node(id)?.parent_id;
        }
        lineage.reverse();
        self.signals.register_lineage(&lineage)
    }

    /// Latest copy of a node: the one staged in `batch` if present, else the stored one.
    pub fn current(&self, batch: &WriteBatch, id: NodeId) -> Result<AgentNode> {
        match batch.staged(id) {
            Some(node) => Ok(node.clone()),
            None => self.store.read_node(id),
        }
    }

    /// Children of `parent` with any staged copies from `batch` laid over them.
    pub fn current_children(&self, batch: &WriteBatch, parent: NodeId) -> Result<Vec<AgentNode>> {
        Ok(self
            .store
            .children(parent)?
            .into_iter()
            .map(|c| batch.staged(c.id).cloned().unwrap_or(c))
            .collect())
    }

    /// Commit a batch and stream its records to the sink.
    pub fn commit(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut outgoing: Vec<TreeEvent> = batch
            .transitions()
            .iter()
            .cloned()
            .map(TreeEvent::Phase)
            .collect();
        outgoing.extend(batch.events().iter().cloned().map(TreeEvent::Coordination));
        self.store.commit(batch)?;
        self.publish(outgoing);
        Ok(())
    }

    fn publish(&self, events: Vec<TreeEvent>) {
        let Some(sink) = self.sink.as_ref() else {
            return;
        };
        for event in events {
            alog_trace!("publish {:?}", event);
            match sink.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(event)) => {
                    alog_warn!("event sink full, dropped event for node {}", event.node_id());
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }
}
