use std::fs;
use std::path::{Path, PathBuf};

use crate::tree::{AgentNode, CoordinationEvent, NodeId, PhaseTransition};
use crate::{alog_debug, Error, Result};

use super::{MemoryStore, NodeStore, StoreSnapshot, WriteBatch, SNAPSHOT_VERSION};

/// `MemoryStore` that snapshots itself to a JSON file on every commit.
///
/// A batch becomes visible only after its snapshot is on disk. Writes go to
/// `<file>.tmp` and are renamed into place; the previous snapshot is kept
/// as `<file>.bak`.
pub struct JsonFileStore {
    memory: MemoryStore,
    path: PathBuf,
}

impl JsonFileStore {
    /// Open the snapshot at `path`, starting empty if it does not exist yet.
    pub fn open(path: &Path) -> Result<Self> {
        alog_debug!("JsonFileStore::open path={}", path.display());
        let memory = if path.exists() {
            let snapshot: StoreSnapshot = serde_json::from_str(&fs::read_to_string(path)?)?;
            if snapshot.version > SNAPSHOT_VERSION {
                return Err(Error::Store(format!(
                    "snapshot version {} is newer than supported {}",
                    snapshot.version, SNAPSHOT_VERSION
                )));
            }
            alog_debug!("Snapshot loaded: {} nodes", snapshot.nodes.len());
            MemoryStore::from_snapshot(snapshot)
        } else {
            MemoryStore::new()
        };
        Ok(Self {
            memory,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs under the memory store's write lock, so snapshots land in
    /// commit order.
    fn persist(&self, snapshot: &StoreSnapshot) -> Result<()> {
        let contents = serde_json::to_string_pretty(snapshot)?;

        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                fs::create_dir_all(dir)?;
            }
        }
        if self.path.exists() {
            fs::copy(&self.path, self.path.with_extension("json.bak"))?;
        }
        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, &contents)?;
        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

impl NodeStore for JsonFileStore {
    fn commit(&self, batch: WriteBatch) -> Result<()> {
        self.memory.commit_durable(batch, |snapshot| self.persist(snapshot))
    }

    fn read_node(&self, id: NodeId) -> Result<AgentNode> {
        self.memory.read_node(id)
    }

    fn children(&self, id: NodeId) -> Result<Vec<AgentNode>> {
        self.memory.children(id)
    }

    fn read_subtree(&self, id: NodeId) -> Result<Vec<AgentNode>> {
        self.memory.read_subtree(id)
    }

    fn roots(&self) -> Result<Vec<AgentNode>> {
        self.memory.roots()
    }

    fn phase_transitions(&self, id: NodeId) -> Result<Vec<PhaseTransition>> {
        self.memory.phase_transitions(id)
    }

    fn coordination_events(&self, id: NodeId) -> Result<Vec<CoordinationEvent>> {
        self.memory.coordination_events(id)
    }
}
