//! Cluster membership and replication progress
//!
//! Tracks the peer servers discovered through `Discovery` broadcasts and
//! the per-peer replication indices the leader needs. The local server is
//! not listed among the peers.

use heapless::Vec;

use crate::core::NodeId;
use crate::raft::log::LogIndex;
use crate::raft::message::{Discovery, MAX_SERVERS};
use crate::storage::{MarshallingStorage, StorageBackend};

const KEY_CLUSTER_SIZE: &str = "cluster_size";

/// Passed to [`ClusterManager::init`] to read the cluster size from storage.
pub const CLUSTER_SIZE_UNKNOWN: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ClusterError {
    /// The cluster size was neither given nor readable from storage.
    Storage,
    /// The cluster size is outside `[1, MAX_SERVERS]`.
    InvalidClusterSize,
}

/// In-flight `AppendEntries` bookkeeping, used to interpret the response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingAppend {
    pub prev_log_index: LogIndex,
    pub num_entries: u8,
}

#[derive(Debug)]
struct Peer {
    node_id: NodeId,
    next_index: LogIndex,
    match_index: LogIndex,
    pending_append: Option<PendingAppend>,
}

pub struct ClusterManager {
    peers: Vec<Peer, { MAX_SERVERS - 1 }>,
    cluster_size: u8,
}

impl ClusterManager {
    pub fn new() -> Self {
        Self {
            peers: Vec::new(),
            cluster_size: 0,
        }
    }

    /// Configures the cluster size, reading key `cluster_size` from storage
    /// when the caller passes [`CLUSTER_SIZE_UNKNOWN`]. An explicitly given
    /// size is persisted for later boots.
    pub fn init<S: StorageBackend>(
        &mut self,
        cluster_size: u8,
        storage: &mut MarshallingStorage<S>,
    ) -> Result<(), ClusterError> {
        let size = if cluster_size == CLUSTER_SIZE_UNKNOWN {
            storage.get_u8(KEY_CLUSTER_SIZE).ok_or(ClusterError::Storage)?
        } else {
            storage
                .set_and_get_back_u8(KEY_CLUSTER_SIZE, cluster_size)
                .map_err(|_| ClusterError::Storage)?;
            cluster_size
        };

        if size == 0 || size as usize > MAX_SERVERS {
            return Err(ClusterError::InvalidClusterSize);
        }
        self.cluster_size = size;
        Ok(())
    }

    /// Unions the received server set into the local one.
    pub fn handle_discovery(&mut self, local: NodeId, message: &Discovery) {
        for &node_id in &message.known_nodes {
            if node_id != local {
                self.add_server(node_id);
            }
        }
    }

    /// Registers one peer server, capped at `cluster_size - 1` entries.
    pub fn add_server(&mut self, node_id: NodeId) {
        if self.peers.iter().any(|peer| peer.node_id == node_id) {
            return;
        }
        if self.peers.len() + 1 >= self.cluster_size as usize {
            return;
        }
        debug!("discovered server {}", node_id.into_u8());
        let _ = self.peers.push(Peer {
            node_id,
            next_index: 0,
            match_index: 0,
            pending_append: None,
        });
    }

    pub fn is_known_server(&self, node_id: NodeId) -> bool {
        self.peers.iter().any(|peer| peer.node_id == node_id)
    }

    /// True once all `cluster_size - 1` peers have been discovered.
    pub fn is_cluster_discovered(&self) -> bool {
        self.peers.len() + 1 == self.cluster_size as usize
    }

    pub fn num_known_servers(&self) -> u8 {
        self.peers.len() as u8 + 1
    }

    pub fn configured_cluster_size(&self) -> u8 {
        self.cluster_size
    }

    /// Votes required to elect a leader or commit an entry.
    pub fn quorum_size(&self) -> u8 {
        self.cluster_size / 2 + 1
    }

    pub fn servers(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.peers.iter().map(|peer| peer.node_id)
    }

    /// The local `Discovery` broadcast: the whole known server set, self
    /// included.
    pub fn make_discovery(&self, local: NodeId) -> Discovery {
        let mut known_nodes = Vec::new();
        let _ = known_nodes.push(local);
        for peer in &self.peers {
            let _ = known_nodes.push(peer.node_id);
        }
        Discovery {
            configured_cluster_size: self.cluster_size,
            known_nodes,
        }
    }

    pub fn next_index(&self, node_id: NodeId) -> Option<LogIndex> {
        self.peer(node_id).map(|peer| peer.next_index)
    }

    pub fn match_index(&self, node_id: NodeId) -> Option<LogIndex> {
        self.peer(node_id).map(|peer| peer.match_index)
    }

    pub(crate) fn match_indices(&self) -> impl Iterator<Item = LogIndex> + '_ {
        self.peers.iter().map(|peer| peer.match_index)
    }

    /// Records a successful replication up to `match_index`.
    pub(crate) fn set_progress(&mut self, node_id: NodeId, match_index: LogIndex) {
        if let Some(peer) = self.peer_mut(node_id) {
            peer.match_index = match_index;
            peer.next_index = match_index + 1;
        }
    }

    /// Backtracks after a failed consistency check, clamped to index 1.
    pub(crate) fn decrement_next_index(&mut self, node_id: NodeId) {
        if let Some(peer) = self.peer_mut(node_id) {
            peer.next_index = peer.next_index.saturating_sub(1).max(1);
        }
    }

    pub(crate) fn set_pending_append(&mut self, node_id: NodeId, pending: PendingAppend) {
        if let Some(peer) = self.peer_mut(node_id) {
            peer.pending_append = Some(pending);
        }
    }

    pub(crate) fn take_pending_append(&mut self, node_id: NodeId) -> Option<PendingAppend> {
        self.peer_mut(node_id)?.pending_append.take()
    }

    /// Called when the local server becomes leader.
    pub fn reset_all_server_indices(&mut self, last_log_index: LogIndex) {
        for peer in &mut self.peers {
            peer.next_index = last_log_index + 1;
            peer.match_index = 0;
            peer.pending_append = None;
        }
    }

    fn peer(&self, node_id: NodeId) -> Option<&Peer> {
        self.peers.iter().find(|peer| peer.node_id == node_id)
    }

    fn peer_mut(&mut self, node_id: NodeId) -> Option<&mut Peer> {
        self.peers.iter_mut().find(|peer| peer.node_id == node_id)
    }
}

impl Default for ClusterManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;

    fn node(id: u8) -> NodeId {
        NodeId::new(id).unwrap()
    }

    fn manager(cluster_size: u8) -> ClusterManager {
        let mut storage = MarshallingStorage::new(MemoryBackend::new());
        let mut manager = ClusterManager::new();
        manager.init(cluster_size, &mut storage).unwrap();
        manager
    }

    #[test]
    fn test_quorum_arithmetic() {
        for (cluster_size, quorum) in [(1, 1), (2, 2), (3, 2), (4, 3), (5, 3)] {
            assert_eq!(manager(cluster_size).quorum_size(), quorum);
        }
    }

    #[test]
    fn test_init_reads_storage_when_unknown() {
        let mut storage = MarshallingStorage::new(MemoryBackend::new());
        storage.set_and_get_back_u8("cluster_size", 3).unwrap();

        let mut manager = ClusterManager::new();
        manager.init(CLUSTER_SIZE_UNKNOWN, &mut storage).unwrap();
        assert_eq!(manager.configured_cluster_size(), 3);
    }

    #[test]
    fn test_init_persists_explicit_size() {
        let mut storage = MarshallingStorage::new(MemoryBackend::new());
        let mut manager = ClusterManager::new();
        manager.init(4, &mut storage).unwrap();
        assert_eq!(storage.get_u8("cluster_size"), Some(4));
    }

    #[test]
    fn test_init_rejects_invalid_sizes() {
        let mut storage = MarshallingStorage::new(MemoryBackend::new());
        let mut manager = ClusterManager::new();
        assert_eq!(
            manager.init(CLUSTER_SIZE_UNKNOWN, &mut storage),
            Err(ClusterError::Storage)
        );
        assert_eq!(
            manager.init(MAX_SERVERS as u8 + 1, &mut storage),
            Err(ClusterError::InvalidClusterSize)
        );
    }

    #[test]
    fn test_discovery_union_capped() {
        let mut manager = manager(3);
        let local = node(1);

        let mut message = Discovery {
            configured_cluster_size: 3,
            known_nodes: Vec::new(),
        };
        for id in [1, 2, 3, 4] {
            message.known_nodes.push(node(id)).unwrap();
        }
        manager.handle_discovery(local, &message);

        // Local is excluded and only cluster_size - 1 peers are retained.
        assert!(!manager.is_known_server(local));
        assert!(manager.is_known_server(node(2)));
        assert!(manager.is_known_server(node(3)));
        assert!(!manager.is_known_server(node(4)));
        assert!(manager.is_cluster_discovered());
        assert_eq!(manager.num_known_servers(), 3);
    }

    #[test]
    fn test_replication_progress() {
        let mut manager = manager(3);
        manager.add_server(node(2));
        manager.add_server(node(3));

        manager.reset_all_server_indices(7);
        assert_eq!(manager.next_index(node(2)), Some(8));
        assert_eq!(manager.match_index(node(2)), Some(0));

        manager.set_progress(node(2), 8);
        assert_eq!(manager.next_index(node(2)), Some(9));
        assert_eq!(manager.match_index(node(2)), Some(8));

        manager.decrement_next_index(node(3));
        manager.decrement_next_index(node(3));
        for _ in 0..20 {
            manager.decrement_next_index(node(3));
        }
        assert_eq!(manager.next_index(node(3)), Some(1));
    }

    #[test]
    fn test_make_discovery_lists_self_first() {
        let mut manager = manager(3);
        manager.add_server(node(9));
        let message = manager.make_discovery(node(1));
        assert_eq!(message.configured_cluster_size, 3);
        assert_eq!(message.known_nodes[0], node(1));
        assert_eq!(message.known_nodes[1], node(9));
    }
}
