//! Consensus message types and their wire codecs
//!
//! Compact hand-written serializers standing in for generated data type
//! code; the layouts stay bit-compatible with peers. All integers are
//! little-endian.

use heapless::Vec;

use crate::core::{
    DataTypeDescriptor, DataTypeId, DataTypeSignature, NodeId, UniqueId,
};

/// Raft term counter
pub type Term = u32;

/// Upper bound on the cluster size, set by the `Discovery` message capacity.
pub const MAX_SERVERS: usize = 5;

/// `AppendEntries` replicates at most this many log entries per call.
pub const MAX_ENTRIES_PER_REQUEST: usize = 1;

/// One replicated log record: a unique ID with its allocated node ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Entry {
    pub term: Term,
    pub unique_id: UniqueId,
    pub node_id: NodeId,
}

impl Entry {
    pub const WIRE_SIZE: usize = 4 + UniqueId::SIZE + 1;

    fn serialize(&self, out: &mut [u8]) -> Option<usize> {
        if out.len() < Self::WIRE_SIZE {
            return None;
        }
        out[..4].copy_from_slice(&self.term.to_le_bytes());
        out[4..4 + UniqueId::SIZE].copy_from_slice(self.unique_id.as_bytes());
        out[4 + UniqueId::SIZE] = self.node_id.into_u8();
        Some(Self::WIRE_SIZE)
    }

    fn deserialize(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::WIRE_SIZE {
            return None;
        }
        Some(Self {
            term: Term::from_le_bytes(bytes[..4].try_into().ok()?),
            unique_id: UniqueId::new(bytes[4..4 + UniqueId::SIZE].try_into().ok()?),
            node_id: NodeId::new(bytes[4 + UniqueId::SIZE])?,
        })
    }
}

/// Log replication request, also serving as the leader heartbeat when empty
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub prev_log_index: u8,
    pub prev_log_term: Term,
    pub leader_commit: u8,
    pub entries: Vec<Entry, MAX_ENTRIES_PER_REQUEST>,
}

impl AppendEntriesRequest {
    pub const DATA_TYPE: DataTypeDescriptor = DataTypeDescriptor::new(
        DataTypeId::new(30),
        DataTypeSignature::new(0x8032_c297_b979_3faf),
    );
    pub const MAX_WIRE_SIZE: usize = 10 + MAX_ENTRIES_PER_REQUEST * Entry::WIRE_SIZE;

    pub fn serialize(&self, out: &mut [u8]) -> Option<usize> {
        if out.len() < 10 + self.entries.len() * Entry::WIRE_SIZE {
            return None;
        }
        out[..4].copy_from_slice(&self.term.to_le_bytes());
        out[4] = self.prev_log_index;
        out[5..9].copy_from_slice(&self.prev_log_term.to_le_bytes());
        out[9] = self.leader_commit;
        let mut offset = 10;
        for entry in &self.entries {
            offset += entry.serialize(&mut out[offset..])?;
        }
        Some(offset)
    }

    pub fn deserialize(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 10 {
            return None;
        }
        let mut entries = Vec::new();
        let mut offset = 10;
        while offset < bytes.len() {
            entries.push(Entry::deserialize(&bytes[offset..])?).ok()?;
            offset += Entry::WIRE_SIZE;
        }
        if offset != bytes.len() {
            return None;
        }
        Some(Self {
            term: Term::from_le_bytes(bytes[..4].try_into().ok()?),
            prev_log_index: bytes[4],
            prev_log_term: Term::from_le_bytes(bytes[5..9].try_into().ok()?),
            leader_commit: bytes[9],
            entries,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
}

impl AppendEntriesResponse {
    pub const WIRE_SIZE: usize = 5;

    pub fn serialize(&self, out: &mut [u8]) -> Option<usize> {
        if out.len() < Self::WIRE_SIZE {
            return None;
        }
        out[..4].copy_from_slice(&self.term.to_le_bytes());
        out[4] = self.success as u8;
        Some(Self::WIRE_SIZE)
    }

    pub fn deserialize(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::WIRE_SIZE || bytes[4] > 1 {
            return None;
        }
        Some(Self {
            term: Term::from_le_bytes(bytes[..4].try_into().ok()?),
            success: bytes[4] != 0,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RequestVoteRequest {
    pub term: Term,
    pub last_log_index: u8,
    pub last_log_term: Term,
}

impl RequestVoteRequest {
    pub const DATA_TYPE: DataTypeDescriptor = DataTypeDescriptor::new(
        DataTypeId::new(31),
        DataTypeSignature::new(0xcdde_07bb_8d3a_71c4),
    );
    pub const WIRE_SIZE: usize = 9;

    pub fn serialize(&self, out: &mut [u8]) -> Option<usize> {
        if out.len() < Self::WIRE_SIZE {
            return None;
        }
        out[..4].copy_from_slice(&self.term.to_le_bytes());
        out[4] = self.last_log_index;
        out[5..9].copy_from_slice(&self.last_log_term.to_le_bytes());
        Some(Self::WIRE_SIZE)
    }

    pub fn deserialize(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::WIRE_SIZE {
            return None;
        }
        Some(Self {
            term: Term::from_le_bytes(bytes[..4].try_into().ok()?),
            last_log_index: bytes[4],
            last_log_term: Term::from_le_bytes(bytes[5..9].try_into().ok()?),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

impl RequestVoteResponse {
    pub const WIRE_SIZE: usize = 5;

    pub fn serialize(&self, out: &mut [u8]) -> Option<usize> {
        if out.len() < Self::WIRE_SIZE {
            return None;
        }
        out[..4].copy_from_slice(&self.term.to_le_bytes());
        out[4] = self.vote_granted as u8;
        Some(Self::WIRE_SIZE)
    }

    pub fn deserialize(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::WIRE_SIZE || bytes[4] > 1 {
            return None;
        }
        Some(Self {
            term: Term::from_le_bytes(bytes[..4].try_into().ok()?),
            vote_granted: bytes[4] != 0,
        })
    }
}

/// Periodic broadcast through which servers find each other
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Discovery {
    pub configured_cluster_size: u8,
    pub known_nodes: Vec<NodeId, MAX_SERVERS>,
}

impl Discovery {
    pub const DATA_TYPE: DataTypeDescriptor = DataTypeDescriptor::new(
        DataTypeId::new(390),
        DataTypeSignature::new(0x821a_e2f5_25f6_9f21),
    );
    pub const MAX_WIRE_SIZE: usize = 1 + MAX_SERVERS;

    pub fn serialize(&self, out: &mut [u8]) -> Option<usize> {
        if out.len() < 1 + self.known_nodes.len() {
            return None;
        }
        out[0] = self.configured_cluster_size;
        for (slot, node) in out[1..].iter_mut().zip(&self.known_nodes) {
            *slot = node.into_u8();
        }
        Some(1 + self.known_nodes.len())
    }

    pub fn deserialize(bytes: &[u8]) -> Option<Self> {
        let (&configured_cluster_size, rest) = bytes.split_first()?;
        let mut known_nodes = Vec::new();
        for &byte in rest {
            known_nodes.push(NodeId::new(byte)?).ok()?;
        }
        Some(Self {
            configured_cluster_size,
            known_nodes,
        })
    }
}
