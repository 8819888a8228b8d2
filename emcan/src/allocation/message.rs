//! `Allocation` broadcast codec
//!
//! The first byte packs the advertised node ID (seven bits, 0 = none) with
//! the first-stage marker in bit 0; the rest is a unique-ID fragment.
//! Requests are anonymous and thus carry at most [`MAX_FRAGMENT_LENGTH`]
//! bytes; server responses run under the server's node ID and may carry the
//! whole accumulated unique ID.

use heapless::Vec;

use crate::core::{DataTypeDescriptor, DataTypeId, DataTypeSignature, NodeId, UniqueId};

/// Longest unique-ID fragment an anonymous (single-frame) request can carry.
pub const MAX_FRAGMENT_LENGTH: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AllocationMessage {
    /// Requested node ID in requests, assigned node ID in the final server
    /// response; absent while the exchange is in progress.
    pub node_id: Option<NodeId>,
    pub first_part_of_unique_id: bool,
    pub unique_id: Vec<u8, { UniqueId::SIZE }>,
}

impl AllocationMessage {
    pub const DATA_TYPE: DataTypeDescriptor = DataTypeDescriptor::new(
        DataTypeId::new(1),
        DataTypeSignature::new(0x0b2a_8126_20a1_1d40),
    );
    pub const MAX_WIRE_SIZE: usize = 1 + UniqueId::SIZE;

    pub fn serialize(&self, out: &mut [u8]) -> Option<usize> {
        if out.len() < 1 + self.unique_id.len() {
            return None;
        }
        out[0] = self.node_id.map_or(0, NodeId::into_u8) << 1
            | self.first_part_of_unique_id as u8;
        out[1..1 + self.unique_id.len()].copy_from_slice(&self.unique_id);
        Some(1 + self.unique_id.len())
    }

    pub fn deserialize(bytes: &[u8]) -> Option<Self> {
        let (&head, fragment) = bytes.split_first()?;
        if fragment.len() > UniqueId::SIZE {
            return None;
        }
        Some(Self {
            node_id: NodeId::new(head >> 1),
            first_part_of_unique_id: head & 0x1 != 0,
            unique_id: Vec::from_slice(fragment).ok()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_round_trip() {
        let message = AllocationMessage {
            node_id: None,
            first_part_of_unique_id: true,
            unique_id: Vec::from_slice(&[1, 2, 3, 4, 5, 6]).unwrap(),
        };
        let mut buffer = [0u8; AllocationMessage::MAX_WIRE_SIZE];
        let length = message.serialize(&mut buffer).unwrap();
        assert_eq!(length, 7);
        assert_eq!(buffer[0], 0x01);
        assert_eq!(AllocationMessage::deserialize(&buffer[..length]).unwrap(), message);
    }

    #[test]
    fn test_assignment_round_trip() {
        let message = AllocationMessage {
            node_id: NodeId::new(125),
            first_part_of_unique_id: false,
            unique_id: Vec::from_slice(&[0; 16]).unwrap(),
        };
        let mut buffer = [0u8; AllocationMessage::MAX_WIRE_SIZE];
        let length = message.serialize(&mut buffer).unwrap();
        assert_eq!(length, 17);
        assert_eq!(buffer[0], 125 << 1);
        assert_eq!(AllocationMessage::deserialize(&buffer[..length]).unwrap(), message);
    }

    #[test]
    fn test_oversized_fragment_rejected() {
        let bytes = [0u8; 18];
        assert!(AllocationMessage::deserialize(&bytes).is_none());
        assert!(AllocationMessage::deserialize(&[]).is_none());
    }
}
