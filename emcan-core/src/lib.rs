//! Protocol core data types
//!
//! This crate provides basic data type definitions used by other emcan crates.
//! Stack users should not depend on this crate directly. Use the `emcan::core`
//! reexport instead.
#![no_std]

pub mod crc;

use crc::{Crc16, Crc32, Crc48};

#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InvalidValue;

/// Transfer priority, 5 bits wide.
///
/// Encoded in the most significant bits of the CAN identifier, so the
/// numerically smaller value wins bus arbitration: 0 is the most urgent,
/// 31 the least.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransferPriority(u8);

impl TransferPriority {
    pub const BIT_LENGTH: u8 = 5;
    const MAX_VALUE: u8 = (1 << Self::BIT_LENGTH) - 1;

    pub const HIGHEST: TransferPriority = TransferPriority(0);
    pub const ONE_LOWER_THAN_HIGHEST: TransferPriority = TransferPriority(1);
    pub const DEFAULT: TransferPriority = TransferPriority(1 << (Self::BIT_LENGTH - 1));
    pub const MIDDLE_LOWER: TransferPriority =
        TransferPriority((1 << (Self::BIT_LENGTH - 1)) + (1 << (Self::BIT_LENGTH - 2)));
    pub const ONE_HIGHER_THAN_LOWEST: TransferPriority = TransferPriority(Self::MAX_VALUE - 1);
    pub const LOWEST: TransferPriority = TransferPriority(Self::MAX_VALUE);

    pub const fn new(value: u8) -> Option<Self> {
        if value <= Self::MAX_VALUE {
            Some(Self(value))
        } else {
            None
        }
    }

    pub const fn from_u8_truncating(value: u8) -> Self {
        Self(value & Self::MAX_VALUE)
    }

    /// Maps 100% to the highest priority and 0% to the lowest.
    pub const fn from_percent(percent: u8) -> Self {
        let percent = if percent > 100 { 100 } else { percent };
        Self(((100 - percent) as u16 * Self::MAX_VALUE as u16 / 100) as u8)
    }

    pub const fn into_u8(self) -> u8 {
        self.0
    }
}

impl Default for TransferPriority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl From<TransferPriority> for u8 {
    fn from(value: TransferPriority) -> Self {
        value.into_u8()
    }
}

impl TryFrom<u8> for TransferPriority {
    type Error = InvalidValue;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(InvalidValue)
    }
}

/// Modular transfer counter, 5 bits wide.
///
/// Receivers use it to group frames of one transfer and to reject duplicates.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransferId(u8);

impl TransferId {
    pub const BIT_LENGTH: u8 = 5;
    const MAX_VALUE: u8 = (1 << Self::BIT_LENGTH) - 1;
    pub const MAX: TransferId = TransferId(Self::MAX_VALUE);
    pub const HALF_RANGE: u8 = 1 << (Self::BIT_LENGTH - 1);

    pub const fn new(value: u8) -> Option<Self> {
        if value <= Self::MAX_VALUE {
            Some(Self(value))
        } else {
            None
        }
    }

    pub const fn from_u8_truncating(value: u8) -> Self {
        Self(value & Self::MAX_VALUE)
    }

    pub const fn into_u8(self) -> u8 {
        self.0
    }

    pub const fn next(self) -> Self {
        Self((self.0 + 1) & Self::MAX_VALUE)
    }

    /// Amount of `next()` calls needed to reach `rhs`.
    ///
    /// The result is in `[0, 2^BIT_LENGTH)`.
    pub const fn forward_distance(self, rhs: Self) -> u8 {
        rhs.0.wrapping_sub(self.0) & Self::MAX_VALUE
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self(0)
    }
}

impl From<TransferId> for u8 {
    fn from(value: TransferId) -> Self {
        value.into_u8()
    }
}

impl TryFrom<u8> for TransferId {
    type Error = InvalidValue;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(InvalidValue)
    }
}

/// Unicast node address, 7 bits wide.
///
/// Only valid unicast values `1..=127` are representable. The wire code 0
/// (broadcast destination, anonymous source) is expressed as
/// `Option::<NodeId>::None` throughout the stack, and the reserved invalid
/// code 0xFF cannot be constructed at all.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NodeId(u8);

impl NodeId {
    pub const BIT_LENGTH: u8 = 7;
    const MAX_VALUE: u8 = (1 << Self::BIT_LENGTH) - 1;
    pub const MAX: NodeId = NodeId(Self::MAX_VALUE);
    /// The two topmost addresses are reserved for network maintenance tools.
    pub const MAX_RECOMMENDED_FOR_REGULAR_NODES: NodeId = NodeId(Self::MAX_VALUE - 2);

    pub const fn new(value: u8) -> Option<Self> {
        if value >= 1 && value <= Self::MAX_VALUE {
            Some(Self(value))
        } else {
            None
        }
    }

    pub const fn into_u8(self) -> u8 {
        self.0
    }
}

impl From<NodeId> for u8 {
    fn from(value: NodeId) -> Self {
        value.into_u8()
    }
}

impl From<NodeId> for usize {
    fn from(value: NodeId) -> Self {
        u8::from(value).into()
    }
}

impl TryFrom<u8> for NodeId {
    type Error = InvalidValue;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(InvalidValue)
    }
}

/// Transfer kind as encoded on the bus.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum TransferType {
    ServiceResponse = 0,
    ServiceRequest = 1,
    MessageBroadcast = 2,
}

impl TransferType {
    pub const fn into_u8(self) -> u8 {
        self as u8
    }

    pub const fn try_from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(TransferType::ServiceResponse),
            1 => Some(TransferType::ServiceRequest),
            2 => Some(TransferType::MessageBroadcast),
            _ => None,
        }
    }

    pub const fn data_type_kind(self) -> DataTypeKind {
        match self {
            TransferType::MessageBroadcast => DataTypeKind::Message,
            TransferType::ServiceRequest | TransferType::ServiceResponse => DataTypeKind::Service,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataTypeKind {
    Message,
    Service,
}

/// Numeric data type identifier.
///
/// Message types occupy 16 bits on the wire, service types only 8.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DataTypeId(u16);

impl DataTypeId {
    pub const MAX_MESSAGE: DataTypeId = DataTypeId(u16::MAX);
    pub const MAX_SERVICE: DataTypeId = DataTypeId(u8::MAX as u16);

    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    pub const fn into_u16(self) -> u16 {
        self.0
    }

    pub const fn is_valid_for(self, kind: DataTypeKind) -> bool {
        match kind {
            DataTypeKind::Message => true,
            DataTypeKind::Service => self.0 <= Self::MAX_SERVICE.0,
        }
    }
}

impl From<DataTypeId> for u16 {
    fn from(value: DataTypeId) -> Self {
        value.into_u16()
    }
}

impl From<u16> for DataTypeId {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

/// 64-bit hash of a data type definition.
///
/// Peers with mismatched definitions compute different transfer CRCs and
/// therefore reject each other's multi-frame transfers. The signature seeds
/// the CRC by feeding its little-endian bytes before the payload.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DataTypeSignature(u64);

impl DataTypeSignature {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn into_u64(self) -> u64 {
        self.0
    }

    pub fn to_crc16(self) -> Crc16 {
        let mut crc = Crc16::new();
        crc.add_bytes(&self.0.to_le_bytes());
        crc
    }

    pub fn to_crc32(self) -> Crc32 {
        let mut crc = Crc32::new();
        crc.add_bytes(&self.0.to_le_bytes());
        crc
    }

    pub fn to_crc48(self) -> Crc48 {
        let mut crc = Crc48::new();
        crc.add_bytes(&self.0.to_le_bytes());
        crc
    }
}

/// Data type identity as produced by the code generator: the numeric ID the
/// type is served under and the signature of its definition.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DataTypeDescriptor {
    pub id: DataTypeId,
    pub signature: DataTypeSignature,
}

impl DataTypeDescriptor {
    pub const fn new(id: DataTypeId, signature: DataTypeSignature) -> Self {
        Self { id, signature }
    }
}

/// 128-bit immutable device identifier.
///
/// Dynamic node IDs are assigned against this key.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct UniqueId([u8; Self::SIZE]);

impl UniqueId {
    pub const SIZE: usize = 16;

    pub const fn new(bytes: [u8; Self::SIZE]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; Self::SIZE] {
        &self.0
    }
}

impl From<[u8; UniqueId::SIZE]> for UniqueId {
    fn from(bytes: [u8; UniqueId::SIZE]) -> Self {
        Self(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_levels() {
        assert_eq!(TransferPriority::DEFAULT.into_u8(), 16);
        assert_eq!(TransferPriority::MIDDLE_LOWER.into_u8(), 24);
        assert_eq!(TransferPriority::LOWEST.into_u8(), 31);
        assert!(TransferPriority::HIGHEST < TransferPriority::LOWEST);
        assert!(TransferPriority::new(32).is_none());
    }

    #[test]
    fn test_priority_from_percent() {
        assert_eq!(TransferPriority::from_percent(100), TransferPriority::HIGHEST);
        assert_eq!(TransferPriority::from_percent(0), TransferPriority::LOWEST);
        assert_eq!(TransferPriority::from_percent(50).into_u8(), 15);
    }

    #[test]
    fn test_transfer_id_next_wraps() {
        let tid = TransferId::MAX;
        assert_eq!(tid.next().into_u8(), 0);
        assert_eq!(TransferId::default().next().into_u8(), 1);
    }

    #[test]
    fn test_transfer_id_forward_distance() {
        for a in 0..=TransferId::MAX_VALUE {
            for b in 0..=TransferId::MAX_VALUE {
                let a = TransferId::new(a).unwrap();
                let b = TransferId::new(b).unwrap();
                let d = a.forward_distance(b);
                assert!(d < 1 << TransferId::BIT_LENGTH);
                assert_eq!((a.into_u8() + d) & TransferId::MAX_VALUE, b.into_u8());
            }
        }
    }

    #[test]
    fn test_node_id_reserved_codes() {
        assert!(NodeId::new(0).is_none());
        assert!(NodeId::new(128).is_none());
        assert!(NodeId::new(0xff).is_none());
        assert_eq!(NodeId::new(127), Some(NodeId::MAX));
        assert_eq!(NodeId::MAX_RECOMMENDED_FOR_REGULAR_NODES.into_u8(), 125);
    }

    #[test]
    fn test_data_type_id_validity() {
        assert!(DataTypeId::new(0x1ff).is_valid_for(DataTypeKind::Message));
        assert!(!DataTypeId::new(0x1ff).is_valid_for(DataTypeKind::Service));
        assert!(DataTypeId::new(0xff).is_valid_for(DataTypeKind::Service));
    }

    #[test]
    fn test_signature_seeds_crc() {
        let signature = DataTypeSignature::new(0x0102_0304_0506_0708);
        let mut reference = Crc16::new();
        reference.add_bytes(&[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
        assert_eq!(signature.to_crc16().get(), reference.get());
    }
}
