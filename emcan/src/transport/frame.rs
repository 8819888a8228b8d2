//! Protocol frame object
//!
//! One CAN-frame-sized protocol unit. The 29-bit extended CAN identifier
//! carries the addressing information, the last data byte is the tail byte
//! with the transfer sequencing flags:
//!
//! ```text
//! extended CAN ID        message broadcast          service
//!   bits 28..24          priority                   priority
//!   bits 23..8           data type ID (16 bits)     [23..16] data type ID (8 bits)
//!                                                   [15]     request, not response
//!                                                   [14..8]  destination node ID
//!   bit  7               0                          1
//!   bits 6..0            source node ID             source node ID
//!
//! tail byte: [7] start-of-transfer [6] end-of-transfer [5] toggle [4..0] transfer ID
//! ```
//!
//! Wire code 0 in a node-ID field stands for the broadcast destination or the
//! anonymous source and maps to `None` at this level.

use crate::can::{CanFrame, CanRxFrame, Data};
use crate::core::{
    DataTypeId, NodeId, TransferId, TransferPriority, TransferType,
};
use crate::time::Instant;
use crate::transport::TransferCrcKind;

const SERVICE_NOT_MESSAGE: u32 = 1 << 7;
const REQUEST_NOT_RESPONSE: u32 = 1 << 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) struct TailByte(u8);

impl TailByte {
    const START_OF_TRANSFER: u8 = 7;
    const END_OF_TRANSFER: u8 = 6;
    const TOGGLE: u8 = 5;

    pub fn new(sot: bool, eot: bool, toggle: bool, transfer_id: TransferId) -> Self {
        Self(
            (sot as u8) << Self::START_OF_TRANSFER
                | (eot as u8) << Self::END_OF_TRANSFER
                | (toggle as u8) << Self::TOGGLE
                | u8::from(transfer_id),
        )
    }

    pub fn sot(&self) -> bool {
        (self.0 >> Self::START_OF_TRANSFER) & 0x1 != 0
    }

    pub fn eot(&self) -> bool {
        (self.0 >> Self::END_OF_TRANSFER) & 0x1 != 0
    }

    pub fn toggle(&self) -> bool {
        (self.0 >> Self::TOGGLE) & 0x1 != 0
    }

    pub fn transfer_id(&self) -> TransferId {
        TransferId::from_u8_truncating(self.0)
    }
}

impl From<TailByte> for u8 {
    fn from(value: TailByte) -> Self {
        value.0
    }
}

impl From<u8> for TailByte {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

/// One CAN-frame-sized protocol unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Frame {
    priority: TransferPriority,
    transfer_type: TransferType,
    data_type_id: DataTypeId,
    src: Option<NodeId>,
    dst: Option<NodeId>,
    transfer_id: TransferId,
    start_of_transfer: bool,
    end_of_transfer: bool,
    toggle: bool,
    payload: [u8; Self::PAYLOAD_CAPACITY],
    payload_length: u8,
    crc_kind: TransferCrcKind,
    auto_transfer_id_base: Option<TransferId>,
}

impl Frame {
    /// The eighth CAN data byte carries the tail byte.
    pub const PAYLOAD_CAPACITY: usize = Data::MAX - 1;

    pub fn new(
        data_type_id: DataTypeId,
        transfer_type: TransferType,
        src: Option<NodeId>,
        dst: Option<NodeId>,
        transfer_id: TransferId,
    ) -> Self {
        Self {
            priority: TransferPriority::DEFAULT,
            transfer_type,
            data_type_id,
            src,
            dst,
            transfer_id,
            start_of_transfer: false,
            end_of_transfer: false,
            toggle: false,
            payload: [0; Self::PAYLOAD_CAPACITY],
            payload_length: 0,
            crc_kind: TransferCrcKind::Crc16,
            auto_transfer_id_base: None,
        }
    }

    /// Copies up to [`Frame::PAYLOAD_CAPACITY`] bytes into the frame buffer,
    /// returning the number actually written.
    pub fn set_payload(&mut self, data: &[u8]) -> usize {
        let length = data.len().min(Self::PAYLOAD_CAPACITY);
        self.payload[..length].copy_from_slice(&data[..length]);
        self.payload_length = length as u8;
        length
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.payload_length as usize]
    }

    pub fn priority(&self) -> TransferPriority {
        self.priority
    }

    pub fn set_priority(&mut self, priority: TransferPriority) {
        self.priority = priority;
    }

    pub fn transfer_type(&self) -> TransferType {
        self.transfer_type
    }

    pub fn data_type_id(&self) -> DataTypeId {
        self.data_type_id
    }

    pub fn src(&self) -> Option<NodeId> {
        self.src
    }

    pub fn dst(&self) -> Option<NodeId> {
        self.dst
    }

    pub fn transfer_id(&self) -> TransferId {
        self.transfer_id
    }

    pub fn set_transfer_id(&mut self, transfer_id: TransferId) {
        self.transfer_id = transfer_id;
    }

    pub fn is_start_of_transfer(&self) -> bool {
        self.start_of_transfer
    }

    pub fn set_start_of_transfer(&mut self, value: bool) {
        self.start_of_transfer = value;
    }

    pub fn is_end_of_transfer(&self) -> bool {
        self.end_of_transfer
    }

    pub fn set_end_of_transfer(&mut self, value: bool) {
        self.end_of_transfer = value;
    }

    pub fn toggle(&self) -> bool {
        self.toggle
    }

    pub fn flip_toggle(&mut self) {
        self.toggle = !self.toggle;
    }

    pub fn crc_kind(&self) -> TransferCrcKind {
        self.crc_kind
    }

    pub fn set_crc_kind(&mut self, kind: TransferCrcKind) {
        self.crc_kind = kind;
    }

    /// Makes the sender assign a distinct, incrementing transfer ID to every
    /// emitted frame, starting from `base`. Used by streams whose wire
    /// protocol numbers individual CAN frames rather than whole transfers.
    pub fn set_auto_transfer_id(&mut self, base: TransferId) {
        self.auto_transfer_id_base = Some(base);
    }

    pub fn auto_transfer_id_base(&self) -> Option<TransferId> {
        self.auto_transfer_id_base
    }

    /// Checks the frame against the protocol invariants:
    ///
    /// * a transfer is a message broadcast exactly when its destination is
    ///   the broadcast address;
    /// * a unicast source never addresses itself;
    /// * `start && end` (single-frame transfer) implies a cleared toggle;
    /// * an anonymous source may only emit single-frame message broadcasts;
    /// * the data type ID fits the data type kind of the transfer.
    pub fn is_valid(&self) -> bool {
        if (self.transfer_type == TransferType::MessageBroadcast) != self.dst.is_none() {
            return false;
        }
        if let (Some(src), Some(dst)) = (self.src, self.dst) {
            if src == dst {
                return false;
            }
        }
        if self.start_of_transfer && self.end_of_transfer && self.toggle {
            return false;
        }
        if self.src.is_none()
            && !(self.transfer_type == TransferType::MessageBroadcast
                && self.start_of_transfer
                && self.end_of_transfer
                && !self.toggle)
        {
            return false;
        }
        self.data_type_id
            .is_valid_for(self.transfer_type.data_type_kind())
    }

    /// Encodes the frame into a raw CAN frame. Fails when the frame does not
    /// satisfy [`Frame::is_valid`].
    pub fn compile(&self) -> Option<CanFrame> {
        if !self.is_valid() {
            return None;
        }

        let src = self.src.map_or(0, NodeId::into_u8) as u32;
        let priority = (self.priority.into_u8() as u32) << 24;
        let id = match self.transfer_type {
            TransferType::MessageBroadcast => {
                priority | (self.data_type_id.into_u16() as u32) << 8 | src
            }
            TransferType::ServiceRequest | TransferType::ServiceResponse => {
                let dst = self.dst.map_or(0, NodeId::into_u8) as u32;
                let request = if self.transfer_type == TransferType::ServiceRequest {
                    REQUEST_NOT_RESPONSE
                } else {
                    0
                };
                priority
                    | (self.data_type_id.into_u16() as u32) << 16
                    | request
                    | dst << 8
                    | SERVICE_NOT_MESSAGE
                    | src
            }
        };

        let tail = TailByte::new(
            self.start_of_transfer,
            self.end_of_transfer,
            self.toggle,
            self.transfer_id,
        );

        let mut data = [0u8; Data::MAX];
        let payload_length = self.payload_length as usize;
        data[..payload_length].copy_from_slice(self.payload());
        data[payload_length] = tail.into();

        CanFrame::new_extended(id, &data[..payload_length + 1])
    }

    /// Decodes a raw CAN frame. Standard-ID frames, remote frames, and
    /// frames without a tail byte are rejected; the result still has to pass
    /// [`Frame::is_valid`].
    pub fn parse(can_frame: &CanFrame) -> Option<Self> {
        if can_frame.remote {
            return None;
        }
        let id = can_frame.extended_id()?;
        let (tail_byte, payload) = can_frame.data.split_last()?;
        let tail = TailByte::from(*tail_byte);

        let priority = TransferPriority::from_u8_truncating((id >> 24) as u8);
        let src = NodeId::new((id & 0x7f) as u8);

        let (transfer_type, data_type_id, dst) = if id & SERVICE_NOT_MESSAGE != 0 {
            let transfer_type = if id & REQUEST_NOT_RESPONSE != 0 {
                TransferType::ServiceRequest
            } else {
                TransferType::ServiceResponse
            };
            // A service transfer addressed to the broadcast code is malformed.
            let dst = NodeId::new((id >> 8) as u8 & 0x7f)?;
            let data_type_id = DataTypeId::new((id >> 16) as u16 & 0xff);
            (transfer_type, data_type_id, Some(dst))
        } else {
            let data_type_id = DataTypeId::new((id >> 8) as u16);
            (TransferType::MessageBroadcast, data_type_id, None)
        };

        let mut frame = Frame::new(data_type_id, transfer_type, src, dst, tail.transfer_id());
        frame.priority = priority;
        frame.start_of_transfer = tail.sot();
        frame.end_of_transfer = tail.eot();
        frame.toggle = tail.toggle();
        frame.set_payload(payload);
        Some(frame)
    }
}

/// Received protocol frame with its monotonic reception timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RxFrame {
    pub frame: Frame,
    pub timestamp: Instant,
}

impl RxFrame {
    pub fn parse(can_frame: &CanRxFrame) -> Option<Self> {
        Some(Self {
            frame: Frame::parse(&can_frame.frame)?,
            timestamp: can_frame.timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: u8) -> Option<NodeId> {
        Some(NodeId::new(id).unwrap())
    }

    fn tid(value: u8) -> TransferId {
        TransferId::new(value).unwrap()
    }

    #[test]
    fn test_tail_byte_round_trip() {
        let tail = TailByte::new(true, true, false, tid(3));
        assert_eq!(u8::from(tail), 0b1100_0011);

        let tail = TailByte::from(0b0110_0000 + 27);
        assert!(!tail.sot());
        assert!(tail.eot());
        assert!(tail.toggle());
        assert_eq!(tail.transfer_id(), tid(27));
    }

    #[test]
    fn test_broadcast_compile() {
        let mut frame = Frame::new(
            DataTypeId::new(42),
            TransferType::MessageBroadcast,
            node(10),
            None,
            tid(3),
        );
        frame.set_start_of_transfer(true);
        frame.set_end_of_transfer(true);
        assert_eq!(frame.set_payload(b"hello!."), 7);

        let can_frame = frame.compile().unwrap();
        assert_eq!(
            can_frame.extended_id().unwrap(),
            (TransferPriority::DEFAULT.into_u8() as u32) << 24 | 42 << 8 | 10
        );
        assert_eq!(&can_frame.data[..7], b"hello!.");
        assert_eq!(can_frame.data[7], 0b1100_0011);
    }

    #[test]
    fn test_service_round_trip() {
        let mut frame = Frame::new(
            DataTypeId::new(30),
            TransferType::ServiceRequest,
            node(2),
            node(125),
            tid(17),
        );
        frame.set_priority(TransferPriority::new(8).unwrap());
        frame.set_start_of_transfer(true);
        frame.set_payload(&[0xaa, 0xbb]);

        let can_frame = frame.compile().unwrap();
        let parsed = Frame::parse(&can_frame).unwrap();
        assert_eq!(parsed.transfer_type(), TransferType::ServiceRequest);
        assert_eq!(parsed.data_type_id(), DataTypeId::new(30));
        assert_eq!(parsed.src(), node(2));
        assert_eq!(parsed.dst(), node(125));
        assert_eq!(parsed.transfer_id(), tid(17));
        assert_eq!(parsed.priority(), TransferPriority::new(8).unwrap());
        assert!(parsed.is_start_of_transfer());
        assert!(!parsed.is_end_of_transfer());
        assert_eq!(parsed.payload(), &[0xaa, 0xbb]);
    }

    #[test]
    fn test_broadcast_round_trip_anonymous() {
        let mut frame = Frame::new(
            DataTypeId::new(1),
            TransferType::MessageBroadcast,
            None,
            None,
            tid(0),
        );
        frame.set_start_of_transfer(true);
        frame.set_end_of_transfer(true);
        frame.set_payload(&[0x55]);

        let can_frame = frame.compile().unwrap();
        let parsed = Frame::parse(&can_frame).unwrap();
        assert_eq!(parsed.src(), None);
        assert!(parsed.is_valid());
    }

    #[test]
    fn test_invalid_combinations() {
        // Broadcast with a destination set is no broadcast.
        let frame = Frame::new(
            DataTypeId::new(1),
            TransferType::MessageBroadcast,
            node(1),
            node(2),
            tid(0),
        );
        assert!(!frame.is_valid());

        // Self-addressed service transfer.
        let mut frame = Frame::new(
            DataTypeId::new(1),
            TransferType::ServiceRequest,
            node(5),
            node(5),
            tid(0),
        );
        frame.set_start_of_transfer(true);
        frame.set_end_of_transfer(true);
        assert!(!frame.is_valid());

        // Single-frame transfer with a set toggle.
        let mut frame = Frame::new(
            DataTypeId::new(1),
            TransferType::MessageBroadcast,
            node(5),
            None,
            tid(0),
        );
        frame.set_start_of_transfer(true);
        frame.set_end_of_transfer(true);
        frame.flip_toggle();
        assert!(!frame.is_valid());

        // Anonymous multi-frame transfer.
        let mut frame = Frame::new(
            DataTypeId::new(1),
            TransferType::MessageBroadcast,
            None,
            None,
            tid(0),
        );
        frame.set_start_of_transfer(true);
        assert!(!frame.is_valid());

        // Service data type ID out of the 8-bit range.
        let mut frame = Frame::new(
            DataTypeId::new(0x100),
            TransferType::ServiceRequest,
            node(1),
            node(2),
            tid(0),
        );
        frame.set_start_of_transfer(true);
        frame.set_end_of_transfer(true);
        assert!(!frame.is_valid());
    }

    #[test]
    fn test_payload_truncation() {
        let mut frame = Frame::new(
            DataTypeId::new(1),
            TransferType::MessageBroadcast,
            node(1),
            None,
            tid(0),
        );
        assert_eq!(frame.set_payload(&[0u8; 10]), Frame::PAYLOAD_CAPACITY);
        assert_eq!(frame.payload().len(), Frame::PAYLOAD_CAPACITY);
    }

    #[test]
    fn test_parse_rejects_remote_and_standard() {
        let mut can_frame = CanFrame::new_extended(0x1234_5678, &[0x00]).unwrap();
        can_frame.remote = true;
        assert!(Frame::parse(&can_frame).is_none());

        let can_frame = CanFrame {
            id: crate::can::Id::Standard(crate::can::StandardId::new(0x123).unwrap()),
            data: crate::can::Data::new(&[0x00]).unwrap(),
            remote: false,
        };
        assert!(Frame::parse(&can_frame).is_none());
    }
}
