//! Transfer emission
//!
//! Segments an application payload into one or more protocol frames and
//! hands them to the dispatcher, such that a peer running the complementary
//! parser re-assembles the payload unambiguously.
//!
//! Single-frame transfers carry the raw payload and both start and end
//! flags. Multi-frame transfers prefix the first frame with the little-
//! endian transfer CRC (seeded from the data type signature) and flip the
//! toggle bit on every subsequent frame.

use crate::bus::CanBus;
use crate::can::CanIoFlags;
use crate::core::crc::{Crc16, Crc32, Crc48};
use crate::core::{DataTypeDescriptor, DataTypeId, DataTypeSignature, NodeId, TransferId,
    TransferPriority, TransferType};
use crate::time::{Duration, Instant};
use crate::transport::dispatcher::Dispatcher;
use crate::transport::frame::Frame;
use crate::transport::registry::{OutgoingTransferRegistryKey, MIN_ENTRY_LIFETIME};
use crate::transport::{SendError, TransferCrcKind};

/// Emits transfers of one data type
pub struct TransferSender {
    data_type_id: DataTypeId,
    signature: DataTypeSignature,
    crc_kind: TransferCrcKind,
    priority: TransferPriority,
    max_transfer_interval: Duration,
    flags: CanIoFlags,
    allow_anonymous_transfers: bool,
}

impl TransferSender {
    pub const DEFAULT_MAX_TRANSFER_INTERVAL: Duration = Duration::from_secs(2);

    pub fn new(descriptor: &DataTypeDescriptor, priority: TransferPriority) -> Self {
        Self {
            data_type_id: descriptor.id,
            signature: descriptor.signature,
            crc_kind: TransferCrcKind::Crc16,
            priority,
            max_transfer_interval: Self::DEFAULT_MAX_TRANSFER_INTERVAL,
            flags: CanIoFlags::NONE,
            allow_anonymous_transfers: false,
        }
    }

    pub fn set_priority(&mut self, priority: TransferPriority) {
        self.priority = priority;
    }

    pub fn set_crc_kind(&mut self, kind: TransferCrcKind) {
        self.crc_kind = kind;
    }

    pub fn set_can_io_flags(&mut self, flags: CanIoFlags) {
        self.flags = flags;
    }

    /// Permits single-frame message broadcasts while the local node has no
    /// ID assigned. Required by the allocation client.
    pub fn allow_anonymous_transfers(&mut self) {
        self.allow_anonymous_transfers = true;
    }

    pub fn set_max_transfer_interval(&mut self, interval: Duration) {
        self.max_transfer_interval = interval;
    }

    /// Sends one transfer; the transfer ID is taken from the outgoing-
    /// transfer registry.
    #[allow(clippy::too_many_arguments)]
    pub fn send<D: CanBus>(
        &self,
        dispatcher: &mut Dispatcher<'_, D>,
        now: Instant,
        payload: &[u8],
        tx_deadline: Instant,
        blocking_deadline: Instant,
        transfer_type: TransferType,
        dst: Option<NodeId>,
    ) -> Result<usize, SendError> {
        let key = OutgoingTransferRegistryKey {
            data_type_id: self.data_type_id,
            transfer_type,
            dst,
        };
        let lifetime = (self.max_transfer_interval * 2).max(MIN_ENTRY_LIFETIME);
        let transfer_id =
            dispatcher
                .registry_mut()
                .access_or_create(key, tx_deadline + lifetime, now)?;

        self.send_with_transfer_id(
            dispatcher,
            payload,
            tx_deadline,
            blocking_deadline,
            transfer_type,
            dst,
            transfer_id,
        )
    }

    /// Sends one transfer under the given transfer ID, bypassing the
    /// registry. Used for service responses, which echo the request ID.
    #[allow(clippy::too_many_arguments)]
    pub fn send_with_transfer_id<D: CanBus>(
        &self,
        dispatcher: &mut Dispatcher<'_, D>,
        payload: &[u8],
        tx_deadline: Instant,
        blocking_deadline: Instant,
        transfer_type: TransferType,
        dst: Option<NodeId>,
        transfer_id: TransferId,
    ) -> Result<usize, SendError> {
        let mut frame = Frame::new(
            self.data_type_id,
            transfer_type,
            dispatcher.node_id(),
            dst,
            transfer_id,
        );
        frame.set_priority(self.priority);
        frame.set_crc_kind(self.crc_kind);
        self.send_frame(dispatcher, &mut frame, payload, tx_deadline, blocking_deadline)
    }

    /// Sends one transfer from a caller-prepared frame template; the caller
    /// may have configured an auto-incrementing transfer-ID base for
    /// per-frame ID streams.
    pub fn send_frame<D: CanBus>(
        &self,
        dispatcher: &mut Dispatcher<'_, D>,
        frame: &mut Frame,
        payload: &[u8],
        tx_deadline: Instant,
        blocking_deadline: Instant,
    ) -> Result<usize, SendError> {
        frame.set_start_of_transfer(true);

        // In passive mode only anonymous single-frame broadcasts may leave
        // the node, and only when explicitly enabled.
        if dispatcher.is_passive() {
            let allowed = self.allow_anonymous_transfers
                && frame.transfer_type() == TransferType::MessageBroadcast
                && payload.len() <= Frame::PAYLOAD_CAPACITY;
            if !allowed {
                return Err(SendError::PassiveMode);
            }
        }

        dispatcher.perf_mut().add_tx_transfer();

        if payload.len() <= Frame::PAYLOAD_CAPACITY {
            self.send_single_frame(dispatcher, frame, payload, tx_deadline, blocking_deadline)
        } else {
            self.send_multi_frame(dispatcher, frame, payload, tx_deadline, blocking_deadline)
        }
    }

    fn send_single_frame<D: CanBus>(
        &self,
        dispatcher: &mut Dispatcher<'_, D>,
        frame: &mut Frame,
        payload: &[u8],
        tx_deadline: Instant,
        blocking_deadline: Instant,
    ) -> Result<usize, SendError> {
        frame.set_payload(payload);
        frame.set_end_of_transfer(true);

        let flags = if frame.src().is_some() {
            self.flags
        } else {
            self.flags | CanIoFlags::ABORT_ON_ERROR
        };

        match dispatcher.dispatch(frame, tx_deadline, blocking_deadline, flags) {
            Ok(()) => Ok(1),
            Err(error) => {
                dispatcher.perf_mut().add_error();
                Err(error)
            }
        }
    }

    fn send_multi_frame<D: CanBus>(
        &self,
        dispatcher: &mut Dispatcher<'_, D>,
        frame: &mut Frame,
        payload: &[u8],
        tx_deadline: Instant,
        blocking_deadline: Instant,
    ) -> Result<usize, SendError> {
        // The passive-mode gate above admits single-frame transfers only.
        if frame.src().is_none() {
            return Err(SendError::Logic);
        }

        let crc_bytes = self.payload_crc(payload).to_le_bytes();
        let prefix = &crc_bytes[..self.crc_kind.prefix_length()];

        let mut chunk = [0u8; Frame::PAYLOAD_CAPACITY];
        chunk[..prefix.len()].copy_from_slice(prefix);
        let head_length = Frame::PAYLOAD_CAPACITY - prefix.len();
        chunk[prefix.len()..].copy_from_slice(&payload[..head_length]);
        frame.set_payload(&chunk);
        let mut offset = head_length;

        let mut transfer_id = frame
            .auto_transfer_id_base()
            .unwrap_or_else(|| frame.transfer_id());
        let mut num_sent = 0usize;

        loop {
            frame.set_transfer_id(transfer_id);
            if let Err(error) = dispatcher.dispatch(frame, tx_deadline, blocking_deadline, self.flags)
            {
                dispatcher.perf_mut().add_error();
                return Err(error);
            }
            num_sent += 1;

            if frame.is_end_of_transfer() {
                return Ok(num_sent);
            }

            if frame.auto_transfer_id_base().is_some() {
                transfer_id = transfer_id.next();
            }

            frame.set_start_of_transfer(false);
            frame.flip_toggle();

            offset += frame.set_payload(&payload[offset..]);
            if offset >= payload.len() {
                frame.set_end_of_transfer(true);
            }
        }
    }

    fn payload_crc(&self, payload: &[u8]) -> u64 {
        match self.crc_kind {
            TransferCrcKind::Crc16 => {
                let mut crc: Crc16 = self.signature.to_crc16();
                crc.add_bytes(payload);
                crc.get().into()
            }
            TransferCrcKind::Crc32 => {
                let mut crc: Crc32 = self.signature.to_crc32();
                crc.add_bytes(payload);
                crc.get().into()
            }
            TransferCrcKind::Crc48 => {
                let mut crc: Crc48 = self.signature.to_crc48();
                crc.add_bytes(payload);
                crc.get()
            }
        }
    }
}
