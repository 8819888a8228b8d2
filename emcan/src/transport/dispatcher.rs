//! Frame dispatcher
//!
//! The dispatcher owns the CAN driver handle and serializes all send
//! operations. On the receive side it fans incoming frames out to handlers
//! registered against `(data type ID, transfer type)`; each subscription
//! owns its re-assembly buffer, so delivery never allocates.

use heapless::Vec;

use crate::bus::CanBus;
use crate::can::{CanIoFlags, CanRxFrame};
use crate::core::{DataTypeDescriptor, DataTypeId, NodeId, TransferId, TransferPriority,
    TransferType};
use crate::time::{Duration, Instant};
use crate::transport::frame::{Frame, RxFrame};
use crate::transport::receiver::TransferReceiver;
use crate::transport::registry::OutgoingTransferRegistry;
use crate::transport::{SendError, TransferCrcKind, TransferPerfCounter};

pub const MAX_SUBSCRIPTIONS: usize = 16;

/// Completed incoming transfer as delivered to a handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxTransfer<'a> {
    pub priority: TransferPriority,
    pub transfer_type: TransferType,
    pub data_type_id: DataTypeId,
    pub src: Option<NodeId>,
    pub transfer_id: TransferId,
    pub timestamp: Instant,
    pub payload: &'a [u8],
}

/// Receives completed transfers of one subscription
pub trait TransferHandler {
    fn on_transfer(&mut self, transfer: &RxTransfer<'_>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SubscribeError {
    NoSlotLeft,
    DataTypeOccupied,
}

struct Subscription<'h> {
    data_type_id: DataTypeId,
    transfer_type: TransferType,
    receiver: TransferReceiver,
    buffer: &'h mut [u8],
    handler: &'h mut dyn TransferHandler,
}

/// Owns the driver, the node identity, the outgoing-transfer registry, and
/// the subscription table
pub struct Dispatcher<'h, D: CanBus> {
    bus: D,
    node_id: Option<NodeId>,
    registry: OutgoingTransferRegistry,
    perf: TransferPerfCounter,
    subscriptions: Vec<Subscription<'h>, MAX_SUBSCRIPTIONS>,
}

impl<'h, D: CanBus> Dispatcher<'h, D> {
    /// Creates a dispatcher in passive (anonymous) mode.
    pub fn new(bus: D) -> Self {
        Self {
            bus,
            node_id: None,
            registry: OutgoingTransferRegistry::new(),
            perf: TransferPerfCounter::new(),
            subscriptions: Vec::new(),
        }
    }

    /// Assigns the local node ID, leaving passive mode. The ID can be set
    /// only once; returns false if one is already assigned.
    pub fn set_node_id(&mut self, node_id: NodeId) -> bool {
        if self.node_id.is_some() {
            return false;
        }
        info!("node ID assigned: {}", node_id.into_u8());
        self.node_id = Some(node_id);
        true
    }

    pub fn node_id(&self) -> Option<NodeId> {
        self.node_id
    }

    pub fn is_passive(&self) -> bool {
        self.node_id.is_none()
    }

    pub fn perf(&self) -> &TransferPerfCounter {
        &self.perf
    }

    pub(crate) fn perf_mut(&mut self) -> &mut TransferPerfCounter {
        &mut self.perf
    }

    pub(crate) fn registry_mut(&mut self) -> &mut OutgoingTransferRegistry {
        &mut self.registry
    }

    pub(crate) fn bus(&self) -> &D {
        &self.bus
    }

    /// Registers a handler for one `(data type, transfer type)` pair.
    /// `buffer` bounds the largest transfer the subscription can receive.
    pub fn subscribe(
        &mut self,
        descriptor: &DataTypeDescriptor,
        transfer_type: TransferType,
        crc_kind: TransferCrcKind,
        timeout: Duration,
        buffer: &'h mut [u8],
        handler: &'h mut dyn TransferHandler,
    ) -> Result<(), SubscribeError> {
        let occupied = self
            .subscriptions
            .iter()
            .any(|s| s.data_type_id == descriptor.id && s.transfer_type == transfer_type);
        if occupied {
            return Err(SubscribeError::DataTypeOccupied);
        }

        self.subscriptions
            .push(Subscription {
                data_type_id: descriptor.id,
                transfer_type,
                receiver: TransferReceiver::with_timeout(descriptor, crc_kind, timeout),
                buffer,
                handler,
            })
            .map_err(|_| SubscribeError::NoSlotLeft)
    }

    /// Feeds one received CAN frame through parsing, validation, destination
    /// filtering, re-assembly, and handler fan-out.
    pub fn handle_frame(&mut self, can_frame: &CanRxFrame) {
        let Some(rx) = RxFrame::parse(can_frame) else {
            self.perf.add_error();
            return;
        };
        if !rx.frame.is_valid() {
            warn!("protocol violation from {:?}", rx.frame.src().map(u8::from));
            self.perf.add_error();
            return;
        }

        // Service transfers addressed to someone else are not ours to touch.
        if let Some(dst) = rx.frame.dst() {
            if self.node_id != Some(dst) {
                return;
            }
        }

        let Some(subscription) = self.subscriptions.iter_mut().find(|s| {
            s.data_type_id == rx.frame.data_type_id() && s.transfer_type == rx.frame.transfer_type()
        }) else {
            return;
        };

        let Some(received) = subscription.receiver.push_frame(subscription.buffer, &rx) else {
            return;
        };
        self.perf.add_rx_transfer();

        subscription.handler.on_transfer(&RxTransfer {
            priority: received.priority,
            transfer_type: rx.frame.transfer_type(),
            data_type_id: rx.frame.data_type_id(),
            src: received.src,
            transfer_id: received.transfer_id,
            timestamp: received.timestamp,
            payload: &subscription.buffer[..received.length],
        });
    }

    /// Compiles and transmits one protocol frame.
    pub(crate) fn dispatch(
        &mut self,
        frame: &Frame,
        tx_deadline: Instant,
        blocking_deadline: Instant,
        flags: CanIoFlags,
    ) -> Result<(), SendError> {
        let can_frame = frame.compile().ok_or(SendError::Logic)?;
        self.bus
            .transmit(&can_frame, tx_deadline, blocking_deadline, flags)?;
        Ok(())
    }

    /// Garbage-collects expired outgoing-transfer registry entries. Meant to
    /// be called from a slow periodic timer.
    pub fn cleanup(&mut self, now: Instant) {
        self.registry.cleanup(now);
    }
}
