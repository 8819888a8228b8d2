//! Transport layer
//!
//! Segments application payloads into 8-byte CAN frames and re-assembles them
//! on reception, with CRC integrity checking, transfer-ID ordering, and
//! duplicate suppression.

pub mod dispatcher;
pub mod frame;
pub mod receiver;
pub mod registry;
pub mod sender;

pub use dispatcher::{Dispatcher, RxTransfer, TransferHandler};
pub use frame::{Frame, RxFrame};
pub use receiver::TransferReceiver;
pub use registry::OutgoingTransferRegistry;
pub use sender::TransferSender;

/// Transfer submission failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SendError {
    /// The node has no ID assigned yet; only anonymous single-frame message
    /// broadcasts are allowed. The caller must wait for allocation.
    PassiveMode,
    /// The outgoing-transfer registry is out of slots. Fatal for the
    /// in-flight transfer but not for the system.
    Memory,
    /// Internal invariant violation.
    Logic,
    /// The CAN driver rejected the frame; the transfer is abandoned.
    Driver,
}

impl From<crate::bus::BusError> for SendError {
    fn from(_: crate::bus::BusError) -> Self {
        SendError::Driver
    }
}

/// Transfer CRC variant, selected per data type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferCrcKind {
    Crc16,
    Crc32,
    Crc48,
}

impl TransferCrcKind {
    /// Number of CRC bytes prefixed to the first frame of a multi-frame
    /// transfer.
    pub const fn prefix_length(self) -> usize {
        match self {
            TransferCrcKind::Crc16 => 2,
            TransferCrcKind::Crc32 => 4,
            TransferCrcKind::Crc48 => 6,
        }
    }
}

/// Transfer activity and error tallies of one dispatcher
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransferPerfCounter {
    tx_transfers: u32,
    rx_transfers: u32,
    errors: u32,
}

impl TransferPerfCounter {
    pub const fn new() -> Self {
        Self {
            tx_transfers: 0,
            rx_transfers: 0,
            errors: 0,
        }
    }

    pub fn add_tx_transfer(&mut self) {
        self.tx_transfers = self.tx_transfers.wrapping_add(1);
    }

    pub fn add_rx_transfer(&mut self) {
        self.rx_transfers = self.rx_transfers.wrapping_add(1);
    }

    pub fn add_error(&mut self) {
        self.errors = self.errors.wrapping_add(1);
    }

    pub fn tx_transfers(&self) -> u32 {
        self.tx_transfers
    }

    pub fn rx_transfers(&self) -> u32 {
        self.rx_transfers
    }

    pub fn errors(&self) -> u32 {
        self.errors
    }
}
