//! Bus interface implemented by CAN peripheral drivers

use crate::frame::{CanFrame, CanIoFlags};
use crate::time::Instant;

/// Opaque driver failure
///
/// The stack abandons the affected transfer and increments an error counter;
/// details stay on the driver side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BusError;

/// Transmit interface of a CAN peripheral
///
/// A frame whose `tx_deadline` passes before it reaches the bus must be
/// dropped by the driver. `transmit` may block up to `blocking_deadline`
/// waiting for transmit-queue capacity, and must return `Err` once the
/// blocking deadline expires with the queue still full.
///
/// The dispatcher owns all send operations, so implementations do not need
/// to be reentrant.
pub trait CanBus {
    fn transmit(
        &mut self,
        frame: &CanFrame,
        tx_deadline: Instant,
        blocking_deadline: Instant,
        flags: CanIoFlags,
    ) -> Result<(), BusError>;
}
