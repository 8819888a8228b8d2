//! emcan driver interface
//!
//! The crate provides the interface between a CAN device driver and the emcan
//! stack. Limited scope facilitates compatibility across versions. Driver
//! crates should depend on this crate. Stack users should depend on the
//! `emcan` crate instead.
//!
//! The stack is driven from the outside: the host event loop feeds received
//! frames into the dispatcher and forwards timer events, while the dispatcher
//! pushes outgoing frames into the [`bus::CanBus`] implementation. All send
//! operations go through a single dispatcher instance, so a driver never has
//! to serialize concurrent senders itself.
//!
//! Only Classic CAN framing (8-byte payloads) is supported; extended 29-bit
//! identifiers are mandatory for protocol frames.

#![no_std]

pub mod bus;
pub mod frame;

pub mod time {
    pub use embassy_time::{Duration, Instant};
}
