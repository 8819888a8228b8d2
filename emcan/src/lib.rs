//! # emcan
//!
//! A distributed-node protocol stack for real-time control networks layered
//! over Classic CAN. The stack multiplexes variable-length transfers onto
//! fixed 8-byte CAN frames and provides:
//!
//! * publish/subscribe messaging and request/response services among nodes
//!   identified by small integer IDs, with integrity checking, transfer
//!   re-assembly, and duplicate suppression;
//! * a dynamic node-ID allocation server: a replicated state machine based on
//!   the Raft consensus algorithm, carried as application-level messages on
//!   the same bus, that deterministically assigns node IDs to newly joining
//!   nodes from their 128-bit unique identifiers.
//!
//! ## Architecture
//!
//! ```text
//!  ┌────────────┐   ┌──────────────────┐   ┌───────────────────┐
//!  │ CAN driver ├──►│    Dispatcher    │◄──┤  TransferSender   │
//!  └────────────┘   │  (frame fan-out, │   └───────────────────┘
//!                   │   TID registry,  │   ┌───────────────────┐
//!                   │   perf counters) ├──►│ TransferHandler(s)│
//!                   └──────────────────┘   └───────────────────┘
//!
//!  ┌───────────────────┐   ┌──────────┐   ┌──────────────────┐
//!  │ AllocationServer  ├──►│ RaftCore ├──►│ StorageBackend   │
//!  │ AllocationClient  │   │          │   │ (key/value pairs)│
//!  └───────────────────┘   └──────────┘   └──────────────────┘
//! ```
//!
//! The stack runs in a single-threaded cooperative event loop: the host feeds
//! received frames and timer ticks in, passing the current monotonic instant
//! explicitly. No component reads a clock or blocks beyond the documented
//! storage-I/O bound, and no heap allocation is performed anywhere.
//!
//! The CAN driver, the clock source, generated data type definitions, node
//! lifecycle glue, and the persistent storage medium are external
//! collaborators behind the traits in [`bus`] and [`storage`].
#![no_std]

pub use emcan_core as core;
pub use emcan_driver::{bus, frame as can, time};

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

pub mod allocation;
pub mod raft;
pub mod storage;
pub mod transport;
pub(crate) mod util;
