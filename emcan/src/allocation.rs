//! Dynamic node-ID allocation
//!
//! Newly joining nodes hold no node ID and therefore can only emit anonymous
//! single-frame broadcasts. They stage their 128-bit unique ID across
//! several `Allocation` broadcasts of at most six bytes each; the current
//! Raft leader assembles the stages, echoes its progress (which also tells
//! the requester who the leader is), commits a `{unique ID → node ID}`
//! record through consensus, and finally broadcasts the assignment.

pub mod client;
pub mod message;
pub mod server;

pub use client::AllocationClient;
pub use message::AllocationMessage;
pub use server::{AllocationIo, AllocationServer};
