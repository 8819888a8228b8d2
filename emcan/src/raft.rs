//! Raft consensus over CAN
//!
//! A replicated log mapping 128-bit unique IDs to allocated node IDs,
//! maintained by a small cluster of servers exchanging `AppendEntries` and
//! `RequestVote` service calls and `Discovery` broadcasts on the bus.
//! Durable state lives in the key-value [storage](crate::storage) backend;
//! every write is verified and every transition is idempotent, so storage
//! failures are never fatal.

pub mod cluster;
pub mod core;
pub mod log;
pub mod message;
pub mod state;

pub use cluster::ClusterManager;
pub use self::core::{RaftCore, RaftRpc, Role};
pub use self::log::Log;
pub use message::{
    AppendEntriesRequest, AppendEntriesResponse, Discovery, Entry, RequestVoteRequest,
    RequestVoteResponse, Term,
};
pub use state::PersistentState;
