//! Allocation server
//!
//! Applies Raft to node-ID assignment. Only the current leader takes part
//! in the exchange; follower servers stay silent so the requester discovers
//! the leader from the echo. The leader assembles staged unique-ID
//! fragments, answers re-requests from the log, probes candidate IDs for
//! live squatters before committing, and announces an assignment once its
//! log entry is committed.

use heapless::Vec;

use crate::allocation::message::AllocationMessage;
use crate::core::{NodeId, UniqueId};
use crate::raft::core::{InitError, RaftCore, RaftRpc};
use crate::raft::log::LogIndex;
use crate::storage::StorageBackend;
use crate::time::{Duration, Instant};

/// Unanswered liveness probes per candidate before the ID counts as free.
pub const PENDING_GET_NODE_INFO_ATTEMPTS: u8 = 3;

/// How long one liveness probe waits for an answer.
const NODE_INFO_RESPONSE_TIMEOUT: Duration = Duration::from_millis(1000);

/// A request assembly abandoned when the next stage does not arrive in time.
const REQUEST_ASSEMBLY_TIMEOUT: Duration = Duration::from_millis(1000);

/// Bus-facing actions of the allocation server, implemented by node glue
pub trait AllocationIo {
    fn publish_allocation(&mut self, message: &AllocationMessage);

    /// Issues a `GetNodeInfo`-style liveness probe of `node_id`. A reply is
    /// reported through [`AllocationServer::handle_node_info_response`]; the
    /// absence of one lets the probe time out.
    fn request_node_info(&mut self, node_id: NodeId);
}

/// Short-lived buffer accumulating one requester's unique-ID stages
struct RequestAssembly {
    bytes: Vec<u8, { UniqueId::SIZE }>,
    requested_node_id: Option<NodeId>,
    deadline: Instant,
}

#[derive(Debug, Clone, Copy)]
struct PendingVerification {
    unique_id: UniqueId,
    candidate: NodeId,
    attempts: u8,
    deadline: Instant,
}

#[derive(Debug, Clone, Copy)]
struct PendingCommit {
    unique_id: UniqueId,
    node_id: NodeId,
    index: LogIndex,
}

pub struct AllocationServer<S: StorageBackend> {
    raft: RaftCore<S>,
    assembly: Option<RequestAssembly>,
    verification: Option<PendingVerification>,
    pending_commit: Option<PendingCommit>,
}

impl<S: StorageBackend> AllocationServer<S> {
    pub fn new(local_node_id: NodeId, backend: S, now: Instant) -> Self {
        Self {
            raft: RaftCore::new(local_node_id, backend, now),
            assembly: None,
            verification: None,
            pending_commit: None,
        }
    }

    pub fn init(&mut self, cluster_size: u8) -> Result<(), InitError> {
        self.raft.init(cluster_size)
    }

    /// The embedded consensus core; incoming Raft RPCs are fed to it
    /// directly.
    pub fn raft(&self) -> &RaftCore<S> {
        &self.raft
    }

    pub fn raft_mut(&mut self) -> &mut RaftCore<S> {
        &mut self.raft
    }

    /// Processes one `Allocation` broadcast seen on the bus. Requests are
    /// anonymous; anything with a source node ID is another server's
    /// traffic and is ignored.
    pub fn handle_allocation_message(
        &mut self,
        now: Instant,
        source: Option<NodeId>,
        message: &AllocationMessage,
        io: &mut dyn AllocationIo,
    ) {
        if source.is_some() || !self.raft.is_leader() {
            return;
        }

        if let Some(assembly) = &self.assembly {
            if now > assembly.deadline {
                self.assembly = None;
            }
        }

        if message.first_part_of_unique_id {
            let mut bytes = Vec::new();
            let fragment = truncate_fragment(&message.unique_id);
            unwrap!(bytes.extend_from_slice(fragment));
            self.assembly = Some(RequestAssembly {
                bytes,
                requested_node_id: message.node_id,
                deadline: now + REQUEST_ASSEMBLY_TIMEOUT,
            });
        } else {
            let Some(assembly) = self.assembly.as_mut() else {
                // A follow-up without a first stage has nothing to extend.
                return;
            };
            let fragment = truncate_fragment(&message.unique_id);
            let room = UniqueId::SIZE - assembly.bytes.len();
            let take = fragment.len().min(room);
            unwrap!(assembly.bytes.extend_from_slice(&fragment[..take]));
            assembly.deadline = now + REQUEST_ASSEMBLY_TIMEOUT;
        }

        let assembly = unwrap!(self.assembly.as_ref());
        if assembly.bytes.len() < UniqueId::SIZE {
            // Echo the progress; the requester learns the leader from the
            // source address and follows up with the next stage.
            let echo = AllocationMessage {
                node_id: None,
                first_part_of_unique_id: false,
                unique_id: assembly.bytes.clone(),
            };
            io.publish_allocation(&echo);
            return;
        }

        let mut unique_id_bytes = [0u8; UniqueId::SIZE];
        unique_id_bytes.copy_from_slice(&assembly.bytes);
        let unique_id = UniqueId::new(unique_id_bytes);
        let requested = assembly.requested_node_id;
        self.assembly = None;

        self.start_allocation(now, unique_id, requested, io);
    }

    /// Reports a liveness-probe answer: the candidate node ID is occupied,
    /// so the server moves on to the next free one.
    pub fn handle_node_info_response(
        &mut self,
        now: Instant,
        node_id: NodeId,
        io: &mut dyn AllocationIo,
    ) {
        let Some(verification) = self.verification.take() else {
            return;
        };
        if verification.candidate != node_id {
            self.verification = Some(verification);
            return;
        }

        debug!("candidate {} is alive, re-allocating", node_id.into_u8());
        match self.next_candidate_below(node_id) {
            Some(candidate) => {
                self.verification = Some(PendingVerification {
                    unique_id: verification.unique_id,
                    candidate,
                    attempts: 1,
                    deadline: now + NODE_INFO_RESPONSE_TIMEOUT,
                });
                io.request_node_info(candidate);
            }
            None => warn!("node ID space exhausted"),
        }
    }

    /// Drives the consensus core and the allocation timers.
    pub fn update(&mut self, now: Instant, rpc: &mut dyn RaftRpc, io: &mut dyn AllocationIo) {
        self.raft.update(now, rpc);

        if !self.raft.is_leader() {
            // Allocation work in flight does not survive a leadership loss;
            // the requester will retry against the new leader.
            self.assembly = None;
            self.verification = None;
            self.pending_commit = None;
            return;
        }

        if let Some(mut verification) = self.verification.take() {
            if now < verification.deadline {
                self.verification = Some(verification);
            } else if verification.attempts < PENDING_GET_NODE_INFO_ATTEMPTS {
                verification.attempts += 1;
                verification.deadline = now + NODE_INFO_RESPONSE_TIMEOUT;
                io.request_node_info(verification.candidate);
                self.verification = Some(verification);
            } else {
                // Every probe went unanswered: the ID is free to take.
                self.commit_allocation(verification.unique_id, verification.candidate);
            }
        }

        if let Some(pending) = self.pending_commit {
            if self.raft.commit_index() >= pending.index {
                self.pending_commit = None;
                io.publish_allocation(&assignment_message(pending.unique_id, pending.node_id));
            }
        }
    }

    fn start_allocation(
        &mut self,
        now: Instant,
        unique_id: UniqueId,
        requested: Option<NodeId>,
        io: &mut dyn AllocationIo,
    ) {
        // The most recent log record for this unique ID wins; a re-request
        // returns the original assignment without growing the log.
        if let Some(entry) = self.raft.log().find_last(|entry| entry.unique_id == unique_id) {
            io.publish_allocation(&assignment_message(unique_id, entry.node_id));
            return;
        }

        if self.verification.is_some() || self.pending_commit.is_some() {
            // One allocation at a time; the requester retries.
            return;
        }

        let Some(candidate) = self.pick_candidate(requested) else {
            warn!("node ID space exhausted");
            return;
        };
        self.verification = Some(PendingVerification {
            unique_id,
            candidate,
            attempts: 1,
            deadline: now + NODE_INFO_RESPONSE_TIMEOUT,
        });
        io.request_node_info(candidate);
    }

    fn commit_allocation(&mut self, unique_id: UniqueId, node_id: NodeId) {
        self.raft.append_log(unique_id, node_id);
        let index = self.raft.log().last_index();
        let appended = self
            .raft
            .log()
            .entry_at(index)
            .is_some_and(|entry| entry.unique_id == unique_id && entry.node_id == node_id);
        if appended {
            self.pending_commit = Some(PendingCommit {
                unique_id,
                node_id,
                index,
            });
        }
        // On append failure the requester simply retries; the operation is
        // idempotent.
    }

    fn is_node_id_taken(&self, node_id: NodeId) -> bool {
        self.raft
            .log()
            .find_last(|entry| entry.node_id == node_id)
            .is_some()
    }

    /// Picks the candidate node ID: the requested one when free, otherwise
    /// walking down from it (or from the top of the regular range), then up.
    fn pick_candidate(&self, requested: Option<NodeId>) -> Option<NodeId> {
        let start = requested.unwrap_or(NodeId::MAX_RECOMMENDED_FOR_REGULAR_NODES);
        for code in (1..=start.into_u8()).rev() {
            let candidate = unwrap!(NodeId::new(code));
            if !self.is_node_id_taken(candidate) {
                return Some(candidate);
            }
        }
        for code in start.into_u8() + 1..=NodeId::MAX_RECOMMENDED_FOR_REGULAR_NODES.into_u8() {
            let candidate = unwrap!(NodeId::new(code));
            if !self.is_node_id_taken(candidate) {
                return Some(candidate);
            }
        }
        None
    }

    fn next_candidate_below(&self, occupied: NodeId) -> Option<NodeId> {
        for code in (1..occupied.into_u8()).rev() {
            let candidate = unwrap!(NodeId::new(code));
            if !self.is_node_id_taken(candidate) {
                return Some(candidate);
            }
        }
        for code in occupied.into_u8() + 1..=NodeId::MAX_RECOMMENDED_FOR_REGULAR_NODES.into_u8() {
            let candidate = unwrap!(NodeId::new(code));
            if !self.is_node_id_taken(candidate) && candidate != occupied {
                return Some(candidate);
            }
        }
        None
    }
}

fn truncate_fragment(fragment: &[u8]) -> &[u8] {
    &fragment[..fragment.len().min(UniqueId::SIZE)]
}

fn assignment_message(unique_id: UniqueId, node_id: NodeId) -> AllocationMessage {
    AllocationMessage {
        node_id: Some(node_id),
        first_part_of_unique_id: false,
        unique_id: unwrap!(Vec::from_slice(unique_id.as_bytes())),
    }
}
