//! Raft state machine: log replication and voting
//!
//! Event-driven and I/O-free at the RPC boundary: request handlers return
//! the response value to send back, while [`RaftCore::update`] drives the
//! election, heartbeat, and discovery timers and emits outbound RPCs through
//! the [`RaftRpc`] glue trait. Client interaction is not handled here; the
//! allocation server feeds committed entries in through
//! [`RaftCore::append_log`].
//!
//! Persistent-state writes can fail (read-back mismatch); every transition
//! is idempotent, so a failed write only delays the transition until the
//! next heartbeat or election attempt.

use heapless::Vec;

use crate::core::{NodeId, UniqueId};
use crate::raft::cluster::{ClusterError, ClusterManager, PendingAppend};
use crate::raft::log::{Log, LogIndex};
use crate::raft::message::{
    AppendEntriesRequest, AppendEntriesResponse, Discovery, Entry, RequestVoteRequest,
    RequestVoteResponse, Term, MAX_SERVERS,
};
use crate::raft::state::PersistentState;
use crate::storage::{StorageBackend, StorageError};
use crate::time::{Duration, Instant};
use crate::util::XorShift32;

pub const MIN_ELECTION_TIMEOUT: Duration = Duration::from_millis(2000);
pub const MAX_ELECTION_TIMEOUT: Duration = Duration::from_millis(4000);

/// Leader heartbeat cadence, a fraction of the election timeout.
pub const HEARTBEAT_PERIOD: Duration = Duration::from_millis(500);

const DISCOVERY_PERIOD: Duration = Duration::from_millis(1000);

/// With no peer traffic for this long the server concludes it is the only
/// reachable one and enters active mode; peers reappearing later do not
/// deactivate it.
pub const ACTIVITY_TIMEOUT: Duration = Duration::from_millis(6000);

/// Server role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Outbound RPC glue implemented by the hosting node
pub trait RaftRpc {
    fn send_append_entries(&mut self, destination: NodeId, request: &AppendEntriesRequest);
    fn send_request_vote(&mut self, destination: NodeId, request: &RequestVoteRequest);
    fn publish_discovery(&mut self, message: &Discovery);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InitError {
    Storage(StorageError),
    Cluster(ClusterError),
}

pub struct RaftCore<S: StorageBackend> {
    local_node_id: NodeId,
    persistent: PersistentState<S>,
    commit_index: LogIndex,
    cluster: ClusterManager,
    role: Role,
    /// Peers that granted their vote in the current candidacy.
    votes_granted: Vec<NodeId, { MAX_SERVERS - 1 }>,
    active_mode: bool,
    last_activity: Instant,
    election_deadline: Instant,
    heartbeat_deadline: Instant,
    discovery_deadline: Instant,
    prng: XorShift32,
}

impl<S: StorageBackend> RaftCore<S> {
    pub fn new(local_node_id: NodeId, backend: S, now: Instant) -> Self {
        let mut prng = XorShift32::new(local_node_id.into_u8().into());
        let election_deadline =
            now + MIN_ELECTION_TIMEOUT + Duration::from_millis(prng.next_bounded(2000).into());
        Self {
            local_node_id,
            persistent: PersistentState::new(backend),
            // Per the Raft paper, commitIndex starts at zero.
            commit_index: 0,
            cluster: ClusterManager::new(),
            role: Role::Follower,
            votes_granted: Vec::new(),
            active_mode: true,
            last_activity: now,
            election_deadline,
            heartbeat_deadline: now,
            discovery_deadline: now,
            prng,
        }
    }

    /// Recovers persistent state and configures the cluster. Pass
    /// [`CLUSTER_SIZE_UNKNOWN`](crate::raft::cluster::CLUSTER_SIZE_UNKNOWN)
    /// to read the cluster size from storage.
    pub fn init(&mut self, cluster_size: u8) -> Result<(), InitError> {
        self.persistent.init().map_err(InitError::Storage)?;
        self.cluster
            .init(cluster_size, self.persistent.storage_mut())
            .map_err(InitError::Cluster)?;
        Ok(())
    }

    pub fn local_node_id(&self) -> NodeId {
        self.local_node_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn current_term(&self) -> Term {
        self.persistent.current_term()
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn log(&self) -> &Log {
        self.persistent.log()
    }

    pub fn cluster(&self) -> &ClusterManager {
        &self.cluster
    }

    pub fn is_active_mode(&self) -> bool {
        self.active_mode
    }

    /// Appends one allocation record under the current term. Leaders only;
    /// a storage failure is tolerated because the requester will retry and
    /// the operation is idempotent.
    pub fn append_log(&mut self, unique_id: UniqueId, node_id: NodeId) {
        if self.role != Role::Leader {
            return;
        }
        let entry = Entry {
            term: self.persistent.current_term(),
            unique_id,
            node_id,
        };
        if self.persistent.append_log(entry).is_err() {
            warn!("log append failed, waiting for retry");
        }
    }

    pub fn handle_append_entries_request(
        &mut self,
        now: Instant,
        from: NodeId,
        request: &AppendEntriesRequest,
    ) -> AppendEntriesResponse {
        self.mark_activity(now);
        self.cluster.add_server(from);

        if request.term > self.current_term() {
            if self.try_adopt_term(request.term).is_err() {
                return self.append_entries_failure();
            }
            self.switch_to_follower(now);
        }
        if request.term < self.current_term() {
            return self.append_entries_failure();
        }

        // Equal terms past this point: `from` is the legitimate leader.
        if self.role != Role::Follower {
            self.switch_to_follower(now);
        }
        self.restart_election_timer(now);

        // Consistency check on the entry preceding the new ones.
        match self.persistent.log().term_at(request.prev_log_index) {
            Some(term) if term == request.prev_log_term => {}
            _ => return self.append_entries_failure(),
        }

        // Append, dropping existing entries only where they actually
        // conflict; a replayed request must not regress the log.
        let mut index = request.prev_log_index;
        for entry in &request.entries {
            index += 1;
            match self.persistent.log().term_at(index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    if self.persistent.truncate_log_from(index).is_err() {
                        return self.append_entries_failure();
                    }
                }
                None => {}
            }
            if self.persistent.append_log(*entry).is_err() {
                return self.append_entries_failure();
            }
        }

        if request.leader_commit > self.commit_index {
            self.commit_index = request
                .leader_commit
                .min(self.persistent.log().last_index());
        }

        AppendEntriesResponse {
            term: self.current_term(),
            success: true,
        }
    }

    pub fn handle_append_entries_response(
        &mut self,
        now: Instant,
        from: NodeId,
        response: &AppendEntriesResponse,
    ) {
        self.mark_activity(now);

        if response.term > self.current_term() {
            let _ = self.try_adopt_term(response.term);
            self.switch_to_follower(now);
            return;
        }
        if self.role != Role::Leader {
            return;
        }
        let Some(pending) = self.cluster.take_pending_append(from) else {
            return;
        };

        if response.success {
            self.cluster
                .set_progress(from, pending.prev_log_index + pending.num_entries);
            self.recompute_commit_index();
        } else {
            self.cluster.decrement_next_index(from);
        }
    }

    pub fn handle_request_vote_request(
        &mut self,
        now: Instant,
        from: NodeId,
        request: &RequestVoteRequest,
    ) -> RequestVoteResponse {
        self.mark_activity(now);
        self.cluster.add_server(from);

        if request.term > self.current_term() {
            if self.try_adopt_term(request.term).is_err() {
                return self.vote_failure();
            }
            self.switch_to_follower(now);
        }
        if request.term < self.current_term() {
            return self.vote_failure();
        }

        let can_vote = match self.persistent.voted_for() {
            None => true,
            Some(candidate) => candidate == from,
        };
        let up_to_date = self
            .persistent
            .log()
            .is_other_log_up_to_date(request.last_log_index, request.last_log_term);
        if !(can_vote && up_to_date) {
            return self.vote_failure();
        }

        if self.persistent.voted_for() != Some(from)
            && self.persistent.set_voted_for(Some(from)).is_err()
        {
            return self.vote_failure();
        }

        // Granting a vote resets the election timeout.
        self.restart_election_timer(now);
        trace!("vote granted to {}", from.into_u8());
        RequestVoteResponse {
            term: self.current_term(),
            vote_granted: true,
        }
    }

    pub fn handle_request_vote_response(
        &mut self,
        now: Instant,
        from: NodeId,
        response: &RequestVoteResponse,
    ) {
        self.mark_activity(now);

        if response.term > self.current_term() {
            let _ = self.try_adopt_term(response.term);
            self.switch_to_follower(now);
            return;
        }
        if self.role != Role::Candidate
            || response.term != self.current_term()
            || !response.vote_granted
            || !self.cluster.is_known_server(from)
            || self.votes_granted.contains(&from)
        {
            return;
        }

        let _ = self.votes_granted.push(from);
        // Own vote counts towards the quorum.
        if self.votes_granted.len() as u8 + 1 >= self.cluster.quorum_size() {
            self.switch_to_leader(now);
        }
    }

    pub fn handle_discovery(&mut self, now: Instant, from: NodeId, message: &Discovery) {
        self.mark_activity(now);
        if message.configured_cluster_size != self.cluster.configured_cluster_size() {
            warn!(
                "cluster size mismatch: local {} remote {}",
                self.cluster.configured_cluster_size(),
                message.configured_cluster_size
            );
        }
        self.cluster.add_server(from);
        self.cluster.handle_discovery(self.local_node_id, message);
    }

    /// Drives the timers. Call periodically with the current instant; the
    /// call rate bounds timer resolution but nothing else.
    pub fn update(&mut self, now: Instant, rpc: &mut dyn RaftRpc) {
        if !self.active_mode && now >= self.last_activity + ACTIVITY_TIMEOUT {
            debug!("no reachable peers, entering active mode");
            self.active_mode = true;
        }

        if !self.cluster.is_cluster_discovered() && now >= self.discovery_deadline {
            rpc.publish_discovery(&self.cluster.make_discovery(self.local_node_id));
            self.discovery_deadline = now + DISCOVERY_PERIOD;
        }

        match self.role {
            Role::Follower | Role::Candidate => {
                if now >= self.election_deadline {
                    if self.active_mode {
                        self.start_election(now, rpc);
                    } else {
                        self.restart_election_timer(now);
                    }
                }
            }
            Role::Leader => {
                if now >= self.heartbeat_deadline {
                    self.send_heartbeats(rpc);
                    self.heartbeat_deadline = now + HEARTBEAT_PERIOD;
                }
                // Covers the single-server cluster, which gets no responses.
                self.recompute_commit_index();
            }
        }
    }

    /// Overrides the activity-based switch; a passive server observes the
    /// bus but never starts elections.
    pub fn set_active_mode(&mut self, active: bool, now: Instant) {
        self.active_mode = active;
        if !active {
            self.last_activity = now;
        }
    }

    fn mark_activity(&mut self, now: Instant) {
        self.last_activity = now;
    }

    fn append_entries_failure(&self) -> AppendEntriesResponse {
        AppendEntriesResponse {
            term: self.current_term(),
            success: false,
        }
    }

    fn vote_failure(&self) -> RequestVoteResponse {
        RequestVoteResponse {
            term: self.current_term(),
            vote_granted: false,
        }
    }

    /// Adopts a higher term observed on the bus: `current_term` follows it
    /// and the vote is cleared.
    fn try_adopt_term(&mut self, term: Term) -> Result<(), StorageError> {
        self.persistent.set_current_term(term)?;
        self.persistent.set_voted_for(None)
    }

    fn restart_election_timer(&mut self, now: Instant) {
        let span = (MAX_ELECTION_TIMEOUT - MIN_ELECTION_TIMEOUT).as_millis() as u32;
        let jitter = Duration::from_millis(self.prng.next_bounded(span).into());
        self.election_deadline = now + MIN_ELECTION_TIMEOUT + jitter;
    }

    fn switch_to_follower(&mut self, now: Instant) {
        if self.role != Role::Follower {
            debug!("stepping down at term {}", self.current_term());
        }
        self.role = Role::Follower;
        self.votes_granted.clear();
        self.restart_election_timer(now);
    }

    fn start_election(&mut self, now: Instant, rpc: &mut dyn RaftRpc) {
        let term = self.current_term() + 1;
        if self.persistent.set_current_term(term).is_err()
            || self.persistent.set_voted_for(Some(self.local_node_id)).is_err()
        {
            warn!("storage failure, election deferred");
            self.restart_election_timer(now);
            return;
        }

        debug!("election started at term {}", term);
        self.role = Role::Candidate;
        self.votes_granted.clear();
        self.restart_election_timer(now);

        let request = RequestVoteRequest {
            term,
            last_log_index: self.persistent.log().last_index(),
            last_log_term: self.persistent.log().last_term(),
        };
        for peer in self.cluster.servers() {
            rpc.send_request_vote(peer, &request);
        }

        // A single-server cluster elects itself on the spot.
        if self.cluster.quorum_size() == 1 {
            self.switch_to_leader(now);
        }
    }

    fn switch_to_leader(&mut self, now: Instant) {
        info!("leader at term {}", self.current_term());
        self.role = Role::Leader;
        self.cluster
            .reset_all_server_indices(self.persistent.log().last_index());
        // The initial empty AppendEntries goes out on the next update call.
        self.heartbeat_deadline = now;
    }

    fn send_heartbeats(&mut self, rpc: &mut dyn RaftRpc) {
        let peers: Vec<NodeId, { MAX_SERVERS - 1 }> = self.cluster.servers().collect();
        for peer in peers {
            let next_index = unwrap!(self.cluster.next_index(peer)).max(1);
            let prev_log_index = next_index - 1;
            let Some(prev_log_term) = self.persistent.log().term_at(prev_log_index) else {
                continue;
            };

            let mut entries = Vec::new();
            if self.persistent.log().last_index() >= next_index {
                let _ = entries.push(*unwrap!(self.persistent.log().entry_at(next_index)));
            }
            let num_entries = entries.len() as u8;

            let request = AppendEntriesRequest {
                term: self.current_term(),
                prev_log_index,
                prev_log_term,
                leader_commit: self.commit_index,
                entries,
            };
            self.cluster.set_pending_append(
                peer,
                PendingAppend {
                    prev_log_index,
                    num_entries,
                },
            );
            rpc.send_append_entries(peer, &request);
        }
    }

    /// Advances `commit_index` to the greatest index replicated on a quorum
    /// whose entry carries the current term.
    fn recompute_commit_index(&mut self) {
        let quorum = self.cluster.quorum_size();
        let current_term = self.current_term();
        for index in (self.commit_index + 1)..=self.persistent.log().last_index() {
            if self.persistent.log().term_at(index) != Some(current_term) {
                continue;
            }
            let replicas =
                1 + self.cluster.match_indices().filter(|&m| m >= index).count() as u8;
            if replicas >= quorum {
                self.commit_index = index;
            }
        }
    }
}
