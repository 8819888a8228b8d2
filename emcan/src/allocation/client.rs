//! Allocation client
//!
//! The requester side of the exchange: publishes the local unique ID in
//! stages of at most six bytes as anonymous broadcasts, follows the leader's
//! echoes, and adopts the node ID from the final assignment. Randomized
//! request periods and follow-up delays keep concurrent requesters from
//! colliding forever.

use heapless::Vec;

use crate::allocation::message::{AllocationMessage, MAX_FRAGMENT_LENGTH};
use crate::core::{NodeId, UniqueId};
use crate::time::{Duration, Instant};
use crate::util::XorShift32;

pub const MIN_REQUEST_PERIOD: Duration = Duration::from_millis(600);
pub const MAX_REQUEST_PERIOD: Duration = Duration::from_millis(1000);

/// Upper bound of the random delay before a follow-up stage.
const MAX_FOLLOWUP_DELAY: Duration = Duration::from_millis(400);

pub struct AllocationClient {
    unique_id: UniqueId,
    preferred_node_id: Option<NodeId>,
    allocated_node_id: Option<NodeId>,
    /// Unique-ID bytes the leader has confirmed so far.
    confirmed_offset: usize,
    deadline: Instant,
    prng: XorShift32,
}

impl AllocationClient {
    pub fn new(unique_id: UniqueId, preferred_node_id: Option<NodeId>, now: Instant) -> Self {
        let seed = unique_id
            .as_bytes()
            .iter()
            .fold(0u32, |acc, &byte| acc.wrapping_mul(31).wrapping_add(byte.into()));
        let mut client = Self {
            unique_id,
            preferred_node_id,
            allocated_node_id: None,
            confirmed_offset: 0,
            deadline: now,
            prng: XorShift32::new(seed),
        };
        client.defer_request(now);
        client
    }

    /// The assigned node ID once the exchange has completed.
    pub fn allocated_node_id(&self) -> Option<NodeId> {
        self.allocated_node_id
    }

    pub fn is_allocation_complete(&self) -> bool {
        self.allocated_node_id.is_some()
    }

    /// Processes one `Allocation` broadcast seen on the bus.
    pub fn handle_allocation_message(
        &mut self,
        now: Instant,
        source: Option<NodeId>,
        message: &AllocationMessage,
    ) {
        if self.allocated_node_id.is_some() {
            return;
        }

        // Anonymous traffic is a competing requester; back off and restart
        // so the exchanges do not interleave at the leader.
        let Some(_leader) = source else {
            self.confirmed_offset = 0;
            self.defer_request(now);
            return;
        };

        let ours = self.unique_id.as_bytes().starts_with(&message.unique_id);
        if !ours || message.unique_id.is_empty() {
            self.confirmed_offset = 0;
            self.defer_request(now);
            return;
        }

        if message.unique_id.len() == UniqueId::SIZE {
            if let Some(node_id) = message.node_id {
                info!("allocated node ID {}", node_id.into_u8());
                self.allocated_node_id = Some(node_id);
            }
            return;
        }

        // The leader echoed a prefix; follow up with the next stage soon.
        self.confirmed_offset = message.unique_id.len();
        let delay = self.prng.next_bounded(MAX_FOLLOWUP_DELAY.as_millis() as u32);
        self.deadline = now + Duration::from_millis(delay.into());
    }

    /// Produces the next request once its randomized deadline has passed.
    /// The caller publishes it as an anonymous broadcast.
    pub fn poll(&mut self, now: Instant) -> Option<AllocationMessage> {
        if self.allocated_node_id.is_some() || now < self.deadline {
            return None;
        }

        let offset = self.confirmed_offset;
        let end = (offset + MAX_FRAGMENT_LENGTH).min(UniqueId::SIZE);
        let message = AllocationMessage {
            node_id: self.preferred_node_id,
            first_part_of_unique_id: offset == 0,
            unique_id: unwrap!(Vec::from_slice(&self.unique_id.as_bytes()[offset..end])),
        };

        // If nothing comes back the exchange restarts from the first stage.
        self.confirmed_offset = 0;
        self.defer_request(now);
        Some(message)
    }

    fn defer_request(&mut self, now: Instant) {
        let span = (MAX_REQUEST_PERIOD - MIN_REQUEST_PERIOD).as_millis() as u32;
        let jitter = Duration::from_millis(self.prng.next_bounded(span).into());
        self.deadline = now + MIN_REQUEST_PERIOD + jitter;
    }
}
