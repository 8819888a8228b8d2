//! Outgoing-transfer registry
//!
//! Keyed cache of the next transfer ID per `(data type, transfer kind,
//! destination)`. Entries expire on a deadline refreshed on every use, so
//! receivers observe contiguous transfer IDs within a session while stale
//! sessions do not pin registry slots forever. Expiration is opportunistic:
//! it is checked on every access and by an explicit [`cleanup`] walk; the
//! registry is small, so no background sweeper is required.
//!
//! [`cleanup`]: OutgoingTransferRegistry::cleanup

use heapless::LinearMap;

use crate::core::{DataTypeId, NodeId, TransferId, TransferType};
use crate::time::{Duration, Instant};
use crate::transport::SendError;

/// Lower bound on the lifetime of a registry entry past its last use.
pub const MIN_ENTRY_LIFETIME: Duration = Duration::from_secs(2);

const CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct OutgoingTransferRegistryKey {
    pub data_type_id: DataTypeId,
    pub transfer_type: TransferType,
    pub dst: Option<NodeId>,
}

#[derive(Debug, Clone, Copy)]
struct Value {
    transfer_id: TransferId,
    deadline: Instant,
}

#[derive(Debug, Default)]
pub struct OutgoingTransferRegistry {
    entries: LinearMap<OutgoingTransferRegistryKey, Value, CAPACITY>,
}

impl OutgoingTransferRegistry {
    pub fn new() -> Self {
        Self {
            entries: LinearMap::new(),
        }
    }

    /// Returns the transfer ID to use for the next transfer under `key` and
    /// advances the stored counter.
    ///
    /// An expired entry restarts at transfer ID 0. The entry deadline is
    /// pushed to `deadline`; a later access with an earlier deadline must not
    /// shorten the entry lifetime.
    pub fn access_or_create(
        &mut self,
        key: OutgoingTransferRegistryKey,
        deadline: Instant,
        now: Instant,
    ) -> Result<TransferId, SendError> {
        if let Some(value) = self.entries.get_mut(&key) {
            if now > value.deadline {
                value.transfer_id = TransferId::default();
            }
            value.deadline = value.deadline.max(deadline);
            let transfer_id = value.transfer_id;
            value.transfer_id = transfer_id.next();
            return Ok(transfer_id);
        }

        if self.entries.len() == self.entries.capacity() {
            self.cleanup(now);
        }

        let transfer_id = TransferId::default();
        self.entries
            .insert(
                key,
                Value {
                    transfer_id: transfer_id.next(),
                    deadline,
                },
            )
            .map_err(|_| SendError::Memory)?;
        Ok(transfer_id)
    }

    /// Drops every expired entry.
    pub fn cleanup(&mut self, now: Instant) {
        while let Some(key) = self
            .entries
            .iter()
            .find(|(_, value)| now > value.deadline)
            .map(|(key, _)| *key)
        {
            self.entries.remove(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
