//! Raft persistent state
//!
//! The triple `{current_term, voted_for, log}` with write-through storage
//! replication. Reads are instantaneous; setters update memory only after
//! the storage write has verified. Unreadable state recovers as the initial
//! state.

use crate::core::NodeId;
use crate::raft::log::{Log, LogIndex};
use crate::raft::message::{Entry, Term};
use crate::storage::{MarshallingStorage, StorageBackend, StorageError};

const KEY_CURRENT_TERM: &str = "current_term";
const KEY_VOTED_FOR: &str = "voted_for";

/// Wire code 0 marks the absent vote.
const VOTED_FOR_NONE: u32 = 0;

pub struct PersistentState<S: StorageBackend> {
    storage: MarshallingStorage<S>,
    current_term: Term,
    voted_for: Option<NodeId>,
    log: Log,
}

impl<S: StorageBackend> PersistentState<S> {
    pub fn new(backend: S) -> Self {
        Self {
            storage: MarshallingStorage::new(backend),
            current_term: 0,
            voted_for: None,
            log: Log::new(),
        }
    }

    /// Recovers all three fields from storage.
    pub fn init(&mut self) -> Result<(), StorageError> {
        match self.storage.get_u32(KEY_CURRENT_TERM) {
            Some(term) => self.current_term = term,
            None => {
                self.storage.set_and_get_back_u32(KEY_CURRENT_TERM, 0)?;
                self.current_term = 0;
            }
        }

        match self.storage.get_u32(KEY_VOTED_FOR) {
            Some(code) if code <= u8::MAX.into() => {
                self.voted_for = NodeId::new(code as u8);
            }
            _ => {
                self.storage
                    .set_and_get_back_u32(KEY_VOTED_FOR, VOTED_FOR_NONE)?;
                self.voted_for = None;
            }
        }

        self.log.init(&mut self.storage)
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.voted_for
    }

    pub fn set_current_term(&mut self, term: Term) -> Result<(), StorageError> {
        self.storage.set_and_get_back_u32(KEY_CURRENT_TERM, term)?;
        self.current_term = term;
        Ok(())
    }

    pub fn set_voted_for(&mut self, candidate: Option<NodeId>) -> Result<(), StorageError> {
        let code = candidate.map_or(VOTED_FOR_NONE, |node| node.into_u8().into());
        self.storage.set_and_get_back_u32(KEY_VOTED_FOR, code)?;
        self.voted_for = candidate;
        Ok(())
    }

    pub fn log(&self) -> &Log {
        &self.log
    }

    pub fn append_log(&mut self, entry: Entry) -> Result<(), StorageError> {
        self.log.append(&mut self.storage, entry)
    }

    pub fn truncate_log_from(&mut self, index: LogIndex) -> Result<(), StorageError> {
        self.log
            .remove_entries_where_index_greater_or_equal(&mut self.storage, index)
    }

    pub(crate) fn storage_mut(&mut self) -> &mut MarshallingStorage<S> {
        &mut self.storage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::UniqueId;
    use crate::storage::MemoryBackend;

    #[test]
    fn test_initial_state() {
        let mut state = PersistentState::new(MemoryBackend::new());
        state.init().unwrap();
        assert_eq!(state.current_term(), 0);
        assert_eq!(state.voted_for(), None);
        assert_eq!(state.log().last_index(), 0);
    }

    #[test]
    fn test_recovery_round_trip() {
        let mut state = PersistentState::new(MemoryBackend::new());
        state.init().unwrap();
        state.set_current_term(5).unwrap();
        state.set_voted_for(NodeId::new(3)).unwrap();
        state
            .append_log(Entry {
                term: 5,
                unique_id: UniqueId::new([1; 16]),
                node_id: NodeId::new(100).unwrap(),
            })
            .unwrap();

        let mut recovered = PersistentState::new(state.storage.into_inner());
        recovered.init().unwrap();
        assert_eq!(recovered.current_term(), 5);
        assert_eq!(recovered.voted_for(), NodeId::new(3));
        assert_eq!(recovered.log().last_index(), 1);
    }

    #[test]
    fn test_clearing_the_vote() {
        let mut state = PersistentState::new(MemoryBackend::new());
        state.init().unwrap();
        state.set_voted_for(NodeId::new(3)).unwrap();
        state.set_voted_for(None).unwrap();
        assert_eq!(state.voted_for(), None);

        let mut recovered = PersistentState::new(state.storage.into_inner());
        recovered.init().unwrap();
        assert_eq!(recovered.voted_for(), None);
    }
}
