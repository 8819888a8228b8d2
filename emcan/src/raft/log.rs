//! Replicated Raft log
//!
//! Transparently replicates its state to the storage backend, keeping the
//! most recent state in memory: writes are slow, reads are instantaneous.
//! Index 0 is reserved as an empty sentinel with term 0; real entries live
//! in `[1, last_index]`.
//!
//! Storage keys: `log_last_index` (decimal), and per entry `log_term<i>`
//! (hex), `log_unique_id<i>` (32-char hex), `log_node_id<i>` (decimal).

use crate::core::NodeId;
use crate::raft::message::{Entry, Term};
use crate::storage::marshal::{indexed_key, MarshallingStorage};
use crate::storage::{StorageBackend, StorageError};

const KEY_LAST_INDEX: &str = "log_last_index";
const KEY_TERM: &str = "log_term";
const KEY_UNIQUE_ID: &str = "log_unique_id";
const KEY_NODE_ID: &str = "log_node_id";

/// Index into the replicated log
pub type LogIndex = u8;

pub struct Log {
    entries: [Option<Entry>; Self::CAPACITY],
    max_index: LogIndex,
}

impl Log {
    /// One slot per allocatable node ID plus the index-0 sentinel.
    pub const CAPACITY: usize = NodeId::MAX.into_u8() as usize + 1;

    pub fn new() -> Self {
        Self {
            entries: [None; Self::CAPACITY],
            max_index: 0,
        }
    }

    /// Reconstructs the log from storage. A missing or corrupt tail is cut
    /// off and the stored last index is rewritten accordingly; a completely
    /// unreadable log recovers as empty.
    pub fn init<S: StorageBackend>(
        &mut self,
        storage: &mut MarshallingStorage<S>,
    ) -> Result<(), StorageError> {
        self.entries = [None; Self::CAPACITY];
        self.max_index = 0;

        let last_index = match storage.get_u8(KEY_LAST_INDEX) {
            Some(index) if (index as usize) < Self::CAPACITY => index,
            _ => {
                storage.set_and_get_back_u8(KEY_LAST_INDEX, 0)?;
                return Ok(());
            }
        };

        for index in 1..=last_index {
            let entry = self.read_entry(storage, index);
            match entry {
                Some(entry) => {
                    self.entries[index as usize] = Some(entry);
                    self.max_index = index;
                }
                None => {
                    warn!("log entry {} unreadable, truncating", index);
                    break;
                }
            }
        }

        if self.max_index != last_index {
            storage.set_and_get_back_u8(KEY_LAST_INDEX, self.max_index)?;
        }
        Ok(())
    }

    fn read_entry<S: StorageBackend>(
        &self,
        storage: &MarshallingStorage<S>,
        index: LogIndex,
    ) -> Option<Entry> {
        let term = storage.get_u32(&indexed_key(KEY_TERM, index))?;
        let unique_id = storage.get_unique_id(&indexed_key(KEY_UNIQUE_ID, index))?;
        let node_id = NodeId::new(storage.get_u8(&indexed_key(KEY_NODE_ID, index))?)?;
        Some(Entry {
            term,
            unique_id,
            node_id,
        })
    }

    /// Appends one entry at `last_index + 1`. The in-memory index advances
    /// only after every storage sub-write has verified.
    pub fn append<S: StorageBackend>(
        &mut self,
        storage: &mut MarshallingStorage<S>,
        entry: Entry,
    ) -> Result<(), StorageError> {
        let index = self.max_index + 1;
        if index as usize >= Self::CAPACITY {
            warn!("log full");
            return Err(StorageError);
        }

        storage.set_and_get_back_u32(&indexed_key(KEY_TERM, index), entry.term)?;
        storage.set_and_get_back_unique_id(&indexed_key(KEY_UNIQUE_ID, index), &entry.unique_id)?;
        storage.set_and_get_back_u8(&indexed_key(KEY_NODE_ID, index), entry.node_id.into_u8())?;
        storage.set_and_get_back_u8(KEY_LAST_INDEX, index)?;

        self.entries[index as usize] = Some(entry);
        self.max_index = index;
        Ok(())
    }

    /// Truncates the log so that `last_index == index - 1`. Entries beyond
    /// remain in their storage slots but are logically absent.
    pub fn remove_entries_where_index_greater_or_equal<S: StorageBackend>(
        &mut self,
        storage: &mut MarshallingStorage<S>,
        index: LogIndex,
    ) -> Result<(), StorageError> {
        debug_assert!(index > 0);
        if index == 0 || index > self.max_index {
            return Ok(());
        }
        storage.set_and_get_back_u8(KEY_LAST_INDEX, index - 1)?;
        self.max_index = index - 1;
        Ok(())
    }

    pub fn last_index(&self) -> LogIndex {
        self.max_index
    }

    /// Term at `index`; index 0 is the sentinel with term 0, indices past
    /// the last one do not exist.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            Some(0)
        } else if index <= self.max_index {
            self.entries[index as usize].map(|entry| entry.term)
        } else {
            None
        }
    }

    pub fn last_term(&self) -> Term {
        unwrap!(self.term_at(self.max_index))
    }

    /// Entry at `index`; the sentinel and out-of-range indices yield nothing.
    pub fn entry_at(&self, index: LogIndex) -> Option<&Entry> {
        if index == 0 || index > self.max_index {
            return None;
        }
        self.entries[index as usize].as_ref()
    }

    /// Raft's up-to-date rule for the voting decision.
    pub fn is_other_log_up_to_date(&self, other_last_index: LogIndex, other_last_term: Term) -> bool {
        let last_term = self.last_term();
        other_last_term > last_term
            || (other_last_term == last_term && other_last_index >= self.max_index)
    }

    /// Walks the log from the highest index down to 1 and returns the first
    /// entry matching the predicate, so the most recent record for a key
    /// wins.
    pub fn find_last(&self, mut predicate: impl FnMut(&Entry) -> bool) -> Option<&Entry> {
        for index in (1..=self.max_index).rev() {
            let entry = unwrap!(self.entry_at(index));
            if predicate(entry) {
                return Some(entry);
            }
        }
        None
    }
}

impl Default for Log {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::UniqueId;
    use crate::storage::{MemoryBackend, StorageString};

    fn entry(term: Term, node_id: u8) -> Entry {
        Entry {
            term,
            unique_id: UniqueId::new([node_id; 16]),
            node_id: NodeId::new(node_id).unwrap(),
        }
    }

    #[test]
    fn test_empty_log() {
        let log = Log::new();
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term(), 0);
        assert_eq!(log.term_at(0), Some(0));
        assert_eq!(log.term_at(1), None);
        assert!(log.entry_at(0).is_none());
    }

    #[test]
    fn test_append_and_read_back() {
        let mut storage = MarshallingStorage::new(MemoryBackend::new());
        let mut log = Log::new();

        log.append(&mut storage, entry(1, 10)).unwrap();
        log.append(&mut storage, entry(2, 11)).unwrap();

        assert_eq!(log.last_index(), 2);
        assert_eq!(log.last_term(), 2);
        assert_eq!(log.entry_at(1).unwrap().node_id.into_u8(), 10);

        // A fresh log instance recovers the same state from storage.
        let mut recovered = Log::new();
        recovered.init(&mut storage).unwrap();
        assert_eq!(recovered.last_index(), 2);
        assert_eq!(recovered.entry_at(2), Some(&entry(2, 11)));
    }

    #[test]
    fn test_truncation_restores_pre_append_state() {
        let mut storage = MarshallingStorage::new(MemoryBackend::new());
        let mut log = Log::new();
        log.append(&mut storage, entry(1, 10)).unwrap();

        let before = log.last_index();
        log.append(&mut storage, entry(1, 11)).unwrap();
        log.remove_entries_where_index_greater_or_equal(&mut storage, before + 1)
            .unwrap();

        assert_eq!(log.last_index(), before);
        assert_eq!(log.term_at(before + 1), None);

        let mut recovered = Log::new();
        recovered.init(&mut storage).unwrap();
        assert_eq!(recovered.last_index(), before);
    }

    #[test]
    fn test_truncation_beyond_end_is_a_no_op() {
        let mut storage = MarshallingStorage::new(MemoryBackend::new());
        let mut log = Log::new();
        log.append(&mut storage, entry(1, 10)).unwrap();
        log.remove_entries_where_index_greater_or_equal(&mut storage, 5)
            .unwrap();
        assert_eq!(log.last_index(), 1);
    }

    #[test]
    fn test_corrupt_tail_cut_off_on_init() {
        let mut storage = MarshallingStorage::new(MemoryBackend::new());
        let mut log = Log::new();
        log.append(&mut storage, entry(1, 10)).unwrap();
        log.append(&mut storage, entry(1, 11)).unwrap();

        // Wipe the second entry's term behind the log's back.
        storage.remove("log_term2");

        let mut recovered = Log::new();
        recovered.init(&mut storage).unwrap();
        assert_eq!(recovered.last_index(), 1);
        assert_eq!(storage.get_u8("log_last_index"), Some(1));
    }

    #[test]
    fn test_failed_append_does_not_advance() {
        /// Fails every write whose key matches a marker, simulating a worn
        /// storage cell.
        struct FailingBackend {
            inner: MemoryBackend,
            poisoned_key: &'static str,
        }

        impl StorageBackend for FailingBackend {
            fn get(&self, key: &str) -> StorageString {
                self.inner.get(key)
            }
            fn set(&mut self, key: &str, value: &str) {
                if key != self.poisoned_key {
                    self.inner.set(key, value);
                }
            }
        }

        let mut storage = MarshallingStorage::new(FailingBackend {
            inner: MemoryBackend::new(),
            poisoned_key: "log_unique_id1",
        });
        let mut log = Log::new();

        assert_eq!(log.append(&mut storage, entry(1, 10)), Err(StorageError));
        assert_eq!(log.last_index(), 0);
        assert_eq!(storage.get_u8("log_last_index"), None);
    }

    #[test]
    fn test_up_to_date_rule() {
        let mut storage = MarshallingStorage::new(MemoryBackend::new());
        let mut log = Log::new();
        log.append(&mut storage, entry(2, 10)).unwrap();
        log.append(&mut storage, entry(3, 11)).unwrap();

        // Higher last term always wins.
        assert!(log.is_other_log_up_to_date(1, 4));
        // Equal term compares lengths.
        assert!(log.is_other_log_up_to_date(2, 3));
        assert!(log.is_other_log_up_to_date(3, 3));
        assert!(!log.is_other_log_up_to_date(1, 3));
        // Lower last term always loses.
        assert!(!log.is_other_log_up_to_date(9, 2));
    }

    #[test]
    fn test_find_last_prefers_recent_entries() {
        let mut storage = MarshallingStorage::new(MemoryBackend::new());
        let mut log = Log::new();
        let unique_id = UniqueId::new([7; 16]);

        log.append(
            &mut storage,
            Entry {
                term: 1,
                unique_id,
                node_id: NodeId::new(50).unwrap(),
            },
        )
        .unwrap();
        log.append(
            &mut storage,
            Entry {
                term: 2,
                unique_id,
                node_id: NodeId::new(51).unwrap(),
            },
        )
        .unwrap();

        let found = log.find_last(|entry| entry.unique_id == unique_id).unwrap();
        assert_eq!(found.node_id.into_u8(), 51);
    }
}
