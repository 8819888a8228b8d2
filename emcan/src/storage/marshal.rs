//! Storage marshalling
//!
//! Serializes the consensus state variables into storage strings: unsigned
//! integers as lowercase hexadecimal without leading zeros, log indices and
//! node IDs as decimal, and 128-bit unique IDs as 32-character lowercase
//! hex. Every write is verified by an immediate read-back; a mismatch makes
//! the caller treat the write as failed.

use core::fmt::Write;

use crate::core::UniqueId;
use crate::storage::{StorageBackend, StorageError, StorageString};

pub struct MarshallingStorage<S> {
    backend: S,
}

impl<S: StorageBackend> MarshallingStorage<S> {
    pub fn new(backend: S) -> Self {
        Self { backend }
    }

    pub fn into_inner(self) -> S {
        self.backend
    }

    fn set_and_get_back(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        self.backend.set(key, value);
        if self.backend.get(key).as_str() == value {
            Ok(())
        } else {
            warn!("storage write-back mismatch");
            Err(StorageError)
        }
    }

    /// Writes `value` as lowercase hex and verifies the write.
    pub fn set_and_get_back_u32(&mut self, key: &str, value: u32) -> Result<(), StorageError> {
        let mut encoded = StorageString::new();
        write!(encoded, "{value:x}").map_err(|_| StorageError)?;
        self.set_and_get_back(key, &encoded)
    }

    pub fn get_u32(&self, key: &str) -> Option<u32> {
        let value = self.backend.get(key);
        if value.is_empty() || !value.bytes().all(is_lowercase_hex) {
            return None;
        }
        u32::from_str_radix(&value, 16).ok()
    }

    /// Writes `value` as decimal digits and verifies the write. Used for log
    /// indices, node IDs, and the cluster size.
    pub fn set_and_get_back_u8(&mut self, key: &str, value: u8) -> Result<(), StorageError> {
        let mut encoded = StorageString::new();
        write!(encoded, "{value}").map_err(|_| StorageError)?;
        self.set_and_get_back(key, &encoded)
    }

    pub fn get_u8(&self, key: &str) -> Option<u8> {
        let value = self.backend.get(key);
        if value.is_empty() || !value.bytes().all(|byte| byte.is_ascii_digit()) {
            return None;
        }
        value.parse().ok()
    }

    /// Writes the unique ID as 32 lowercase hex characters and verifies the
    /// write.
    pub fn set_and_get_back_unique_id(
        &mut self,
        key: &str,
        value: &UniqueId,
    ) -> Result<(), StorageError> {
        let mut encoded = StorageString::new();
        for byte in value.as_bytes() {
            write!(encoded, "{byte:02x}").map_err(|_| StorageError)?;
        }
        self.set_and_get_back(key, &encoded)
    }

    pub fn get_unique_id(&self, key: &str) -> Option<UniqueId> {
        let value = self.backend.get(key);
        if value.len() != 2 * UniqueId::SIZE || !value.bytes().all(is_lowercase_hex) {
            return None;
        }
        let mut bytes = [0u8; UniqueId::SIZE];
        for (index, chunk) in value.as_bytes().chunks_exact(2).enumerate() {
            bytes[index] = nibble(chunk[0]) << 4 | nibble(chunk[1]);
        }
        Some(UniqueId::new(bytes))
    }

    /// Deletes the entry under `key`.
    pub fn remove(&mut self, key: &str) {
        self.backend.set(key, "");
    }
}

fn is_lowercase_hex(byte: u8) -> bool {
    byte.is_ascii_digit() || (b'a'..=b'f').contains(&byte)
}

fn nibble(byte: u8) -> u8 {
    match byte {
        b'0'..=b'9' => byte - b'0',
        _ => byte - b'a' + 10,
    }
}

/// Builds an indexed key, e.g. `log_term12`.
pub fn indexed_key(prefix: &str, index: u8) -> StorageString {
    let mut key = StorageString::new();
    // Cannot overflow: every prefix in use is far below the length limit.
    let _ = write!(key, "{prefix}{index}");
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;

    #[test]
    fn test_u32_round_trip() {
        let mut storage = MarshallingStorage::new(MemoryBackend::new());
        storage.set_and_get_back_u32("current_term", 0xdead_beef).unwrap();
        assert_eq!(storage.get_u32("current_term"), Some(0xdead_beef));

        storage.set_and_get_back_u32("current_term", 0).unwrap();
        assert_eq!(storage.get_u32("current_term"), Some(0));
    }

    #[test]
    fn test_u8_round_trip() {
        let mut storage = MarshallingStorage::new(MemoryBackend::new());
        storage.set_and_get_back_u8("log_last_index", 127).unwrap();
        assert_eq!(storage.get_u8("log_last_index"), Some(127));
    }

    #[test]
    fn test_unique_id_round_trip() {
        let unique_id = UniqueId::new(core::array::from_fn(|i| i as u8 * 3));
        let mut storage = MarshallingStorage::new(MemoryBackend::new());
        storage
            .set_and_get_back_unique_id("log_unique_id1", &unique_id)
            .unwrap();
        assert_eq!(storage.get_unique_id("log_unique_id1"), Some(unique_id));
    }

    #[test]
    fn test_missing_and_malformed_values() {
        let mut storage = MarshallingStorage::new(MemoryBackend::new());
        assert_eq!(storage.get_u32("absent"), None);

        storage.backend.set("junk", "xyz");
        assert_eq!(storage.get_u32("junk"), None);
        assert_eq!(storage.get_u8("junk"), None);
        assert_eq!(storage.get_unique_id("junk"), None);

        // Uppercase hex is rejected.
        storage.backend.set("upper", "DEAD");
        assert_eq!(storage.get_u32("upper"), None);
    }

    #[test]
    fn test_write_back_failure_detected() {
        struct Lossy;

        impl StorageBackend for Lossy {
            fn get(&self, _key: &str) -> StorageString {
                StorageString::new()
            }
            fn set(&mut self, _key: &str, _value: &str) {}
        }

        let mut storage = MarshallingStorage::new(Lossy);
        assert_eq!(
            storage.set_and_get_back_u32("current_term", 1),
            Err(StorageError)
        );
    }

    #[test]
    fn test_indexed_key() {
        assert_eq!(indexed_key("log_term", 12).as_str(), "log_term12");
        assert_eq!(indexed_key("log_unique_id", 0).as_str(), "log_unique_id0");
    }
}
