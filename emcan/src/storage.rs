//! Persistent key-value storage abstraction
//!
//! The consensus layer keeps its durable state in a key-value store with
//! fixed small blocks, so backends can be implemented trivially on top of
//! EEPROM pages, flash sectors, or text files. Keys and values are ASCII
//! strings of `[A-Za-z0-9_]`, at most [`MAX_STRING_LENGTH`] bytes.

pub mod marshal;
pub mod memory;

pub use marshal::MarshallingStorage;
pub use memory::MemoryBackend;

/// Maximum length of keys and values. One pair takes twice as much space.
pub const MAX_STRING_LENGTH: usize = 32;

/// The stack never requires more than this number of key/value pairs.
pub const MAX_KEY_VALUE_PAIRS: usize = 400;

pub type StorageString = heapless::String<MAX_STRING_LENGTH>;

/// Read-back verification mismatch
///
/// The write is treated as failed; consumers retry the containing operation,
/// which is idempotent. Never fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StorageError;

/// Storage medium interface
///
/// Both operations must complete within roughly 50 ms so handlers stay
/// prompt.
pub trait StorageBackend {
    /// Reads one value. Returns an empty string when the key does not exist
    /// or the read failed.
    fn get(&self, key: &str) -> StorageString;

    /// Creates or updates the entry. An empty value requests deletion.
    /// Failures are ignored here; consumers verify by reading back.
    fn set(&mut self, key: &str, value: &str);
}

/// Checks the storage character-set restriction.
pub fn is_valid_storage_string(value: &str) -> bool {
    value.len() <= MAX_STRING_LENGTH
        && value
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || byte == b'_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_string_validity() {
        assert!(is_valid_storage_string("log_term12"));
        assert!(is_valid_storage_string(""));
        assert!(!is_valid_storage_string("no spaces"));
        assert!(!is_valid_storage_string("no-dashes"));
        assert!(!is_valid_storage_string(
            "way_too_long_for_a_storage_string_cell"
        ));
    }
}
