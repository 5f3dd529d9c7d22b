//! Host-provided persistence for the device identity record.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{KeyboundError, KeyboundResult};

/// Atomic blob store for small binary files (e.g., `device_identity.bin`).
///
/// Platforms back this with their app-private storage (Application Support
/// on iOS, internal storage on Android) and an atomic rename on write.
#[uniffi::export(with_foreign)]
pub trait AtomicBlobStore: Send + Sync {
    /// Reads the blob at `path`, if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn read(&self, path: String) -> KeyboundResult<Option<Vec<u8>>>;

    /// Writes bytes atomically to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn write_atomic(&self, path: String, bytes: Vec<u8>) -> KeyboundResult<()>;

    /// Deletes the blob at `path`. Deleting a missing blob is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    fn delete(&self, path: String) -> KeyboundResult<()>;
}

/// In-memory blob store, for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl AtomicBlobStore for MemoryBlobStore {
    fn read(&self, path: String) -> KeyboundResult<Option<Vec<u8>>> {
        let guard = self
            .blobs
            .lock()
            .map_err(|_| KeyboundError::Storage("mutex poisoned".to_string()))?;
        Ok(guard.get(&path).cloned())
    }

    fn write_atomic(&self, path: String, bytes: Vec<u8>) -> KeyboundResult<()> {
        self.blobs
            .lock()
            .map_err(|_| KeyboundError::Storage("mutex poisoned".to_string()))?
            .insert(path, bytes);
        Ok(())
    }

    fn delete(&self, path: String) -> KeyboundResult<()> {
        self.blobs
            .lock()
            .map_err(|_| KeyboundError::Storage("mutex poisoned".to_string()))?
            .remove(&path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_blob_store_replace_and_delete() {
        let store = MemoryBlobStore::new();
        assert_eq!(store.read("a.bin".to_string()).unwrap(), None);

        store.write_atomic("a.bin".to_string(), vec![1]).unwrap();
        store.write_atomic("a.bin".to_string(), vec![2, 3]).unwrap();
        assert_eq!(store.read("a.bin".to_string()).unwrap(), Some(vec![2, 3]));

        store.delete("a.bin".to_string()).unwrap();
        store.delete("a.bin".to_string()).unwrap();
        assert_eq!(store.read("a.bin".to_string()).unwrap(), None);
    }
}
