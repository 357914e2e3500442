//! # Record Storage
//!
//! In-memory record storage shared by all workers. A record is opaque
//! payload bytes preceded by an embedded TID word called the *owner*; the
//! owner word is the record's only synchronization point. This module
//! provides the record itself plus the flat-array storage variant, the
//! simplest indexed layout: a fixed-size array of fixed-size records
//! addressed by offset.
//!
//! Page-organized variants (trees, hash layouts) build on the same record
//! discipline but are out of scope here.

use std::sync::Arc;

use eyre::{ensure, Result};
use hashbrown::HashMap;
use parking_lot::RwLock;

pub mod array;
pub mod record;

pub use array::ArrayStorage;
pub use record::Record;

/// Identifies a storage instance engine-wide. Stamped into every log record
/// so replay can route records back to their storage.
pub type StorageId = u32;

/// Engine-scoped table of storages, addressed by [`StorageId`].
///
/// Tasks resolve ids through this table instead of holding storage pointers
/// of their own; the transaction context pins what it touches, so dropping
/// a storage here never pulls records out from under an active transaction.
pub struct StorageRegistry {
    storages: RwLock<HashMap<StorageId, Arc<ArrayStorage>>>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self {
            storages: RwLock::new(HashMap::new()),
        }
    }

    pub fn create_array(
        &self,
        id: StorageId,
        array_size: u64,
        payload_size: u16,
    ) -> Result<Arc<ArrayStorage>> {
        let mut storages = self.storages.write();
        ensure!(!storages.contains_key(&id), "storage id {} already exists", id);
        let storage = Arc::new(ArrayStorage::new(id, array_size, payload_size)?);
        storages.insert(id, Arc::clone(&storage));
        Ok(storage)
    }

    pub fn array(&self, id: StorageId) -> Option<Arc<ArrayStorage>> {
        self.storages.read().get(&id).cloned()
    }

    pub fn drop_storage(&self, id: StorageId) -> Result<()> {
        ensure!(
            self.storages.write().remove(&id).is_some(),
            "storage id {} does not exist",
            id
        );
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.storages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.storages.read().is_empty()
    }
}

impl Default for StorageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_create_lookup_drop() {
        let registry = StorageRegistry::new();
        assert!(registry.is_empty());

        let storage = registry.create_array(1, 8, 16).unwrap();
        assert_eq!(storage.id(), 1);
        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.array(1).unwrap(), &storage));
        assert!(registry.array(2).is_none());

        assert!(registry.create_array(1, 8, 16).is_err());
        registry.drop_storage(1).unwrap();
        assert!(registry.drop_storage(1).is_err());
        assert!(registry.is_empty());
    }
}
