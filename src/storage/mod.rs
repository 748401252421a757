// Re-export the storage traits
pub use crate::storage_traits::{LedgerStorage, ReceiptStorage};

use crate::config::StorageConfig;
use crate::error::StorageError;
use std::sync::Arc;

// Export implementations
pub(crate) mod file;
pub(crate) mod memory;
pub use file::FileStorage;
pub use memory::MemoryStorage;

#[cfg(feature = "sqlite")]
mod sqlite;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;

#[cfg(feature = "rocksdb")]
mod rocksdb;
#[cfg(feature = "rocksdb")]
pub use rocksdb::RocksDbStorage;

/// Open the backend selected by `config`.
///
/// Selecting a backend whose cargo feature is disabled is an error rather
/// than a silent fallback to memory.
pub fn open_storage(config: &StorageConfig) -> Result<Arc<dyn LedgerStorage>, StorageError> {
    match config {
        StorageConfig::Memory => Ok(Arc::new(MemoryStorage::new())),
        StorageConfig::File { path } => Ok(Arc::new(FileStorage::open(path)?)),

        #[cfg(feature = "sqlite")]
        StorageConfig::Sqlite { path } => Ok(Arc::new(SqliteStorage::new(path)?)),
        #[cfg(not(feature = "sqlite"))]
        StorageConfig::Sqlite { .. } => Err(StorageError::Other(
            "SQLite backend requested but the `sqlite` feature is disabled".to_string(),
        )),

        #[cfg(feature = "rocksdb")]
        StorageConfig::RocksDb { path } => Ok(Arc::new(RocksDbStorage::new(path)?)),
        #[cfg(not(feature = "rocksdb"))]
        StorageConfig::RocksDb { .. } => Err(StorageError::Other(
            "RocksDB backend requested but the `rocksdb` feature is disabled".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_storage_backends() {
        let memory = open_storage(&StorageConfig::Memory).unwrap();
        assert_eq!(memory.scan().count(), 0);

        let temp_dir = tempdir().unwrap();
        let file = open_storage(&StorageConfig::File {
            path: temp_dir.path().join("ledger.log"),
        })
        .unwrap();
        memory::tests::exercise_storage(file.as_ref());
        assert_eq!(file.scan().count(), 1);
    }

    #[cfg(not(feature = "rocksdb"))]
    #[test]
    fn test_disabled_backend_is_rejected() {
        let temp_dir = tempdir().unwrap();
        let result = open_storage(&StorageConfig::RocksDb {
            path: temp_dir.path().join("ledger_db"),
        });
        assert!(result.is_err());
    }
}
