#![cfg(feature = "rocksdb")]

use crate::certificate::LedgerSnapshot;
use crate::error::StorageError;
use crate::events::Receipt;
use crate::id::Address;
use crate::storage_traits::{
    check_continuity, CollectedIter, LedgerSnapshotIterator, LedgerStorage, ReceiptIterator,
    ReceiptStorage,
};
use anyhow::Context;
use log::debug;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};
use std::{
    fmt::Debug,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

// Column family names used to organize different types of data
const CF_CERTIFICATES: &str = "certificates";
const CF_RECEIPTS: &str = "receipts";

/// Key format for receipts: <certificate address><sequence, big endian>
///
/// Big endian keeps a certificate's receipts in sequence order on disk.
fn make_receipt_key(certificate: &Address, sequence: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(32 + 8);
    key.extend_from_slice(certificate.bytes());
    key.extend_from_slice(&sequence.to_be_bytes());
    key
}

/// RocksDB implementation of LedgerStorage
pub struct RocksDbStorage {
    db: Arc<DB>,
    db_path: PathBuf,

    /// Serializes the continuity check with the batch write
    commit_lock: Mutex<()>,
}

impl RocksDbStorage {
    /// Creates a new RocksDB storage at the specified path
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db_path = path.as_ref().to_path_buf();

        // Set up database options
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = vec![
            ColumnFamilyDescriptor::new(CF_CERTIFICATES, Options::default()),
            ColumnFamilyDescriptor::new(CF_RECEIPTS, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&opts, &db_path, descriptors)
            .with_context(|| format!("Failed to open RocksDB database at {:?}", db_path))?;

        debug!("Opened rocksdb ledger store at {}", db_path.display());
        Ok(Self {
            db: Arc::new(db),
            db_path,
            commit_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily, StorageError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::Database(format!("Column family {} not found", name)))
    }

    /// Collect all receipt keys and values stored under `certificate`
    fn receipt_entries(
        &self,
        certificate: &Address,
    ) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>, StorageError> {
        let cf_receipts = self.cf(CF_RECEIPTS)?;
        let prefix = certificate.bytes().to_vec();

        let mut entries = Vec::new();
        for item in self
            .db
            .iterator_cf(cf_receipts, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            entries.push((key, value));
        }
        Ok(entries)
    }
}

impl ReceiptStorage for RocksDbStorage {
    fn get_receipt(
        &self,
        certificate: &Address,
        sequence: u64,
    ) -> Result<Option<Receipt>, StorageError> {
        let cf_receipts = self.cf(CF_RECEIPTS)?;
        match self
            .db
            .get_cf(cf_receipts, make_receipt_key(certificate, sequence))?
        {
            Some(data) => Ok(Some(bincode::deserialize(&data)?)),
            None => Ok(None),
        }
    }

    fn receipts_for(&self, certificate: &Address) -> Box<dyn ReceiptIterator + '_> {
        match self.receipt_entries(certificate) {
            Ok(entries) => {
                let receipts: Vec<Result<Receipt, StorageError>> = entries
                    .iter()
                    .map(|(_, value)| bincode::deserialize(value).map_err(StorageError::from))
                    .collect();
                Box::new(CollectedIter::new(receipts))
            }
            Err(e) => Box::new(CollectedIter::failed(e)),
        }
    }
}

impl LedgerStorage for RocksDbStorage {
    fn load(&self, certificate: &Address) -> Result<Option<LedgerSnapshot>, StorageError> {
        let cf_certificates = self.cf(CF_CERTIFICATES)?;
        match self.db.get_cf(cf_certificates, certificate.bytes())? {
            Some(data) => Ok(Some(bincode::deserialize(&data)?)),
            None => Ok(None),
        }
    }

    fn commit(&self, snapshot: &LedgerSnapshot, receipt: &Receipt) -> Result<(), StorageError> {
        let _guard = self
            .commit_lock
            .lock()
            .map_err(|e| StorageError::Other(format!("Failed to acquire lock: {}", e)))?;

        let previous = self.load(&snapshot.address)?.map(|prev| prev.sequence);
        check_continuity(previous, snapshot, receipt)?;

        let serialized_snapshot = bincode::serialize(snapshot)
            .with_context(|| format!("Failed to serialize snapshot of {}", snapshot.address))?;
        let serialized_receipt = bincode::serialize(receipt)
            .with_context(|| format!("Failed to serialize receipt #{}", receipt.sequence))?;

        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf(CF_CERTIFICATES)?,
            snapshot.address.bytes(),
            serialized_snapshot,
        );
        batch.put_cf(
            self.cf(CF_RECEIPTS)?,
            make_receipt_key(&snapshot.address, receipt.sequence),
            serialized_receipt,
        );

        self.db
            .write(batch)
            .with_context(|| format!("Failed to commit receipt for {}", snapshot.address))?;
        Ok(())
    }

    fn scan(&self) -> Box<dyn LedgerSnapshotIterator + '_> {
        let cf_certificates = match self.cf(CF_CERTIFICATES) {
            Ok(cf) => cf,
            Err(e) => return Box::new(CollectedIter::failed(e)),
        };

        let snapshots: Vec<Result<LedgerSnapshot, StorageError>> = self
            .db
            .iterator_cf(cf_certificates, IteratorMode::Start)
            .map(|item| -> Result<LedgerSnapshot, StorageError> {
                let (_, value) = item?;
                Ok(bincode::deserialize(&value)?)
            })
            .collect();
        Box::new(CollectedIter::new(snapshots))
    }

    fn delete(&self, certificate: &Address) -> Result<bool, StorageError> {
        let _guard = self
            .commit_lock
            .lock()
            .map_err(|e| StorageError::Other(format!("Failed to acquire lock: {}", e)))?;

        if self.load(certificate)?.is_none() {
            return Ok(false);
        }

        let cf_receipts = self.cf(CF_RECEIPTS)?;
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_CERTIFICATES)?, certificate.bytes());
        for (key, _) in self.receipt_entries(certificate)? {
            batch.delete_cf(cf_receipts, key);
        }

        self.db.write(batch)?;
        Ok(true)
    }
}

impl Debug for RocksDbStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksDbStorage")
            .field("db_path", &self.db_path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::tests::exercise_storage;
    use tempfile::tempdir;

    #[test]
    fn test_receipt_keys_sort_by_sequence() {
        let address = Address::from_label("cert");
        assert!(make_receipt_key(&address, 2) < make_receipt_key(&address, 256));
        assert!(make_receipt_key(&address, 255) < make_receipt_key(&address, 256));
    }

    #[test]
    fn test_commit_load_and_reopen() {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("ledger_db");

        let certificate = {
            let storage = RocksDbStorage::new(&db_path).unwrap();
            exercise_storage(&storage)
        };

        let storage = RocksDbStorage::new(&db_path).unwrap();
        let loaded = storage.load(certificate.address()).unwrap().unwrap();
        assert_eq!(loaded, certificate.snapshot());

        let scanned: Vec<_> = storage.scan().collect::<Result<Vec<_>, _>>().unwrap();
        assert_eq!(scanned, vec![certificate.snapshot()]);
    }

    #[test]
    fn test_receipts_do_not_leak_across_certificates() {
        let temp_dir = tempdir().unwrap();
        let storage = RocksDbStorage::new(temp_dir.path().join("ledger_db")).unwrap();

        let first = exercise_storage(&storage);
        let second = exercise_storage(&storage);

        assert_eq!(storage.receipts_for(first.address()).count(), 3);
        assert_eq!(storage.receipts_for(second.address()).count(), 3);

        assert!(storage.delete(first.address()).unwrap());
        assert_eq!(storage.receipts_for(first.address()).count(), 0);
        assert_eq!(storage.receipts_for(second.address()).count(), 3);
        assert_eq!(storage.scan().count(), 1);
    }
}
