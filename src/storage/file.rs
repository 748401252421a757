use crate::certificate::LedgerSnapshot;
use crate::error::StorageError;
use crate::events::Receipt;
use crate::id::Address;
use crate::storage::MemoryStorage;
use crate::storage_traits::{
    check_continuity, CommitRecord, LedgerSnapshotIterator, LedgerStorage, ReceiptIterator,
    ReceiptStorage,
};
use bincode;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Entry type in the log
#[derive(Debug, Clone, Serialize, Deserialize)]
enum LogEntry {
    /// A committed operation on a certificate
    Commit(CommitRecord),

    /// Removal of a certificate and its receipts
    Delete(Address),
}

/// Open log file and the length of its last complete record
struct LogFile {
    file: File,

    /// Bytes known to hold complete, synced records
    len: u64,

    /// Set when a failed append could not be rolled back
    poisoned: bool,

    /// Fail the next append after its bytes reach the file
    #[cfg(test)]
    fail_next_sync: bool,
}

impl LogFile {
    /// Append one record, or leave the file exactly as it was
    fn append(&mut self, record: &[u8]) -> Result<(), StorageError> {
        if self.poisoned {
            return Err(StorageError::WAL(
                "log is unusable after a failed rollback".to_string(),
            ));
        }

        match self.write_record(record) {
            Ok(()) => {
                self.len += record.len() as u64;
                Ok(())
            }
            Err(e) => {
                self.rollback();
                Err(StorageError::WAL(format!("Failed to append record: {}", e)))
            }
        }
    }

    fn write_record(&mut self, record: &[u8]) -> std::io::Result<()> {
        self.file.write_all(record)?;
        #[cfg(test)]
        if std::mem::take(&mut self.fail_next_sync) {
            return Err(std::io::Error::new(ErrorKind::Other, "injected sync failure"));
        }
        self.file.sync_data()
    }

    /// Cut the file back to its last complete record
    fn rollback(&mut self) {
        let restored = self
            .file
            .set_len(self.len)
            .and_then(|_| self.file.seek(SeekFrom::Start(self.len)))
            .and_then(|_| self.file.sync_data());
        if let Err(e) = restored {
            warn!("Failed to roll back log to {} bytes: {}", self.len, e);
            self.poisoned = true;
        }
    }
}

/// Durable storage backed by an append-only log file.
///
/// Every commit appends one length-prefixed `bincode` record and syncs it
/// before the in-memory view is updated. A failed append is cut back off the
/// file. Opening an existing file replays the log; a torn record at the tail
/// (an interrupted write) is discarded.
pub struct FileStorage {
    /// Path to the log file
    path: PathBuf,

    /// File handle for appending
    file: Mutex<LogFile>,

    /// Replayed view of the log
    view: MemoryStorage,
}

impl FileStorage {
    /// Open (or create) the log at `path` and replay its contents
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let view = MemoryStorage::new();

        let mut replayed = 0usize;
        let mut valid_len = 0u64;
        if path.exists() {
            let mut reader = BufReader::new(File::open(&path)?);
            while let Some((entry, len)) = Self::read_entry(&mut reader)? {
                match entry {
                    LogEntry::Commit(record) => view.commit(&record.snapshot, &record.receipt)?,
                    LogEntry::Delete(address) => {
                        view.delete(&address)?;
                    }
                }
                valid_len += len;
                replayed += 1;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .open(&path)
            .map_err(|e| StorageError::WAL(format!("Failed to open log file: {}", e)))?;

        // Drop a torn tail so new records start on a record boundary
        if file.metadata()?.len() > valid_len {
            warn!(
                "Discarding {} trailing bytes of {}",
                file.metadata()?.len() - valid_len,
                path.display()
            );
            file.set_len(valid_len)?;
        }

        file.seek(SeekFrom::Start(valid_len))?;

        debug!("Opened {} with {} records", path.display(), replayed);
        Ok(Self {
            path,
            file: Mutex::new(LogFile {
                file,
                len: valid_len,
                poisoned: false,
                #[cfg(test)]
                fail_next_sync: false,
            }),
            view,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read one entry; `None` at a clean end of file or a torn tail.
    ///
    /// Returns the entry and the number of bytes it occupied.
    fn read_entry<R: Read>(reader: &mut R) -> Result<Option<(LogEntry, u64)>, StorageError> {
        let mut len_buf = [0u8; 8];
        match reader.read_exact(&mut len_buf) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(StorageError::from(e)),
        }

        let entry_len = u64::from_le_bytes(len_buf);
        let mut entry_data = vec![0u8; entry_len as usize];
        match reader.read_exact(&mut entry_data) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(StorageError::from(e)),
        }

        let entry: LogEntry = bincode::deserialize(&entry_data)?;
        Ok(Some((entry, 8 + entry_len)))
    }

    fn append(&self, file: &mut LogFile, entry: &LogEntry) -> Result<(), StorageError> {
        let serialized = bincode::serialize(entry)?;

        // Entry length and data go out in a single write
        let entry_len = serialized.len() as u64;
        let mut record = Vec::with_capacity(8 + serialized.len());
        record.extend_from_slice(&entry_len.to_le_bytes());
        record.extend_from_slice(&serialized);
        file.append(&record)
    }

    fn lock_file(&self) -> Result<std::sync::MutexGuard<'_, LogFile>, StorageError> {
        self.file
            .lock()
            .map_err(|e| StorageError::WAL(format!("Failed to acquire lock: {}", e)))
    }
}

impl ReceiptStorage for FileStorage {
    fn get_receipt(
        &self,
        certificate: &Address,
        sequence: u64,
    ) -> Result<Option<Receipt>, StorageError> {
        self.view.get_receipt(certificate, sequence)
    }

    fn receipts_for(&self, certificate: &Address) -> Box<dyn ReceiptIterator + '_> {
        self.view.receipts_for(certificate)
    }
}

impl LedgerStorage for FileStorage {
    fn load(&self, certificate: &Address) -> Result<Option<LedgerSnapshot>, StorageError> {
        self.view.load(certificate)
    }

    fn commit(&self, snapshot: &LedgerSnapshot, receipt: &Receipt) -> Result<(), StorageError> {
        // Holding the file lock serializes appends with view updates
        let mut file = self.lock_file()?;

        let previous = self.view.load(&snapshot.address)?.map(|prev| prev.sequence);
        check_continuity(previous, snapshot, receipt)?;

        let entry = LogEntry::Commit(CommitRecord {
            snapshot: snapshot.clone(),
            receipt: receipt.clone(),
        });
        self.append(&mut file, &entry)?;
        self.view.commit(snapshot, receipt)
    }

    fn scan(&self) -> Box<dyn LedgerSnapshotIterator + '_> {
        self.view.scan()
    }

    fn delete(&self, certificate: &Address) -> Result<bool, StorageError> {
        let mut file = self.lock_file()?;
        if self.view.load(certificate)?.is_none() {
            return Ok(false);
        }

        self.append(&mut file, &LogEntry::Delete(*certificate))?;
        self.view.delete(certificate)
    }
}

impl std::fmt::Debug for FileStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStorage")
            .field("path", &self.path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::tests::exercise_storage;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_commit_and_reopen() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("ledger.log");

        let certificate = {
            let storage = FileStorage::open(&path).unwrap();
            exercise_storage(&storage)
        };

        // Reopen and check that the log was replayed
        let storage = FileStorage::open(&path).unwrap();
        let loaded = storage.load(certificate.address()).unwrap().unwrap();
        assert_eq!(loaded, certificate.snapshot());
        assert_eq!(storage.receipts_for(certificate.address()).count(), 3);
    }

    #[test]
    fn test_delete_survives_reopen() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("ledger.log");

        let address = {
            let storage = FileStorage::open(&path).unwrap();
            let certificate = exercise_storage(&storage);
            assert!(storage.delete(certificate.address()).unwrap());
            *certificate.address()
        };

        let storage = FileStorage::open(&path).unwrap();
        assert!(storage.load(&address).unwrap().is_none());
        assert_eq!(storage.scan().count(), 0);
    }

    #[test]
    fn test_failed_append_is_rolled_back() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("ledger.log");

        let storage = FileStorage::open(&path).unwrap();
        let mut certificate = exercise_storage(&storage);
        let manager = *certificate.manager();
        let synced_len = std::fs::metadata(&path).unwrap().len();

        // The record reaches the file but the sync fails
        let mut retry = certificate.clone();
        let receipt = certificate.add_inventory(&manager, 5).unwrap();
        storage.lock_file().unwrap().fail_next_sync = true;
        let result = storage.commit(&certificate.snapshot(), &receipt);
        assert!(matches!(result, Err(StorageError::WAL(_))));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), synced_len);
        assert_eq!(storage.receipts_for(certificate.address()).count(), 3);

        // The same sequence is issued again, with a different operation
        let receipt = retry.add_inventory(&manager, 7).unwrap();
        storage.commit(&retry.snapshot(), &receipt).unwrap();
        drop(storage);

        let storage = FileStorage::open(&path).unwrap();
        let loaded = storage.load(retry.address()).unwrap().unwrap();
        assert_eq!(loaded, retry.snapshot());
        assert_eq!(storage.receipts_for(retry.address()).count(), 4);
    }

    #[test]
    fn test_torn_tail_is_discarded() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("ledger.log");

        let certificate = {
            let storage = FileStorage::open(&path).unwrap();
            exercise_storage(&storage)
        };

        // Simulate a crash halfway through writing a record
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&1000u64.to_le_bytes()).unwrap();
            file.write_all(&[1, 2, 3]).unwrap();
        }

        let storage = FileStorage::open(&path).unwrap();
        let loaded = storage.load(certificate.address()).unwrap().unwrap();
        assert_eq!(loaded, certificate.snapshot());

        // New records land after the last good one
        let mut certificate = certificate;
        let manager = *certificate.manager();
        let receipt = certificate.add_inventory(&manager, 5).unwrap();
        storage.commit(&certificate.snapshot(), &receipt).unwrap();
        drop(storage);

        let storage = FileStorage::open(&path).unwrap();
        assert_eq!(storage.receipts_for(certificate.address()).count(), 4);
    }
}
