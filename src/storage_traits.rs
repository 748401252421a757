use crate::certificate::LedgerSnapshot;
use crate::error::StorageError;
use crate::events::Receipt;
use crate::id::Address;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::iter::Iterator;

/// Iterator for traversing certificate snapshots in storage
pub trait LedgerSnapshotIterator: Iterator<Item = Result<LedgerSnapshot, StorageError>> {}

/// Iterator for traversing receipts in storage
pub trait ReceiptIterator: Iterator<Item = Result<Receipt, StorageError>> {}

/// Iterator over results collected eagerly by a backend
pub struct CollectedIter<T> {
    inner: std::vec::IntoIter<Result<T, StorageError>>,
}

impl<T> CollectedIter<T> {
    pub fn new(items: Vec<Result<T, StorageError>>) -> Self {
        Self {
            inner: items.into_iter(),
        }
    }

    /// An iterator yielding a single error
    pub fn failed(err: StorageError) -> Self {
        Self::new(vec![Err(err)])
    }
}

impl<T> Iterator for CollectedIter<T> {
    type Item = Result<T, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

impl LedgerSnapshotIterator for CollectedIter<LedgerSnapshot> {}
impl ReceiptIterator for CollectedIter<Receipt> {}

/// One committed operation: the state after it and the receipt describing it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub snapshot: LedgerSnapshot,
    pub receipt: Receipt,
}

/// Storage interface for certificate audit receipts
pub trait ReceiptStorage {
    /// Get a receipt by its position in a certificate's audit log
    ///
    /// # Parameters
    /// * `certificate` - The certificate the receipt belongs to
    /// * `sequence` - The receipt's sequence number
    ///
    /// # Returns
    /// Some(receipt) if found, None otherwise
    fn get_receipt(
        &self,
        certificate: &Address,
        sequence: u64,
    ) -> Result<Option<Receipt>, StorageError>;

    /// Get all receipts of a certificate
    ///
    /// # Parameters
    /// * `certificate` - The certificate to get receipts for
    ///
    /// # Returns
    /// An iterator that yields the receipts in ascending sequence order
    fn receipts_for(&self, certificate: &Address) -> Box<dyn ReceiptIterator + '_>;
}

/// Main storage interface for certificate ledgers
pub trait LedgerStorage: ReceiptStorage + Debug + Send + Sync {
    /// Get the latest snapshot of a certificate
    ///
    /// # Parameters
    /// * `certificate` - The address of the certificate to load
    ///
    /// # Returns
    /// Some(snapshot) if found, None otherwise
    fn load(&self, certificate: &Address) -> Result<Option<LedgerSnapshot>, StorageError>;

    /// Persist the state after an operation together with its receipt.
    ///
    /// Both are written atomically: either the snapshot is replaced and the
    /// receipt appended, or nothing changes.
    ///
    /// # Parameters
    /// * `snapshot` - The certificate state after the operation
    /// * `receipt` - The receipt of the operation
    ///
    /// # Returns
    /// Ok(()) if successful, Err otherwise
    fn commit(&self, snapshot: &LedgerSnapshot, receipt: &Receipt) -> Result<(), StorageError>;

    /// Create an iterator to scan through all certificate snapshots
    ///
    /// # Returns
    /// A boxed iterator that yields `LedgerSnapshot`s
    fn scan(&self) -> Box<dyn LedgerSnapshotIterator + '_>;

    /// Remove a certificate and its receipts
    ///
    /// # Parameters
    /// * `certificate` - The address of the certificate to remove
    ///
    /// # Returns
    /// `true` if the certificate existed
    fn delete(&self, certificate: &Address) -> Result<bool, StorageError>;
}

/// Check that a receipt continues the persisted log of its certificate
pub(crate) fn check_continuity(
    previous_sequence: Option<u64>,
    snapshot: &LedgerSnapshot,
    receipt: &Receipt,
) -> Result<(), StorageError> {
    if receipt.certificate != snapshot.address || receipt.sequence != snapshot.sequence {
        return Err(StorageError::Other(format!(
            "Receipt {}#{} does not match snapshot {}#{}",
            receipt.certificate, receipt.sequence, snapshot.address, snapshot.sequence
        )));
    }

    let expected = previous_sequence.map(|sequence| sequence + 1).unwrap_or(0);
    if receipt.sequence != expected {
        return Err(StorageError::Other(format!(
            "Out of order receipt for {}: expected sequence {}, got {}",
            receipt.certificate, expected, receipt.sequence
        )));
    }
    Ok(())
}
