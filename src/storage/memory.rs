use crate::certificate::LedgerSnapshot;
use crate::error::StorageError;
use crate::events::Receipt;
use crate::id::Address;
use crate::storage_traits::{
    check_continuity, CollectedIter, LedgerSnapshotIterator, LedgerStorage, ReceiptIterator,
    ReceiptStorage,
};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct MemoryState {
    snapshots: BTreeMap<Address, LedgerSnapshot>,
    receipts: BTreeMap<Address, Vec<Receipt>>,
}

/// Volatile storage keeping everything in process memory
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: Mutex<MemoryState>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StorageError> {
        self.state
            .lock()
            .map_err(|e| StorageError::Other(format!("Failed to acquire lock: {}", e)))
    }

    /// Number of certificates held
    pub fn len(&self) -> usize {
        self.lock().map(|state| state.snapshots.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ReceiptStorage for MemoryStorage {
    fn get_receipt(
        &self,
        certificate: &Address,
        sequence: u64,
    ) -> Result<Option<Receipt>, StorageError> {
        let state = self.lock()?;
        Ok(state
            .receipts
            .get(certificate)
            .and_then(|log| log.iter().find(|receipt| receipt.sequence == sequence))
            .cloned())
    }

    fn receipts_for(&self, certificate: &Address) -> Box<dyn ReceiptIterator + '_> {
        match self.lock() {
            Ok(state) => {
                let receipts: Vec<Result<Receipt, StorageError>> = state
                    .receipts
                    .get(certificate)
                    .map(|log| log.iter().cloned().map(Ok).collect())
                    .unwrap_or_default();
                Box::new(CollectedIter::new(receipts))
            }
            Err(e) => Box::new(CollectedIter::failed(e)),
        }
    }
}

impl LedgerStorage for MemoryStorage {
    fn load(&self, certificate: &Address) -> Result<Option<LedgerSnapshot>, StorageError> {
        Ok(self.lock()?.snapshots.get(certificate).cloned())
    }

    fn commit(&self, snapshot: &LedgerSnapshot, receipt: &Receipt) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        let previous = state.snapshots.get(&snapshot.address).map(|prev| prev.sequence);
        check_continuity(previous, snapshot, receipt)?;

        state.snapshots.insert(snapshot.address, snapshot.clone());
        state
            .receipts
            .entry(snapshot.address)
            .or_default()
            .push(receipt.clone());
        Ok(())
    }

    fn scan(&self) -> Box<dyn LedgerSnapshotIterator + '_> {
        match self.lock() {
            Ok(state) => {
                let snapshots: Vec<Result<LedgerSnapshot, StorageError>> =
                    state.snapshots.values().cloned().map(Ok).collect();
                Box::new(CollectedIter::new(snapshots))
            }
            Err(e) => Box::new(CollectedIter::failed(e)),
        }
    }

    fn delete(&self, certificate: &Address) -> Result<bool, StorageError> {
        let mut state = self.lock()?;
        state.receipts.remove(certificate);
        Ok(state.snapshots.remove(certificate).is_some())
    }
}
