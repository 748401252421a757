use crate::certificate::{Certificate, LedgerResult, LedgerSnapshot, TransferOutcome};
use crate::commitment::StateCommitment;
use crate::error::LedgerError;
use crate::events::Receipt;
use crate::id::Address;
use crate::storage_traits::LedgerStorage;
use crate::token::{Token, TokenId, TokenInfo};
use log::warn;
use std::sync::{Arc, Mutex, MutexGuard};

/// Shared, persistent handle to one certificate ledger.
///
/// Writes run on a working copy of the ledger. The resulting snapshot and
/// receipt are committed to storage, and only after the commit succeeds does
/// the copy replace the published state. A rejected operation or a failed
/// commit therefore leaves both the ledger and storage untouched.
#[derive(Clone)]
pub struct CertificateHandle {
    address: Address,
    inner: Arc<Mutex<Certificate>>,
    storage: Arc<dyn LedgerStorage>,
}

impl CertificateHandle {
    pub(crate) fn new(certificate: Certificate, storage: Arc<dyn LedgerStorage>) -> Self {
        Self {
            address: *certificate.address(),
            inner: Arc::new(Mutex::new(certificate)),
            storage,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    fn lock(&self) -> LedgerResult<MutexGuard<'_, Certificate>> {
        self.inner
            .lock()
            .map_err(|e| LedgerError::Lock(format!("certificate {}: {}", self.address, e)))
    }

    /// Run a write on a working copy, persist it, then publish it
    fn apply<T>(
        &self,
        action: &str,
        op: impl FnOnce(&mut Certificate) -> LedgerResult<(T, Receipt)>,
    ) -> LedgerResult<(T, Receipt)> {
        let mut published = self.lock()?;
        // Copies the token map: a write is O(tokens)
        let mut working = published.clone();

        let (value, receipt) = op(&mut working).map_err(|e| {
            warn!("Rejected {} on {}: {}", action, self.address, e);
            e
        })?;

        self.storage.commit(&working.snapshot(), &receipt)?;
        *published = working;
        Ok((value, receipt))
    }

    /// Run a read against the published state
    fn read<T>(&self, op: impl FnOnce(&Certificate) -> LedgerResult<T>) -> LedgerResult<T> {
        op(&*self.lock()?)
    }

    // ---- Write surface ----

    pub fn award_item(
        &self,
        caller: &Address,
        recipient: &Address,
        quantity: u64,
    ) -> LedgerResult<(TokenId, Receipt)> {
        self.apply("award", |certificate| {
            certificate.award_item(caller, recipient, quantity)
        })
    }

    pub fn transfer(
        &self,
        caller: &Address,
        token_id: TokenId,
        quantity: u64,
        recipient: &Address,
    ) -> LedgerResult<(TransferOutcome, Receipt)> {
        self.apply("transfer", |certificate| {
            certificate.transfer(caller, token_id, quantity, recipient)
        })
    }

    pub fn write_off(
        &self,
        caller: &Address,
        token_id: TokenId,
        quantity: u64,
    ) -> LedgerResult<Receipt> {
        self.apply("write-off", |certificate| {
            Ok(((), certificate.write_off(caller, token_id, quantity)?))
        })
        .map(|(_, receipt)| receipt)
    }

    pub fn add_inventory(&self, caller: &Address, quantity: u64) -> LedgerResult<Receipt> {
        self.apply("add-inventory", |certificate| {
            Ok(((), certificate.add_inventory(caller, quantity)?))
        })
        .map(|(_, receipt)| receipt)
    }

    pub fn destroy(&self, caller: &Address) -> LedgerResult<Receipt> {
        self.apply("destroy", |certificate| Ok(((), certificate.destroy(caller)?)))
            .map(|(_, receipt)| receipt)
    }

    // ---- Read surface ----

    pub fn manager(&self) -> LedgerResult<Address> {
        self.read(|certificate| Ok(*certificate.manager()))
    }

    pub fn is_destroyed(&self) -> LedgerResult<bool> {
        self.read(|certificate| Ok(certificate.is_destroyed()))
    }

    pub fn sequence(&self) -> LedgerResult<u64> {
        self.read(|certificate| Ok(certificate.sequence()))
    }

    pub fn commitment(&self) -> LedgerResult<StateCommitment> {
        self.read(|certificate| Ok(*certificate.commitment()))
    }

    pub fn name(&self) -> LedgerResult<String> {
        self.read(Certificate::name)
    }

    pub fn unit(&self) -> LedgerResult<String> {
        self.read(Certificate::unit)
    }

    pub fn total_quantity(&self) -> LedgerResult<u64> {
        self.read(Certificate::total_quantity)
    }

    pub fn margin(&self) -> LedgerResult<u64> {
        self.read(Certificate::margin)
    }

    pub fn written_off(&self) -> LedgerResult<u64> {
        self.read(Certificate::written_off)
    }

    pub fn inventory_added(&self) -> LedgerResult<u64> {
        self.read(Certificate::inventory_added)
    }

    pub fn base_uri(&self) -> LedgerResult<String> {
        self.read(Certificate::base_uri)
    }

    pub fn token_uri(&self, token_id: TokenId) -> LedgerResult<String> {
        self.read(|certificate| certificate.token_uri(token_id))
    }

    pub fn get_amount(&self, token_id: TokenId) -> LedgerResult<u64> {
        self.read(|certificate| certificate.get_amount(token_id))
    }

    pub fn owner_of(&self, token_id: TokenId) -> LedgerResult<Address> {
        self.read(|certificate| certificate.owner_of(token_id))
    }

    pub fn token(&self, token_id: TokenId) -> LedgerResult<TokenInfo> {
        self.read(|certificate| certificate.token(token_id))
    }

    pub fn tokens_of(&self, owner: &Address) -> LedgerResult<Vec<Token>> {
        self.read(|certificate| certificate.tokens_of(owner))
    }

    pub fn balance_of(&self, owner: &Address) -> LedgerResult<u128> {
        self.read(|certificate| certificate.balance_of(owner))
    }

    pub fn token_count(&self) -> LedgerResult<usize> {
        self.read(Certificate::token_count)
    }

    pub fn check_conservation(&self) -> LedgerResult<()> {
        self.read(Certificate::check_conservation)
    }

    pub fn snapshot(&self) -> LedgerResult<LedgerSnapshot> {
        self.read(|certificate| Ok(certificate.snapshot()))
    }

    /// The persisted audit log of this certificate, oldest first
    pub fn receipts(&self) -> LedgerResult<Vec<Receipt>> {
        Ok(self
            .storage
            .receipts_for(&self.address)
            .collect::<Result<Vec<_>, _>>()?)
    }
}

impl std::fmt::Debug for CertificateHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateHandle")
            .field("address", &self.address)
            .field("storage", &self.storage)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LedgerConfig;
    use crate::error::StorageError;
    use crate::id::tests::unique_address;
    use crate::storage::MemoryStorage;
    use crate::storage_traits::{LedgerSnapshotIterator, ReceiptIterator, ReceiptStorage};
    use std::thread;

    fn handle_on(storage: Arc<dyn LedgerStorage>) -> (CertificateHandle, Address) {
        let manager = unique_address();
        let (certificate, created) = Certificate::create(
            unique_address(),
            manager,
            "82年飞天茅台",
            100,
            "瓶",
            LedgerConfig::default(),
        )
        .unwrap();
        storage.commit(&certificate.snapshot(), &created).unwrap();
        (CertificateHandle::new(certificate, storage), manager)
    }

    #[test]
    fn test_writes_are_persisted() {
        let storage: Arc<dyn LedgerStorage> = Arc::new(MemoryStorage::new());
        let (handle, manager) = handle_on(storage.clone());
        let alice = unique_address();

        let (token, _) = handle.award_item(&manager, &alice, 3).unwrap();
        handle.write_off(&alice, token, 1).unwrap();

        let stored = storage.load(handle.address()).unwrap().unwrap();
        assert_eq!(stored, handle.snapshot().unwrap());
        assert_eq!(handle.receipts().unwrap().len(), 3);
        assert_eq!(handle.get_amount(token).unwrap(), 2);
    }

    #[test]
    fn test_rejected_write_is_not_persisted() {
        let storage: Arc<dyn LedgerStorage> = Arc::new(MemoryStorage::new());
        let (handle, manager) = handle_on(storage.clone());
        let alice = unique_address();

        let result = handle.award_item(&manager, &alice, 101);
        assert!(matches!(result, Err(LedgerError::InvalidQuantity { .. })));
        assert_eq!(handle.sequence().unwrap(), 0);
        assert_eq!(handle.receipts().unwrap().len(), 1);
    }

    /// Storage that refuses every commit
    #[derive(Debug)]
    struct FailingStorage;

    impl ReceiptStorage for FailingStorage {
        fn get_receipt(&self, _: &Address, _: u64) -> Result<Option<Receipt>, StorageError> {
            Ok(None)
        }

        fn receipts_for(&self, _: &Address) -> Box<dyn ReceiptIterator + '_> {
            Box::new(crate::storage_traits::CollectedIter::new(Vec::new()))
        }
    }

    impl LedgerStorage for FailingStorage {
        fn load(&self, _: &Address) -> Result<Option<LedgerSnapshot>, StorageError> {
            Ok(None)
        }

        fn commit(&self, _: &LedgerSnapshot, _: &Receipt) -> Result<(), StorageError> {
            Err(StorageError::Database("disk full".to_string()))
        }

        fn scan(&self) -> Box<dyn LedgerSnapshotIterator + '_> {
            Box::new(crate::storage_traits::CollectedIter::new(Vec::new()))
        }

        fn delete(&self, _: &Address) -> Result<bool, StorageError> {
            Ok(false)
        }
    }

    #[test]
    fn test_failed_commit_does_not_publish() {
        let manager = unique_address();
        let (certificate, _) = Certificate::create(
            unique_address(),
            manager,
            "grain",
            10,
            "t",
            LedgerConfig::default(),
        )
        .unwrap();
        let handle = CertificateHandle::new(certificate, Arc::new(FailingStorage));

        let result = handle.add_inventory(&manager, 5);
        assert!(matches!(result, Err(LedgerError::Storage(_))));
        assert_eq!(handle.margin().unwrap(), 10);
        assert_eq!(handle.sequence().unwrap(), 0);
    }

    #[test]
    fn test_overflowing_merge_keeps_ledger_usable() {
        let storage: Arc<dyn LedgerStorage> = Arc::new(MemoryStorage::new());
        let manager = unique_address();
        let (certificate, created) = Certificate::create(
            unique_address(),
            manager,
            "grain",
            u64::MAX,
            "t",
            LedgerConfig::default(),
        )
        .unwrap();
        storage.commit(&certificate.snapshot(), &created).unwrap();
        let handle = CertificateHandle::new(certificate, storage);
        let alice = unique_address();
        let bob = unique_address();

        let (full, _) = handle.award_item(&manager, &alice, u64::MAX).unwrap();
        handle.add_inventory(&manager, 1).unwrap();
        handle.award_item(&manager, &bob, 1).unwrap();

        let result = handle.transfer(&alice, full, u64::MAX, &bob);
        assert!(matches!(result, Err(LedgerError::InvalidQuantity { .. })));

        assert_eq!(handle.get_amount(full).unwrap(), u64::MAX);
        assert_eq!(handle.balance_of(&bob).unwrap(), 1);
        assert_eq!(handle.sequence().unwrap(), 3);
        handle.write_off(&alice, full, 1).unwrap();
    }

    #[test]
    fn test_concurrent_awards_are_serialized() {
        let storage: Arc<dyn LedgerStorage> = Arc::new(MemoryStorage::new());
        let (handle, manager) = handle_on(storage.clone());

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let handle = handle.clone();
                thread::spawn(move || {
                    let holder = unique_address();
                    for _ in 0..5 {
                        handle.award_item(&manager, &holder, 1).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(handle.margin().unwrap(), 80);
        assert_eq!(handle.token_count().unwrap(), 20);
        assert_eq!(handle.sequence().unwrap(), 20);
        assert_eq!(handle.receipts().unwrap().len(), 21);
        handle.check_conservation().unwrap();
    }
}
