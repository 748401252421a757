use crate::access::{AccessPolicy, IssuerPolicy};
use crate::certificate::{Certificate, LedgerResult};
use crate::config::FactoryConfig;
use crate::error::LedgerError;
use crate::events::Receipt;
use crate::handle::CertificateHandle;
use crate::id::Address;
use crate::storage::open_storage;
use crate::storage_traits::LedgerStorage;
use log::{debug, info};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Creates certificate ledgers and keeps track of them.
///
/// Each certificate address is derived from the factory address and a
/// creation nonce, so a factory reopened over the same storage keeps handing
/// out fresh, non-colliding addresses.
pub struct CertificateFactory {
    address: Address,
    config: FactoryConfig,
    storage: Arc<dyn LedgerStorage>,
    policy: Arc<dyn AccessPolicy>,
    nonce: u64,
    registry: BTreeMap<Address, CertificateHandle>,
}

impl CertificateFactory {
    /// Open the storage named by `config` and restore every ledger in it
    pub fn new(config: FactoryConfig) -> LedgerResult<Self> {
        let storage = open_storage(&config.storage)?;
        Self::open(config, storage)
    }

    /// Restore a factory over an already opened storage backend
    pub fn open(config: FactoryConfig, storage: Arc<dyn LedgerStorage>) -> LedgerResult<Self> {
        Self::open_with_policy(config, storage, Arc::new(IssuerPolicy))
    }

    /// Restore a factory whose ledgers all use `policy` for access checks
    ///
    /// # Parameters
    /// * `config` - Factory configuration; `config.storage` is ignored
    /// * `storage` - Backend holding ledger snapshots and receipts
    /// * `policy` - Access policy for restored and newly created ledgers
    pub fn open_with_policy(
        config: FactoryConfig,
        storage: Arc<dyn LedgerStorage>,
        policy: Arc<dyn AccessPolicy>,
    ) -> LedgerResult<Self> {
        let address = Address::from_label(&config.label);

        let mut registry = BTreeMap::new();
        for snapshot in storage.scan() {
            let certificate = Certificate::from_snapshot(snapshot?, policy.clone())?;
            registry.insert(
                *certificate.address(),
                CertificateHandle::new(certificate, storage.clone()),
            );
        }

        let mut factory = Self {
            address,
            config,
            storage,
            policy,
            nonce: 0,
            registry,
        };
        factory.nonce = factory.next_free_nonce(0)?.0;

        debug!(
            "Opened factory {} with {} certificates, nonce {}",
            factory.address,
            factory.registry.len(),
            factory.nonce
        );
        Ok(factory)
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn config(&self) -> &FactoryConfig {
        &self.config
    }

    /// Create a new certificate ledger with `caller` as its manager.
    ///
    /// # Parameters
    /// * `caller` - The identity creating the certificate; becomes its manager
    /// * `name` - Asset name; must not be blank
    /// * `total_quantity` - Authorized quantity, placed entirely into margin
    /// * `unit` - Display label of one unit
    ///
    /// # Returns
    /// A handle to the new ledger and its creation receipt (sequence 0)
    pub fn create_certificate(
        &mut self,
        caller: &Address,
        name: &str,
        total_quantity: u64,
        unit: &str,
    ) -> LedgerResult<(CertificateHandle, Receipt)> {
        let (nonce, address) = self.next_free_nonce(self.nonce)?;

        let (certificate, receipt) = Certificate::create(
            address,
            *caller,
            name,
            total_quantity,
            unit,
            self.config.ledger.clone(),
        )?;
        let certificate = certificate.with_policy(self.policy.clone());

        self.storage.commit(&certificate.snapshot(), &receipt)?;

        let handle = CertificateHandle::new(certificate, self.storage.clone());
        self.registry.insert(address, handle.clone());
        self.nonce = nonce + 1;

        info!(
            "Factory {} registered certificate {} (nonce {})",
            self.address, address, nonce
        );
        Ok((handle, receipt))
    }

    /// Look up a certificate created by (or restored into) this factory
    pub fn certificate(&self, address: &Address) -> LedgerResult<CertificateHandle> {
        self.registry
            .get(address)
            .cloned()
            .ok_or(LedgerError::UnknownCertificate(*address))
    }

    /// Addresses of all registered certificates, destroyed ones included
    pub fn certificates(&self) -> Vec<Address> {
        self.registry.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// First nonce at or after `start` whose derived address is unused
    fn next_free_nonce(&self, start: u64) -> LedgerResult<(u64, Address)> {
        let mut nonce = start;
        loop {
            let address = Address::derive_certificate(&self.address, nonce).ok_or_else(|| {
                LedgerError::InvalidInput(format!("no certificate address for nonce {}", nonce))
            })?;
            if !self.registry.contains_key(&address) {
                return Ok((nonce, address));
            }
            nonce = nonce.checked_add(1).ok_or_else(|| {
                LedgerError::InvalidInput("certificate nonce exhausted".to_string())
            })?;
        }
    }
}

impl std::fmt::Debug for CertificateFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateFactory")
            .field("address", &self.address)
            .field("nonce", &self.nonce)
            .field("certificates", &self.registry.len())
            .field("storage", &self.storage)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::OpenPolicy;
    use crate::certificate::TransferOutcome;
    use crate::config::StorageConfig;
    use crate::events::LedgerEvent;
    use crate::id::tests::unique_address;
    use crate::storage::{FileStorage, MemoryStorage};
    use crate::verification::{verify_snapshot, VerificationResult};
    use tempfile::tempdir;

    fn memory_factory() -> CertificateFactory {
        CertificateFactory::new(FactoryConfig::default()).unwrap()
    }

    #[test]
    fn test_bottle_scenario() {
        let mut factory = memory_factory();
        let manager = unique_address();
        let alice = unique_address();
        let bob = unique_address();

        let (certificate, created) = factory
            .create_certificate(&manager, "82年飞天茅台", 100, "瓶")
            .unwrap();
        assert_eq!(created.sequence, 0);
        assert_eq!(created.events[0].kind(), "certificate_created");
        assert_eq!(certificate.name().unwrap(), "82年飞天茅台");
        assert_eq!(certificate.unit().unwrap(), "瓶");
        assert_eq!(certificate.margin().unwrap(), 100);

        // Award 3 to A
        let (token_a, _) = certificate.award_item(&manager, &alice, 3).unwrap();
        assert_eq!(certificate.get_amount(token_a).unwrap(), 3);
        assert_eq!(certificate.margin().unwrap(), 97);

        // Transfer 1 to B: split into a new token
        let (outcome, receipt) = certificate.transfer(&alice, token_a, 1, &bob).unwrap();
        let token_b = match outcome {
            TransferOutcome::Split(id) => id,
            other => panic!("expected a split, got {:?}", other),
        };
        assert!(matches!(
            receipt.events[0],
            LedgerEvent::Split { new_token, .. } if new_token == token_b
        ));
        assert_eq!(certificate.get_amount(token_a).unwrap(), 2);
        assert_eq!(certificate.get_amount(token_b).unwrap(), 1);
        assert_eq!(certificate.owner_of(token_b).unwrap(), bob);

        // Transfer the remaining 2 to B: merged into B's token
        let (outcome, _) = certificate.transfer(&alice, token_a, 2, &bob).unwrap();
        assert_eq!(outcome, TransferOutcome::Merged(token_b));
        assert_eq!(certificate.get_amount(token_a).unwrap(), 0);
        assert_eq!(certificate.get_amount(token_b).unwrap(), 3);

        // Write off 1, then 2
        certificate.write_off(&bob, token_b, 1).unwrap();
        assert_eq!(certificate.get_amount(token_b).unwrap(), 2);
        certificate.write_off(&bob, token_b, 2).unwrap();
        assert_eq!(certificate.get_amount(token_b).unwrap(), 0);

        // Replenish the margin
        let margin = certificate.margin().unwrap();
        certificate.add_inventory(&manager, 2).unwrap();
        assert_eq!(certificate.margin().unwrap(), margin + 2);
        certificate.check_conservation().unwrap();

        // The persisted audit log reproduces the live state
        let receipts = certificate.receipts().unwrap();
        assert_eq!(receipts.len(), 7);
        let snapshot = certificate.snapshot().unwrap();
        assert_eq!(verify_snapshot(&snapshot, &receipts), VerificationResult::Valid);

        // Destroy
        certificate.destroy(&manager).unwrap();
        assert!(certificate.is_destroyed().unwrap());
        assert!(matches!(
            certificate.name(),
            Err(LedgerError::LedgerDestroyed(address)) if address == *certificate.address()
        ));
    }

    #[test]
    fn test_creator_becomes_manager() {
        let mut factory = memory_factory();
        let creator = unique_address();
        let stranger = unique_address();

        let (certificate, _) = factory
            .create_certificate(&creator, "grain", 10, "t")
            .unwrap();
        assert_eq!(certificate.manager().unwrap(), creator);

        let result = certificate.award_item(&stranger, &stranger, 1);
        assert!(matches!(result, Err(LedgerError::Unauthorized { .. })));
    }

    #[test]
    fn test_blank_name_is_rejected() {
        let mut factory = memory_factory();
        let result = factory.create_certificate(&unique_address(), "  ", 10, "t");
        assert!(matches!(result, Err(LedgerError::InvalidInput(_))));
        assert!(factory.is_empty());
    }

    #[test]
    fn test_addresses_are_distinct_and_registered() {
        let mut factory = memory_factory();
        let creator = unique_address();

        let (first, _) = factory.create_certificate(&creator, "a", 1, "u").unwrap();
        let (second, _) = factory.create_certificate(&creator, "b", 1, "u").unwrap();
        assert_ne!(first.address(), second.address());
        assert!(Address::is_off_curve(first.address()));

        assert_eq!(factory.len(), 2);
        assert_eq!(factory.certificates().len(), 2);
        assert_eq!(
            factory.certificate(second.address()).unwrap().name().unwrap(),
            "b"
        );

        let missing = unique_address();
        assert!(matches!(
            factory.certificate(&missing),
            Err(LedgerError::UnknownCertificate(address)) if address == missing
        ));
    }

    #[test]
    fn test_handles_share_state() {
        let mut factory = memory_factory();
        let manager = unique_address();
        let (certificate, _) = factory
            .create_certificate(&manager, "grain", 10, "t")
            .unwrap();

        let looked_up = factory.certificate(certificate.address()).unwrap();
        certificate.add_inventory(&manager, 5).unwrap();
        assert_eq!(looked_up.margin().unwrap(), 15);
    }

    #[test]
    fn test_reopen_restores_ledgers_and_nonce() {
        let temp_dir = tempdir().unwrap();
        let config = FactoryConfig {
            storage: StorageConfig::File {
                path: temp_dir.path().join("ledger.log"),
            },
            ..FactoryConfig::default()
        };
        let manager = unique_address();
        let alice = unique_address();

        let (address, token) = {
            let mut factory = CertificateFactory::new(config.clone()).unwrap();
            let (certificate, _) = factory
                .create_certificate(&manager, "82年飞天茅台", 100, "瓶")
                .unwrap();
            let (token, _) = certificate.award_item(&manager, &alice, 3).unwrap();
            (*certificate.address(), token)
        };

        let mut factory = CertificateFactory::new(config).unwrap();
        assert_eq!(factory.len(), 1);
        let certificate = factory.certificate(&address).unwrap();
        assert_eq!(certificate.get_amount(token).unwrap(), 3);
        assert_eq!(certificate.margin().unwrap(), 97);

        // Operations continue the persisted receipt chain
        let receipt = certificate.write_off(&alice, token, 1).unwrap();
        assert_eq!(receipt.sequence, 2);

        // A new certificate does not collide with the restored one
        let (other, _) = factory
            .create_certificate(&manager, "grain", 10, "t")
            .unwrap();
        assert_ne!(other.address(), &address);
        assert_eq!(factory.len(), 2);
    }

    #[test]
    fn test_policy_applies_to_created_certificates() {
        let storage: Arc<dyn LedgerStorage> = Arc::new(MemoryStorage::new());
        let mut factory = CertificateFactory::open_with_policy(
            FactoryConfig::default(),
            storage,
            Arc::new(OpenPolicy),
        )
        .unwrap();

        let (certificate, _) = factory
            .create_certificate(&unique_address(), "grain", 10, "t")
            .unwrap();
        let anyone = unique_address();
        certificate.award_item(&anyone, &anyone, 1).unwrap();
        assert_eq!(certificate.balance_of(&anyone).unwrap(), 1);
    }

    #[test]
    fn test_open_over_existing_storage() {
        let temp_dir = tempdir().unwrap();
        let storage: Arc<dyn LedgerStorage> =
            Arc::new(FileStorage::open(temp_dir.path().join("ledger.log")).unwrap());

        let address = {
            let mut factory =
                CertificateFactory::open(FactoryConfig::default(), storage.clone()).unwrap();
            let (certificate, _) = factory
                .create_certificate(&unique_address(), "grain", 10, "t")
                .unwrap();
            *certificate.address()
        };

        let factory = CertificateFactory::open(FactoryConfig::default(), storage).unwrap();
        assert_eq!(factory.certificates(), vec![address]);
    }
}
