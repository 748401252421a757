pub mod access;
pub mod certificate;
pub mod commitment;
pub mod config;
pub mod error;
pub mod events;
pub mod factory;
pub mod handle;
pub mod id;
pub mod storage;
pub mod storage_traits;
pub mod token;
pub mod verification;

// Re-export the main types for convenience
pub use access::{AccessPolicy, Action, IssuerPolicy, OpenPolicy};
pub use certificate::{Certificate, LedgerResult, LedgerSnapshot, TransferOutcome};
pub use commitment::{LedgerDigest, StateCommitment};
pub use config::{FactoryConfig, FullTransferPolicy, InventoryPolicy, LedgerConfig, StorageConfig};
pub use error::{LedgerError, StorageError};
pub use events::{LedgerEvent, Receipt};
pub use factory::CertificateFactory;
pub use handle::CertificateHandle;
pub use id::Address;
pub use token::{AssetDescriptor, Token, TokenId, TokenInfo};
pub use verification::{replay, verify_receipts, verify_snapshot, VerificationResult};

pub use storage_traits::{
    CollectedIter,
    CommitRecord,
    LedgerSnapshotIterator,
    LedgerStorage,
    ReceiptIterator,
    ReceiptStorage,
};

// Re-export the storage implementations
pub use storage::{open_storage, FileStorage, MemoryStorage};

#[cfg(feature = "rocksdb")]
pub use storage::RocksDbStorage;

#[cfg(feature = "sqlite")]
pub use storage::SqliteStorage;
