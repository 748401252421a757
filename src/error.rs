use crate::id::Address;
use crate::token::TokenId;
use std::io;
use thiserror::Error;

/// Represents all possible errors that can occur when persisting ledger state
#[derive(Error, Debug)]
pub enum StorageError {
    /// IO errors that occur when reading/writing files
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Database errors that occur with the underlying storage backend
    #[error("Database error: {0}")]
    Database(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Errors related to missing or invalid data
    #[error("Not found: {0}")]
    NotFound(String),

    /// Errors that occur during append-only log operations
    #[error("Write-ahead log error: {0}")]
    WAL(String),

    /// Generic errors that don't fit in other categories
    #[error("Other error: {0}")]
    Other(String),

    /// Anyhow error wrapper for error context
    #[error(transparent)]
    Context(#[from] anyhow::Error),
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

#[cfg(feature = "rocksdb")]
impl From<rocksdb::Error> for StorageError {
    fn from(err: rocksdb::Error) -> Self {
        StorageError::Database(err.to_string())
    }
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StorageError::NotFound("Row not found".to_string()),
            _ => StorageError::Database(err.to_string()),
        }
    }
}

impl From<String> for StorageError {
    fn from(err: String) -> Self {
        StorageError::Other(err)
    }
}

impl From<&str> for StorageError {
    fn from(err: &str) -> Self {
        StorageError::Other(err.to_string())
    }
}

/// Errors returned by certificate ledger and factory operations.
///
/// A failed operation never leaves a partially applied effect behind.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Zero quantity, or more than the available token balance or margin
    #[error("Invalid quantity {requested}: {reason}")]
    InvalidQuantity { requested: u64, reason: String },

    #[error("Unknown token {0}")]
    UnknownToken(TokenId),

    /// Any operation on a certificate after `destroy`
    #[error("Certificate {0} has been destroyed")]
    LedgerDestroyed(Address),

    #[error("{caller} is not permitted to {action}")]
    Unauthorized { caller: Address, action: String },

    /// Zero address, or a transfer back to the current owner
    #[error("Invalid recipient {0}")]
    InvalidRecipient(Address),

    /// Rejected factory input (e.g. an empty certificate name)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unknown certificate {0}")]
    UnknownCertificate(Address),

    /// A ledger mutex was poisoned by a panicking writer
    #[error("Lock error: {0}")]
    Lock(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl LedgerError {
    pub(crate) fn invalid_quantity(requested: u64, reason: impl Into<String>) -> Self {
        LedgerError::InvalidQuantity {
            requested,
            reason: reason.into(),
        }
    }
}
