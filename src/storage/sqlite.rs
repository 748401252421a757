#![cfg(feature = "sqlite")]

use crate::certificate::LedgerSnapshot;
use crate::commitment::StateCommitment;
use crate::config::LedgerConfig;
use crate::error::StorageError;
use crate::events::Receipt;
use crate::id::Address;
use crate::storage_traits::{
    check_continuity, CollectedIter, LedgerSnapshotIterator, LedgerStorage, ReceiptIterator,
    ReceiptStorage,
};
use crate::token::{AssetDescriptor, Token, TokenId};
use log::debug;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow},
    Row,
};
use std::{
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};
use tokio::runtime::Runtime;

/// A SQLite-based implementation of the LedgerStorage interface using sqlx.
///
/// Snapshots are normalized into a `certificates` row plus one `tokens` row
/// per live token. Receipts are kept as `bincode` blobs keyed by
/// (certificate, sequence).
pub struct SqliteStorage {
    pool: SqlitePool,
    rt: Arc<Runtime>,
    db_path: PathBuf,
}

impl SqliteStorage {
    /// Creates a new SQLite storage instance
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db_path = path.as_ref().to_path_buf();
        let db_url = format!("sqlite:{}", db_path.to_string_lossy());

        // Create a runtime for async operations
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map(Arc::new)
            .map_err(|e| StorageError::Database(format!("Failed to create runtime: {}", e)))?;

        let options = SqliteConnectOptions::from_str(&db_url)
            .map_err(|e| StorageError::Database(format!("Invalid database URL: {}", e)))?
            .create_if_missing(true);

        let pool = rt.block_on(async {
            SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(options)
                .await
        })?;

        rt.block_on(Self::initialize_schema(&pool))?;

        debug!("Opened sqlite ledger store at {}", db_path.display());
        Ok(Self { pool, rt, db_path })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Creates the necessary tables in the database
    async fn initialize_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS certificates (
                address BLOB PRIMARY KEY,
                manager BLOB NOT NULL,
                config TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                commitment BLOB NOT NULL,
                destroyed INTEGER NOT NULL,
                name TEXT,
                unit TEXT,
                total_quantity INTEGER,
                margin INTEGER NOT NULL,
                written_off INTEGER NOT NULL,
                inventory_added INTEGER NOT NULL,
                next_token_id INTEGER NOT NULL
            )",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tokens (
                certificate BLOB NOT NULL,
                token_id INTEGER NOT NULL,
                owner BLOB NOT NULL,
                amount INTEGER NOT NULL,
                PRIMARY KEY (certificate, token_id)
            )",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS receipts (
                certificate BLOB NOT NULL,
                sequence INTEGER NOT NULL,
                timestamp INTEGER NOT NULL,
                receipt_data BLOB NOT NULL,
                PRIMARY KEY (certificate, sequence)
            )",
        )
        .execute(pool)
        .await?;

        // Create an index for owner-based queries
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tokens_owner ON tokens(owner)")
            .execute(pool)
            .await?;

        Ok(())
    }

    async fn load_snapshot(&self, address: &Address) -> Result<Option<LedgerSnapshot>, StorageError> {
        let row = sqlx::query(
            "SELECT address, manager, config, sequence, commitment, destroyed, name, unit,
                    total_quantity, margin, written_off, inventory_added, next_token_id
             FROM certificates WHERE address = ?",
        )
        .bind(address.bytes().to_vec())
        .fetch_optional(&self.pool)
        .await?;

        let row = match row {
            Some(row) => row,
            None => return Ok(None),
        };

        let token_rows = sqlx::query(
            "SELECT token_id, owner, amount FROM tokens WHERE certificate = ? ORDER BY token_id",
        )
        .bind(address.bytes().to_vec())
        .fetch_all(&self.pool)
        .await?;

        let tokens = token_rows
            .iter()
            .map(|row| -> Result<Token, StorageError> {
                Ok(Token::new(
                    TokenId(to_u64(row.try_get("token_id")?)?),
                    decode_address(row.try_get("owner")?)?,
                    to_u64(row.try_get("amount")?)?,
                ))
            })
            .collect::<Result<Vec<_>, StorageError>>()?;

        Ok(Some(Self::decode_certificate(&row, tokens)?))
    }

    fn decode_certificate(row: &SqliteRow, tokens: Vec<Token>) -> Result<LedgerSnapshot, StorageError> {
        let config: String = row.try_get("config")?;
        let config: LedgerConfig = serde_json::from_str(&config)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        let commitment: Vec<u8> = row.try_get("commitment")?;
        let commitment: [u8; 32] = commitment.try_into().map_err(|_| {
            StorageError::Serialization("Commitment must be 32 bytes".to_string())
        })?;

        let name: Option<String> = row.try_get("name")?;
        let unit: Option<String> = row.try_get("unit")?;
        let total_quantity: Option<i64> = row.try_get("total_quantity")?;
        let asset = match (name, unit, total_quantity) {
            (Some(name), Some(unit), Some(total_quantity)) => Some(AssetDescriptor {
                name,
                unit,
                total_quantity: to_u64(total_quantity)?,
            }),
            _ => None,
        };

        Ok(LedgerSnapshot {
            address: decode_address(row.try_get("address")?)?,
            manager: decode_address(row.try_get("manager")?)?,
            config,
            sequence: to_u64(row.try_get("sequence")?)?,
            commitment: StateCommitment(commitment),
            destroyed: row.try_get("destroyed")?,
            asset,
            margin: to_u64(row.try_get("margin")?)?,
            written_off: to_u64(row.try_get("written_off")?)?,
            inventory_added: to_u64(row.try_get("inventory_added")?)?,
            next_token_id: to_u64(row.try_get("next_token_id")?)?,
            tokens,
        })
    }

    async fn commit_snapshot(
        &self,
        snapshot: &LedgerSnapshot,
        receipt: &Receipt,
    ) -> Result<(), StorageError> {
        let address = snapshot.address.bytes().to_vec();
        let config = serde_json::to_string(&snapshot.config)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let receipt_data = bincode::serialize(receipt)?;

        let mut tx = self.pool.begin().await?;

        let previous: Option<i64> =
            sqlx::query_scalar("SELECT sequence FROM certificates WHERE address = ?")
                .bind(address.clone())
                .fetch_optional(&mut *tx)
                .await?;
        let previous = previous.map(to_u64).transpose()?;
        check_continuity(previous, snapshot, receipt)?;

        sqlx::query(
            "INSERT OR REPLACE INTO certificates (
                address, manager, config, sequence, commitment, destroyed, name, unit,
                total_quantity, margin, written_off, inventory_added, next_token_id
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(address.clone())
        .bind(snapshot.manager.bytes().to_vec())
        .bind(config)
        .bind(to_i64(snapshot.sequence)?)
        .bind(snapshot.commitment.0.to_vec())
        .bind(snapshot.destroyed)
        .bind(snapshot.asset.as_ref().map(|asset| asset.name.clone()))
        .bind(snapshot.asset.as_ref().map(|asset| asset.unit.clone()))
        .bind(
            snapshot
                .asset
                .as_ref()
                .map(|asset| to_i64(asset.total_quantity))
                .transpose()?,
        )
        .bind(to_i64(snapshot.margin)?)
        .bind(to_i64(snapshot.written_off)?)
        .bind(to_i64(snapshot.inventory_added)?)
        .bind(to_i64(snapshot.next_token_id)?)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM tokens WHERE certificate = ?")
            .bind(address.clone())
            .execute(&mut *tx)
            .await?;

        for token in &snapshot.tokens {
            sqlx::query(
                "INSERT INTO tokens (certificate, token_id, owner, amount) VALUES (?, ?, ?, ?)",
            )
            .bind(address.clone())
            .bind(to_i64(token.id.0)?)
            .bind(token.owner.bytes().to_vec())
            .bind(to_i64(token.amount)?)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "INSERT INTO receipts (certificate, sequence, timestamp, receipt_data)
             VALUES (?, ?, ?, ?)",
        )
        .bind(address)
        .bind(to_i64(receipt.sequence)?)
        .bind(receipt.timestamp_ms)
        .bind(receipt_data)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn fetch_receipts(&self, certificate: &Address) -> Result<Vec<Receipt>, StorageError> {
        let rows = sqlx::query(
            "SELECT receipt_data FROM receipts WHERE certificate = ? ORDER BY sequence ASC",
        )
        .bind(certificate.bytes().to_vec())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<Receipt, StorageError> {
                let data: Vec<u8> = row.try_get("receipt_data")?;
                Ok(bincode::deserialize(&data)?)
            })
            .collect()
    }

    async fn fetch_addresses(&self) -> Result<Vec<Address>, StorageError> {
        let rows = sqlx::query("SELECT address FROM certificates ORDER BY address")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> Result<Address, StorageError> { decode_address(row.try_get("address")?) })
            .collect()
    }

    async fn delete_certificate(&self, certificate: &Address) -> Result<bool, StorageError> {
        let address = certificate.bytes().to_vec();
        let mut tx = self.pool.begin().await?;

        let removed = sqlx::query("DELETE FROM certificates WHERE address = ?")
            .bind(address.clone())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM tokens WHERE certificate = ?")
            .bind(address.clone())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM receipts WHERE certificate = ?")
            .bind(address)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(removed > 0)
    }
}

fn to_i64(value: u64) -> Result<i64, StorageError> {
    i64::try_from(value)
        .map_err(|_| StorageError::Serialization(format!("{} does not fit in an INTEGER", value)))
}

fn to_u64(value: i64) -> Result<u64, StorageError> {
    u64::try_from(value)
        .map_err(|_| StorageError::Serialization(format!("Negative quantity {}", value)))
}

fn decode_address(bytes: Vec<u8>) -> Result<Address, StorageError> {
    Address::from_slice(&bytes)
        .ok_or_else(|| StorageError::Serialization("Address must be 32 bytes".to_string()))
}

impl ReceiptStorage for SqliteStorage {
    fn get_receipt(
        &self,
        certificate: &Address,
        sequence: u64,
    ) -> Result<Option<Receipt>, StorageError> {
        let sequence = to_i64(sequence)?;
        let data: Option<Vec<u8>> = self.rt.block_on(async {
            sqlx::query_scalar(
                "SELECT receipt_data FROM receipts WHERE certificate = ? AND sequence = ?",
            )
            .bind(certificate.bytes().to_vec())
            .bind(sequence)
            .fetch_optional(&self.pool)
            .await
        })?;

        match data {
            Some(data) => Ok(Some(bincode::deserialize(&data)?)),
            None => Ok(None),
        }
    }

    fn receipts_for(&self, certificate: &Address) -> Box<dyn ReceiptIterator + '_> {
        match self.rt.block_on(self.fetch_receipts(certificate)) {
            Ok(receipts) => Box::new(CollectedIter::new(receipts.into_iter().map(Ok).collect())),
            Err(e) => Box::new(CollectedIter::failed(e)),
        }
    }
}

impl LedgerStorage for SqliteStorage {
    fn load(&self, certificate: &Address) -> Result<Option<LedgerSnapshot>, StorageError> {
        self.rt.block_on(self.load_snapshot(certificate))
    }

    fn commit(&self, snapshot: &LedgerSnapshot, receipt: &Receipt) -> Result<(), StorageError> {
        self.rt.block_on(self.commit_snapshot(snapshot, receipt))
    }

    fn scan(&self) -> Box<dyn LedgerSnapshotIterator + '_> {
        let addresses = match self.rt.block_on(self.fetch_addresses()) {
            Ok(addresses) => addresses,
            Err(e) => return Box::new(CollectedIter::failed(e)),
        };

        let snapshots: Vec<Result<LedgerSnapshot, StorageError>> = addresses
            .iter()
            .filter_map(|address| self.load(address).transpose())
            .collect();
        Box::new(CollectedIter::new(snapshots))
    }

    fn delete(&self, certificate: &Address) -> Result<bool, StorageError> {
        self.rt.block_on(self.delete_certificate(certificate))
    }
}

impl std::fmt::Debug for SqliteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStorage")
            .field("db_path", &self.db_path)
            .finish()
    }
}
