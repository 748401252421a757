use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Whether `add_inventory` may raise the margin beyond the authorized quantity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InventoryPolicy {
    /// Margin grows by any amount; replenished quantity is tracked separately
    #[default]
    Replenishable,

    /// Live tokens plus margin may never exceed the authorized quantity
    CappedAtAuthorized,
}

/// What a transfer of a token's whole quantity does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FullTransferPolicy {
    /// Credit the recipient's existing token and leave the source as an empty shell.
    /// Falls back to `Reassign` when the recipient holds no token.
    #[default]
    MergeIntoExisting,

    /// Hand the source token itself over to the recipient
    Reassign,
}

/// Per-certificate behaviour
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Prefix of every token URI
    pub base_uri: String,

    pub inventory_policy: InventoryPolicy,

    pub full_transfer_policy: FullTransferPolicy,
}

/// Where ledger snapshots and receipts are persisted
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageConfig {
    #[default]
    Memory,
    File {
        path: PathBuf,
    },
    Sqlite {
        path: PathBuf,
    },
    RocksDb {
        path: PathBuf,
    },
}

/// Top-level configuration of a certificate factory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FactoryConfig {
    /// Seed of the factory address; certificate addresses derive from it
    pub label: String,

    /// Defaults applied to every certificate the factory creates
    pub ledger: LedgerConfig,

    pub storage: StorageConfig,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            label: "units-certificate-factory".to_string(),
            ledger: LedgerConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl FactoryConfig {
    /// Parse a configuration from a JSON document; missing fields take defaults
    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json).context("Failed to parse factory configuration")
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path.display()))?;
        Self::from_json_str(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = FactoryConfig::from_json_str("{}").unwrap();
        assert_eq!(config, FactoryConfig::default());
        assert_eq!(config.ledger.inventory_policy, InventoryPolicy::Replenishable);
        assert_eq!(
            config.ledger.full_transfer_policy,
            FullTransferPolicy::MergeIntoExisting
        );
        assert_eq!(config.storage, StorageConfig::Memory);
    }

    #[test]
    fn test_parse_full_config() {
        let json = r#"{
            "label": "winery",
            "ledger": {
                "base_uri": "https://certs.example/",
                "inventory_policy": "capped_at_authorized",
                "full_transfer_policy": "reassign"
            },
            "storage": { "backend": "sqlite", "path": "/tmp/ledger.db" }
        }"#;

        let config = FactoryConfig::from_json_str(json).unwrap();
        assert_eq!(config.label, "winery");
        assert_eq!(config.ledger.base_uri, "https://certs.example/");
        assert_eq!(config.ledger.inventory_policy, InventoryPolicy::CappedAtAuthorized);
        assert_eq!(config.ledger.full_transfer_policy, FullTransferPolicy::Reassign);
        assert_eq!(
            config.storage,
            StorageConfig::Sqlite {
                path: PathBuf::from("/tmp/ledger.db")
            }
        );
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"storage": {{"backend": "file", "path": "audit.log"}}}}"#).unwrap();

        let config = FactoryConfig::from_file(file.path()).unwrap();
        assert_eq!(
            config.storage,
            StorageConfig::File {
                path: PathBuf::from("audit.log")
            }
        );
    }

    #[test]
    fn test_rejects_unknown_policy() {
        let json = r#"{"ledger": {"inventory_policy": "sometimes"}}"#;
        assert!(FactoryConfig::from_json_str(json).is_err());
    }
}
