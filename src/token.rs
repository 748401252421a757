use crate::id::Address;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Identifier of a token within one certificate ledger.
///
/// Assigned monotonically starting at 1 and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TokenId(pub u64);

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Describes the asset a certificate accounts for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetDescriptor {
    /// Display name of the asset, e.g. "82年飞天茅台"
    pub name: String,

    /// Unit label, e.g. "瓶"
    pub unit: String,

    /// Quantity authorized when the certificate was created
    pub total_quantity: u64,
}

/// An owned claim on a quantity of the certificate's asset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub id: TokenId,

    /// Exactly one owner at a time
    pub owner: Address,

    /// Remaining quantity; zero means the token is an inert shell
    pub amount: u64,
}

impl Token {
    pub fn new(id: TokenId, owner: Address, amount: u64) -> Self {
        Self { id, owner, amount }
    }
}

/// Read-only view of a token together with the asset it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
    pub token: Token,
    pub asset: Arc<AssetDescriptor>,
    pub uri: String,
}

impl TokenInfo {
    pub fn id(&self) -> TokenId {
        self.token.id
    }

    pub fn owner(&self) -> &Address {
        &self.token.owner
    }

    pub fn amount(&self) -> u64 {
        self.token.amount
    }
}
