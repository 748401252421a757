use crate::commitment::StateCommitment;
use crate::id::Address;
use crate::token::TokenId;
use serde::{Deserialize, Serialize};

/// Record of a single state change, emitted for external auditing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEvent {
    /// A certificate was created with its whole quantity in margin
    CertificateCreated {
        certificate: Address,
        manager: Address,
        name: String,
        unit: String,
        total_quantity: u64,
    },

    /// Quantity moved out of the margin into a fresh token
    Awarded {
        token_id: TokenId,
        recipient: Address,
        amount: u64,
        /// Margin after the award
        margin: u64,
    },

    /// Partial transfer minted a new token for the recipient
    Split {
        source: TokenId,
        new_token: TokenId,
        from: Address,
        to: Address,
        amount: u64,
    },

    /// Full transfer credited a token the recipient already held
    Merged {
        source: TokenId,
        target: TokenId,
        from: Address,
        to: Address,
        amount: u64,
    },

    /// Full transfer handed the token itself to the recipient
    Reassigned {
        token_id: TokenId,
        from: Address,
        to: Address,
        amount: u64,
    },

    /// Quantity consumed and removed from circulation
    WrittenOff {
        token_id: TokenId,
        owner: Address,
        amount: u64,
        remaining: u64,
    },

    InventoryAdded {
        amount: u64,
        /// Margin after the replenishment
        margin: u64,
    },

    Destroyed {
        certificate: Address,
    },
}

impl LedgerEvent {
    /// Short snake_case name of the event
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerEvent::CertificateCreated { .. } => "certificate_created",
            LedgerEvent::Awarded { .. } => "awarded",
            LedgerEvent::Split { .. } => "split",
            LedgerEvent::Merged { .. } => "merged",
            LedgerEvent::Reassigned { .. } => "reassigned",
            LedgerEvent::WrittenOff { .. } => "written_off",
            LedgerEvent::InventoryAdded { .. } => "inventory_added",
            LedgerEvent::Destroyed { .. } => "destroyed",
        }
    }

    /// Token ids this event touches
    pub fn token_ids(&self) -> Vec<TokenId> {
        match self {
            LedgerEvent::Awarded { token_id, .. }
            | LedgerEvent::Reassigned { token_id, .. }
            | LedgerEvent::WrittenOff { token_id, .. } => vec![*token_id],
            LedgerEvent::Split {
                source, new_token, ..
            } => vec![*source, *new_token],
            LedgerEvent::Merged { source, target, .. } => vec![*source, *target],
            LedgerEvent::CertificateCreated { .. }
            | LedgerEvent::InventoryAdded { .. }
            | LedgerEvent::Destroyed { .. } => Vec::new(),
        }
    }
}

/// Append-only audit record of one successful operation on a certificate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// The certificate the operation ran against
    pub certificate: Address,

    /// Position in the certificate's audit log; creation is sequence 0
    pub sequence: u64,

    /// Unix timestamp in milliseconds
    pub timestamp_ms: i64,

    /// Who issued the operation
    pub caller: Address,

    pub events: Vec<LedgerEvent>,

    /// Commitment to the ledger state after the operation, chained to the previous one
    pub commitment: StateCommitment,
}

impl Receipt {
    /// Check whether this receipt touched the given token
    pub fn touches(&self, token_id: TokenId) -> bool {
        self.events
            .iter()
            .any(|event| event.token_ids().contains(&token_id))
    }
}
