use crate::access::{AccessPolicy, Action, IssuerPolicy};
use crate::commitment::{LedgerDigest, StateCommitment};
use crate::config::{FullTransferPolicy, InventoryPolicy, LedgerConfig};
use crate::error::LedgerError;
use crate::events::{LedgerEvent, Receipt};
use crate::id::Address;
use crate::token::{AssetDescriptor, Token, TokenId, TokenInfo};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Result type of certificate operations
pub type LedgerResult<T> = Result<T, LedgerError>;

/// What a transfer produced for the recipient
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferOutcome {
    /// Partial transfer; the recipient got a freshly minted token
    Split(TokenId),
    /// Full transfer credited to a token the recipient already held
    Merged(TokenId),
    /// Full transfer; the source token now belongs to the recipient
    Reassigned(TokenId),
}

impl TransferOutcome {
    /// The token now holding the transferred quantity for the recipient
    pub fn recipient_token(&self) -> TokenId {
        match self {
            TransferOutcome::Split(id)
            | TransferOutcome::Merged(id)
            | TransferOutcome::Reassigned(id) => *id,
        }
    }
}

/// Persisted form of a certificate ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub address: Address,
    pub manager: Address,
    pub config: LedgerConfig,

    /// Sequence of the last receipt applied
    pub sequence: u64,

    /// Commitment carried by that receipt
    pub commitment: StateCommitment,

    pub destroyed: bool,

    /// Asset metadata; `None` once destroyed
    pub asset: Option<AssetDescriptor>,

    pub margin: u64,
    pub written_off: u64,
    pub inventory_added: u64,
    pub next_token_id: u64,
    pub tokens: Vec<Token>,
}

/// Accounting state of a live certificate
#[derive(Debug, Clone)]
struct ActiveLedger {
    asset: Arc<AssetDescriptor>,
    margin: u64,
    written_off: u64,
    inventory_added: u64,
    next_token_id: u64,
    tokens: BTreeMap<TokenId, Token>,
}

impl ActiveLedger {
    fn token(&self, id: TokenId) -> LedgerResult<&Token> {
        self.tokens.get(&id).ok_or(LedgerError::UnknownToken(id))
    }

    fn circulating(&self) -> u128 {
        self.tokens.values().map(|token| u128::from(token.amount)).sum()
    }

    fn allocate_id(&mut self) -> TokenId {
        let id = TokenId(self.next_token_id);
        self.next_token_id += 1;
        id
    }

    /// Oldest token held by `owner`, if any
    fn first_token_of(&self, owner: &Address) -> Option<TokenId> {
        self.tokens
            .values()
            .find(|token| token.owner == *owner)
            .map(|token| token.id)
    }
}

#[derive(Debug, Clone)]
enum LedgerState {
    Active(ActiveLedger),
    Destroyed,
}

/// Quantity-accounting ledger for one asset.
///
/// All operations are all-or-nothing: inputs are validated against the current
/// state before anything is mutated. Every successful mutation returns a
/// [`Receipt`] carrying the emitted events and a chained state commitment.
#[derive(Debug, Clone)]
pub struct Certificate {
    address: Address,
    manager: Address,
    config: LedgerConfig,
    policy: Arc<dyn AccessPolicy>,
    sequence: u64,
    commitment: StateCommitment,
    state: LedgerState,
}

impl Certificate {
    /// Create a certificate with its whole quantity in margin.
    ///
    /// # Parameters
    /// * `address` - The address of the new certificate
    /// * `manager` - The identity administering the certificate
    /// * `name` - Asset name; must not be blank
    /// * `total_quantity` - Authorized quantity, placed entirely into margin
    /// * `unit` - Display label of one unit
    /// * `config` - Ledger behaviour
    ///
    /// # Returns
    /// The certificate and its creation receipt (sequence 0)
    pub fn create(
        address: Address,
        manager: Address,
        name: &str,
        total_quantity: u64,
        unit: &str,
        config: LedgerConfig,
    ) -> LedgerResult<(Self, Receipt)> {
        if name.trim().is_empty() {
            return Err(LedgerError::InvalidInput(
                "certificate name must not be empty".to_string(),
            ));
        }

        let asset = AssetDescriptor {
            name: name.to_string(),
            unit: unit.to_string(),
            total_quantity,
        };

        let mut certificate = Self {
            address,
            manager,
            config,
            policy: Arc::new(IssuerPolicy),
            sequence: 0,
            commitment: StateCommitment::default(),
            state: LedgerState::Active(ActiveLedger {
                asset: Arc::new(asset),
                margin: total_quantity,
                written_off: 0,
                inventory_added: 0,
                next_token_id: 1,
                tokens: BTreeMap::new(),
            }),
        };

        let event = LedgerEvent::CertificateCreated {
            certificate: address,
            manager,
            name: name.to_string(),
            unit: unit.to_string(),
            total_quantity,
        };
        certificate.commitment = certificate.digest().commit(&StateCommitment::default());
        let receipt = certificate.receipt(manager, vec![event]);

        info!(
            "Created certificate {} for {} {} of {}",
            address, total_quantity, unit, name
        );
        Ok((certificate, receipt))
    }

    /// Replace the access policy (defaults to [`IssuerPolicy`])
    pub fn with_policy(mut self, policy: Arc<dyn AccessPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Rebuild a certificate from its persisted snapshot
    pub fn from_snapshot(
        snapshot: LedgerSnapshot,
        policy: Arc<dyn AccessPolicy>,
    ) -> LedgerResult<Self> {
        let state = if snapshot.destroyed {
            LedgerState::Destroyed
        } else {
            let asset = snapshot.asset.ok_or_else(|| {
                LedgerError::InvalidInput(format!(
                    "snapshot of live certificate {} has no asset",
                    snapshot.address
                ))
            })?;
            let tokens = snapshot
                .tokens
                .into_iter()
                .map(|token| (token.id, token))
                .collect();
            LedgerState::Active(ActiveLedger {
                asset: Arc::new(asset),
                margin: snapshot.margin,
                written_off: snapshot.written_off,
                inventory_added: snapshot.inventory_added,
                next_token_id: snapshot.next_token_id,
                tokens,
            })
        };

        Ok(Self {
            address: snapshot.address,
            manager: snapshot.manager,
            config: snapshot.config,
            policy,
            sequence: snapshot.sequence,
            commitment: snapshot.commitment,
            state,
        })
    }

    /// Persisted form of the current state
    pub fn snapshot(&self) -> LedgerSnapshot {
        let mut snapshot = LedgerSnapshot {
            address: self.address,
            manager: self.manager,
            config: self.config.clone(),
            sequence: self.sequence,
            commitment: self.commitment,
            destroyed: true,
            asset: None,
            margin: 0,
            written_off: 0,
            inventory_added: 0,
            next_token_id: 0,
            tokens: Vec::new(),
        };

        if let LedgerState::Active(ledger) = &self.state {
            snapshot.destroyed = false;
            snapshot.asset = Some(ledger.asset.as_ref().clone());
            snapshot.margin = ledger.margin;
            snapshot.written_off = ledger.written_off;
            snapshot.inventory_added = ledger.inventory_added;
            snapshot.next_token_id = ledger.next_token_id;
            snapshot.tokens = ledger.tokens.values().cloned().collect();
        }

        snapshot
    }

    /// Canonical accounting state, as committed to by receipts
    pub fn digest(&self) -> LedgerDigest {
        match &self.state {
            LedgerState::Active(ledger) => LedgerDigest {
                certificate: self.address,
                total_quantity: ledger.asset.total_quantity,
                margin: ledger.margin,
                written_off: ledger.written_off,
                inventory_added: ledger.inventory_added,
                next_token_id: ledger.next_token_id,
                tokens: ledger.tokens.clone(),
                destroyed: false,
            },
            LedgerState::Destroyed => LedgerDigest::tombstone(self.address),
        }
    }

    // ---- Write surface ----

    /// Issue `quantity` units out of the margin as a new token for `recipient`
    pub fn award_item(
        &mut self,
        caller: &Address,
        recipient: &Address,
        quantity: u64,
    ) -> LedgerResult<(TokenId, Receipt)> {
        self.authorize(caller, &Action::Award)?;
        Self::check_recipient(recipient)?;

        let ledger = self.active_mut()?;
        if quantity == 0 {
            return Err(LedgerError::invalid_quantity(quantity, "award must be positive"));
        }
        if quantity > ledger.margin {
            return Err(LedgerError::invalid_quantity(
                quantity,
                format!("exceeds margin of {}", ledger.margin),
            ));
        }

        ledger.margin -= quantity;
        let token_id = ledger.allocate_id();
        ledger
            .tokens
            .insert(token_id, Token::new(token_id, *recipient, quantity));
        let margin = ledger.margin;

        debug!(
            "Awarded token {} ({} units) to {} on {}, margin {}",
            token_id, quantity, recipient, self.address, margin
        );
        let event = LedgerEvent::Awarded {
            token_id,
            recipient: *recipient,
            amount: quantity,
            margin,
        };
        Ok((token_id, self.record(caller, vec![event])))
    }

    /// Move `quantity` units of a token to `recipient`.
    ///
    /// A partial transfer splits the token; a full transfer follows the
    /// configured [`FullTransferPolicy`]. Quantity is conserved either way.
    pub fn transfer(
        &mut self,
        caller: &Address,
        token_id: TokenId,
        quantity: u64,
        recipient: &Address,
    ) -> LedgerResult<(TransferOutcome, Receipt)> {
        let owner = self.active()?.token(token_id)?.owner;
        self.authorize(caller, &Action::Transfer { owner: &owner })?;
        Self::check_recipient(recipient)?;
        if *recipient == owner {
            return Err(LedgerError::InvalidRecipient(*recipient));
        }

        let policy = self.config.full_transfer_policy;
        let ledger = self.active_mut()?;
        let available = ledger.token(token_id)?.amount;
        if quantity == 0 {
            return Err(LedgerError::invalid_quantity(quantity, "transfer must be positive"));
        }
        if quantity > available {
            return Err(LedgerError::invalid_quantity(
                quantity,
                format!("token {} holds only {}", token_id, available),
            ));
        }

        let merge_target = match policy {
            FullTransferPolicy::MergeIntoExisting if quantity == available => {
                ledger.first_token_of(recipient)
            }
            _ => None,
        };
        let merge = match merge_target {
            Some(target) => {
                let merged = ledger.token(target)?.amount.checked_add(quantity).ok_or_else(|| {
                    LedgerError::invalid_quantity(
                        quantity,
                        format!("token {} balance would overflow", target),
                    )
                })?;
                Some((target, merged))
            }
            None => None,
        };

        let (outcome, event) = if quantity < available {
            let new_token = ledger.allocate_id();
            ledger
                .tokens
                .insert(new_token, Token::new(new_token, *recipient, quantity));
            debit(ledger, token_id, quantity);
            (
                TransferOutcome::Split(new_token),
                LedgerEvent::Split {
                    source: token_id,
                    new_token,
                    from: owner,
                    to: *recipient,
                    amount: quantity,
                },
            )
        } else if let Some((target, merged)) = merge {
            debit(ledger, token_id, quantity);
            if let Some(token) = ledger.tokens.get_mut(&target) {
                token.amount = merged;
            }
            (
                TransferOutcome::Merged(target),
                LedgerEvent::Merged {
                    source: token_id,
                    target,
                    from: owner,
                    to: *recipient,
                    amount: quantity,
                },
            )
        } else {
            if let Some(token) = ledger.tokens.get_mut(&token_id) {
                token.owner = *recipient;
            }
            (
                TransferOutcome::Reassigned(token_id),
                LedgerEvent::Reassigned {
                    token_id,
                    from: owner,
                    to: *recipient,
                    amount: quantity,
                },
            )
        };

        debug!(
            "Transferred {} units of token {} from {} to {} on {}: {:?}",
            quantity, token_id, owner, recipient, self.address, outcome
        );
        Ok((outcome, self.record(caller, vec![event])))
    }

    /// Permanently consume `quantity` units of a token
    pub fn write_off(
        &mut self,
        caller: &Address,
        token_id: TokenId,
        quantity: u64,
    ) -> LedgerResult<Receipt> {
        let owner = self.active()?.token(token_id)?.owner;
        self.authorize(caller, &Action::WriteOff { owner: &owner })?;

        let ledger = self.active_mut()?;
        let available = ledger.token(token_id)?.amount;
        if quantity == 0 {
            return Err(LedgerError::invalid_quantity(quantity, "write-off must be positive"));
        }
        if quantity > available {
            return Err(LedgerError::invalid_quantity(
                quantity,
                format!("token {} holds only {}", token_id, available),
            ));
        }
        let written_off = ledger.written_off.checked_add(quantity).ok_or_else(|| {
            LedgerError::invalid_quantity(quantity, "written-off total would overflow")
        })?;

        debit(ledger, token_id, quantity);
        ledger.written_off = written_off;
        let remaining = available - quantity;

        debug!(
            "Wrote off {} units of token {} on {}, {} remaining",
            quantity, token_id, self.address, remaining
        );
        let event = LedgerEvent::WrittenOff {
            token_id,
            owner,
            amount: quantity,
            remaining,
        };
        Ok(self.record(caller, vec![event]))
    }

    /// Replenish the margin by `quantity` units
    pub fn add_inventory(&mut self, caller: &Address, quantity: u64) -> LedgerResult<Receipt> {
        self.authorize(caller, &Action::AddInventory)?;

        let policy = self.config.inventory_policy;
        let ledger = self.active_mut()?;
        if quantity == 0 {
            return Err(LedgerError::invalid_quantity(quantity, "inventory must be positive"));
        }
        let margin = ledger.margin.checked_add(quantity).ok_or_else(|| {
            LedgerError::invalid_quantity(quantity, "margin would overflow")
        })?;
        let inventory_added = ledger.inventory_added.checked_add(quantity).ok_or_else(|| {
            LedgerError::invalid_quantity(quantity, "inventory total would overflow")
        })?;

        if policy == InventoryPolicy::CappedAtAuthorized {
            let bound = ledger.circulating() + u128::from(margin);
            if bound > u128::from(ledger.asset.total_quantity) {
                return Err(LedgerError::invalid_quantity(
                    quantity,
                    format!(
                        "would exceed authorized quantity {}",
                        ledger.asset.total_quantity
                    ),
                ));
            }
        }

        ledger.margin = margin;
        ledger.inventory_added = inventory_added;

        debug!("Added {} units of inventory to {}, margin {}", quantity, self.address, margin);
        let event = LedgerEvent::InventoryAdded {
            amount: quantity,
            margin,
        };
        Ok(self.record(caller, vec![event]))
    }

    /// Irreversibly tear the certificate down
    pub fn destroy(&mut self, caller: &Address) -> LedgerResult<Receipt> {
        self.active()?;
        self.authorize(caller, &Action::Destroy)?;

        self.state = LedgerState::Destroyed;

        info!("Destroyed certificate {}", self.address);
        let event = LedgerEvent::Destroyed {
            certificate: self.address,
        };
        Ok(self.record(caller, vec![event]))
    }

    // ---- Read surface ----

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn manager(&self) -> &Address {
        &self.manager
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Sequence of the last receipt issued
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Commitment carried by the last receipt issued
    pub fn commitment(&self) -> &StateCommitment {
        &self.commitment
    }

    /// The only read that still succeeds after `destroy`
    pub fn is_destroyed(&self) -> bool {
        matches!(self.state, LedgerState::Destroyed)
    }

    pub fn asset(&self) -> LedgerResult<Arc<AssetDescriptor>> {
        Ok(self.active()?.asset.clone())
    }

    pub fn name(&self) -> LedgerResult<String> {
        Ok(self.active()?.asset.name.clone())
    }

    pub fn unit(&self) -> LedgerResult<String> {
        Ok(self.active()?.asset.unit.clone())
    }

    pub fn total_quantity(&self) -> LedgerResult<u64> {
        Ok(self.active()?.asset.total_quantity)
    }

    pub fn margin(&self) -> LedgerResult<u64> {
        Ok(self.active()?.margin)
    }

    pub fn written_off(&self) -> LedgerResult<u64> {
        Ok(self.active()?.written_off)
    }

    pub fn inventory_added(&self) -> LedgerResult<u64> {
        Ok(self.active()?.inventory_added)
    }

    pub fn base_uri(&self) -> LedgerResult<String> {
        self.active()?;
        Ok(self.config.base_uri.clone())
    }

    pub fn token_uri(&self, token_id: TokenId) -> LedgerResult<String> {
        self.active()?.token(token_id)?;
        Ok(format!("{}{}", self.config.base_uri, token_id))
    }

    pub fn get_amount(&self, token_id: TokenId) -> LedgerResult<u64> {
        Ok(self.active()?.token(token_id)?.amount)
    }

    pub fn owner_of(&self, token_id: TokenId) -> LedgerResult<Address> {
        Ok(self.active()?.token(token_id)?.owner)
    }

    pub fn token(&self, token_id: TokenId) -> LedgerResult<TokenInfo> {
        let ledger = self.active()?;
        let token = ledger.token(token_id)?.clone();
        Ok(TokenInfo {
            token,
            asset: ledger.asset.clone(),
            uri: format!("{}{}", self.config.base_uri, token_id),
        })
    }

    /// All tokens held by `owner`, empty shells included, oldest first
    pub fn tokens_of(&self, owner: &Address) -> LedgerResult<Vec<Token>> {
        Ok(self
            .active()?
            .tokens
            .values()
            .filter(|token| token.owner == *owner)
            .cloned()
            .collect())
    }

    /// Total quantity held by `owner` across all of their tokens.
    ///
    /// One holder's tokens may together exceed `u64::MAX`.
    pub fn balance_of(&self, owner: &Address) -> LedgerResult<u128> {
        Ok(self
            .active()?
            .tokens
            .values()
            .filter(|token| token.owner == *owner)
            .map(|token| u128::from(token.amount))
            .sum())
    }

    pub fn token_count(&self) -> LedgerResult<usize> {
        Ok(self.active()?.tokens.len())
    }

    /// Verify the conservation identity of the current state
    pub fn check_conservation(&self) -> LedgerResult<()> {
        self.active()?;
        self.digest()
            .check_conservation()
            .map_err(LedgerError::InvalidInput)
    }

    // ---- Internals ----

    fn active(&self) -> LedgerResult<&ActiveLedger> {
        match &self.state {
            LedgerState::Active(ledger) => Ok(ledger),
            LedgerState::Destroyed => Err(LedgerError::LedgerDestroyed(self.address)),
        }
    }

    fn active_mut(&mut self) -> LedgerResult<&mut ActiveLedger> {
        match &mut self.state {
            LedgerState::Active(ledger) => Ok(ledger),
            LedgerState::Destroyed => Err(LedgerError::LedgerDestroyed(self.address)),
        }
    }

    /// Check the state tag first, then the access policy
    fn authorize(&self, caller: &Address, action: &Action<'_>) -> LedgerResult<()> {
        self.active()?;
        if !self.policy.permits(caller, &self.manager, action) {
            return Err(LedgerError::Unauthorized {
                caller: *caller,
                action: action.to_string(),
            });
        }
        Ok(())
    }

    fn check_recipient(recipient: &Address) -> LedgerResult<()> {
        if recipient.is_zero() {
            return Err(LedgerError::InvalidRecipient(*recipient));
        }
        Ok(())
    }

    /// Advance the audit log by one receipt over the current state
    fn record(&mut self, caller: &Address, events: Vec<LedgerEvent>) -> Receipt {
        self.sequence += 1;
        self.commitment = self.digest().commit(&self.commitment);
        self.receipt(*caller, events)
    }

    fn receipt(&self, caller: Address, events: Vec<LedgerEvent>) -> Receipt {
        Receipt {
            certificate: self.address,
            sequence: self.sequence,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            caller,
            events,
            commitment: self.commitment,
        }
    }
}

// Callers validate amounts before touching the ledger.
fn debit(ledger: &mut ActiveLedger, token_id: TokenId, quantity: u64) {
    if let Some(token) = ledger.tokens.get_mut(&token_id) {
        token.amount -= quantity;
    }
}
