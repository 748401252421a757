//! Audit log verification
//!
//! Standalone functions that rebuild a certificate's accounting state from its
//! receipt log alone, without access to the storage layer or the live ledger.
//! Replay checks that sequences are contiguous, that every event was legal in
//! the state it was applied to, that quantity is conserved after each receipt,
//! and that every receipt's commitment matches the recomputed chain.

use crate::certificate::LedgerSnapshot;
use crate::commitment::{LedgerDigest, StateCommitment};
use crate::config::InventoryPolicy;
use crate::events::{LedgerEvent, Receipt};
use crate::id::Address;
use crate::token::{Token, TokenId};
use log::warn;
use std::collections::BTreeMap;

/// Result of a verification operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationResult {
    /// Verification was successful
    Valid,
    /// Verification failed with a specific reason
    Invalid(String),
    /// Verification couldn't be completed due to missing data
    MissingData(String),
}

impl From<VerificationResult> for Result<(), String> {
    fn from(result: VerificationResult) -> Self {
        match result {
            VerificationResult::Valid => Ok(()),
            VerificationResult::Invalid(msg) => Err(msg),
            VerificationResult::MissingData(msg) => Err(format!("Missing data: {}", msg)),
        }
    }
}

fn invalid(receipt: &Receipt, msg: impl Into<String>) -> VerificationResult {
    VerificationResult::Invalid(format!(
        "receipt {}#{}: {}",
        receipt.certificate,
        receipt.sequence,
        msg.into()
    ))
}

/// Rebuild the accounting state described by a receipt log
///
/// # Parameters
/// * `receipts` - The complete receipt log of one certificate, oldest first
///
/// # Returns
/// The digest after the last receipt, or the reason the log is not valid
pub fn replay(receipts: &[Receipt]) -> Result<LedgerDigest, VerificationResult> {
    replay_under(receipts, InventoryPolicy::Replenishable)
}

/// Replay a receipt log, also holding every inventory addition to `policy`
fn replay_under(
    receipts: &[Receipt],
    policy: InventoryPolicy,
) -> Result<LedgerDigest, VerificationResult> {
    let genesis = receipts.first().ok_or_else(|| {
        VerificationResult::MissingData("receipt log is empty".to_string())
    })?;

    let mut digest = match genesis.events.as_slice() {
        [LedgerEvent::CertificateCreated {
            certificate,
            total_quantity,
            ..
        }] if genesis.sequence == 0 && *certificate == genesis.certificate => LedgerDigest {
            certificate: *certificate,
            total_quantity: *total_quantity,
            margin: *total_quantity,
            written_off: 0,
            inventory_added: 0,
            next_token_id: 1,
            tokens: BTreeMap::new(),
            destroyed: false,
        },
        _ => {
            return Err(VerificationResult::MissingData(format!(
                "log of {} does not start with its creation receipt",
                genesis.certificate
            )))
        }
    };

    let mut commitment = StateCommitment::default();
    for (position, receipt) in receipts.iter().enumerate() {
        if receipt.certificate != digest.certificate {
            return Err(invalid(receipt, "belongs to another certificate"));
        }
        if receipt.sequence != position as u64 {
            return Err(VerificationResult::MissingData(format!(
                "expected receipt {}#{}, found #{}",
                digest.certificate, position, receipt.sequence
            )));
        }

        if position > 0 {
            for event in &receipt.events {
                apply(&mut digest, event, policy).map_err(|msg| invalid(receipt, msg))?;
            }
        }

        digest
            .check_conservation()
            .map_err(|msg| invalid(receipt, msg))?;

        commitment = digest.commit(&commitment);
        if commitment != receipt.commitment {
            return Err(invalid(
                receipt,
                format!(
                    "commitment {} does not match recomputed {}",
                    receipt.commitment, commitment
                ),
            ));
        }
    }

    Ok(digest)
}

/// Check a receipt log on its own
pub fn verify_receipts(receipts: &[Receipt]) -> VerificationResult {
    match replay(receipts) {
        Ok(_) => VerificationResult::Valid,
        Err(result) => {
            warn!("Receipt log failed verification: {:?}", result);
            result
        }
    }
}

/// Check that a stored snapshot is exactly the state its receipt log produces.
///
/// Inventory additions are also checked against the snapshot's inventory
/// policy, which receipts do not record.
///
/// # Parameters
/// * `snapshot` - The persisted certificate state
/// * `receipts` - The certificate's complete receipt log
///
/// # Returns
/// A VerificationResult indicating whether the snapshot is backed by the log
pub fn verify_snapshot(snapshot: &LedgerSnapshot, receipts: &[Receipt]) -> VerificationResult {
    let result = match replay_under(receipts, snapshot.config.inventory_policy) {
        Ok(replayed) => compare(snapshot, receipts, &replayed),
        Err(result) => result,
    };

    if result != VerificationResult::Valid {
        warn!(
            "Snapshot of {} failed verification: {:?}",
            snapshot.address, result
        );
    }
    result
}

fn compare(
    snapshot: &LedgerSnapshot,
    receipts: &[Receipt],
    replayed: &LedgerDigest,
) -> VerificationResult {
    // replay() guarantees a non-empty log
    let Some(last) = receipts.last() else {
        return VerificationResult::MissingData("receipt log is empty".to_string());
    };

    if replayed.certificate != snapshot.address {
        return VerificationResult::Invalid(format!(
            "log belongs to {}, snapshot to {}",
            replayed.certificate, snapshot.address
        ));
    }
    if last.sequence != snapshot.sequence || last.commitment != snapshot.commitment {
        return VerificationResult::Invalid(format!(
            "snapshot is at #{} ({}), log ends at #{} ({})",
            snapshot.sequence, snapshot.commitment, last.sequence, last.commitment
        ));
    }
    if snapshot_digest(snapshot) != *replayed {
        return VerificationResult::Invalid(format!(
            "snapshot of {} differs from the replayed state",
            snapshot.address
        ));
    }
    VerificationResult::Valid
}

fn snapshot_digest(snapshot: &LedgerSnapshot) -> LedgerDigest {
    if snapshot.destroyed {
        return LedgerDigest::tombstone(snapshot.address);
    }

    LedgerDigest {
        certificate: snapshot.address,
        total_quantity: snapshot
            .asset
            .as_ref()
            .map(|asset| asset.total_quantity)
            .unwrap_or(0),
        margin: snapshot.margin,
        written_off: snapshot.written_off,
        inventory_added: snapshot.inventory_added,
        next_token_id: snapshot.next_token_id,
        tokens: snapshot
            .tokens
            .iter()
            .map(|token| (token.id, token.clone()))
            .collect(),
        destroyed: false,
    }
}

/// Apply one event to a replayed state, checking that it was legal there
fn apply(
    digest: &mut LedgerDigest,
    event: &LedgerEvent,
    policy: InventoryPolicy,
) -> Result<(), String> {
    if digest.destroyed {
        return Err(format!("{} after destroy", event.kind()));
    }

    match event {
        LedgerEvent::CertificateCreated { .. } => {
            return Err("certificate created twice".to_string());
        }
        LedgerEvent::Awarded {
            token_id,
            recipient,
            amount,
            margin,
        } => {
            if *amount == 0 || *amount > digest.margin {
                return Err(format!("award of {} from margin {}", amount, digest.margin));
            }
            mint(digest, *token_id, Token::new(*token_id, *recipient, *amount))?;
            digest.margin -= amount;
            expect_eq("margin", *margin, digest.margin)?;
        }
        LedgerEvent::Split {
            source,
            new_token,
            from,
            to,
            amount,
        } => {
            let held = owned(digest, *source, from)?.amount;
            if *amount == 0 || *amount >= held || to == from {
                return Err(format!("split of {} from token {} holding {}", amount, source, held));
            }
            mint(digest, *new_token, Token::new(*new_token, *to, *amount))?;
            owned_mut(digest, *source)?.amount -= amount;
        }
        LedgerEvent::Merged {
            source,
            target,
            from,
            to,
            amount,
        } => {
            let held = owned(digest, *source, from)?.amount;
            if *amount == 0 || *amount != held || source == target {
                return Err(format!("merge of {} from token {} holding {}", amount, source, held));
            }
            let target_amount = owned(digest, *target, to)?.amount;
            let credited = target_amount
                .checked_add(*amount)
                .ok_or_else(|| format!("token {} would overflow", target))?;
            owned_mut(digest, *source)?.amount = 0;
            owned_mut(digest, *target)?.amount = credited;
        }
        LedgerEvent::Reassigned {
            token_id,
            from,
            to,
            amount,
        } => {
            let held = owned(digest, *token_id, from)?.amount;
            if *amount == 0 || *amount != held || to == from {
                return Err(format!("reassignment of {} from token {} holding {}", amount, token_id, held));
            }
            owned_mut(digest, *token_id)?.owner = *to;
        }
        LedgerEvent::WrittenOff {
            token_id,
            owner,
            amount,
            remaining,
        } => {
            let held = owned(digest, *token_id, owner)?.amount;
            if *amount == 0 || *amount > held {
                return Err(format!("write-off of {} from token {} holding {}", amount, token_id, held));
            }
            digest.written_off = digest
                .written_off
                .checked_add(*amount)
                .ok_or("written-off total would overflow")?;
            owned_mut(digest, *token_id)?.amount -= amount;
            expect_eq("remaining", *remaining, held - amount)?;
        }
        LedgerEvent::InventoryAdded { amount, margin } => {
            if *amount == 0 {
                return Err("empty inventory addition".to_string());
            }
            digest.margin = digest
                .margin
                .checked_add(*amount)
                .ok_or("margin would overflow")?;
            digest.inventory_added = digest
                .inventory_added
                .checked_add(*amount)
                .ok_or("inventory total would overflow")?;
            expect_eq("margin", *margin, digest.margin)?;

            if policy == InventoryPolicy::CappedAtAuthorized
                && digest.circulating() + u128::from(digest.margin)
                    > u128::from(digest.total_quantity)
            {
                return Err(format!(
                    "inventory of {} exceeds authorized quantity {}",
                    amount, digest.total_quantity
                ));
            }
        }
        LedgerEvent::Destroyed { certificate } => {
            if *certificate != digest.certificate {
                return Err(format!("destroy of foreign certificate {}", certificate));
            }
            *digest = LedgerDigest::tombstone(digest.certificate);
        }
    }
    Ok(())
}

fn owned<'a>(
    digest: &'a LedgerDigest,
    token_id: TokenId,
    owner: &Address,
) -> Result<&'a Token, String> {
    let token = digest
        .tokens
        .get(&token_id)
        .ok_or_else(|| format!("unknown token {}", token_id))?;
    if token.owner != *owner {
        return Err(format!("token {} is not held by {}", token_id, owner));
    }
    Ok(token)
}

fn owned_mut(digest: &mut LedgerDigest, token_id: TokenId) -> Result<&mut Token, String> {
    digest
        .tokens
        .get_mut(&token_id)
        .ok_or_else(|| format!("unknown token {}", token_id))
}

/// Insert a freshly minted token; ids must be handed out in order
fn mint(digest: &mut LedgerDigest, token_id: TokenId, token: Token) -> Result<(), String> {
    if token_id.0 != digest.next_token_id {
        return Err(format!(
            "token {} minted out of order, expected {}",
            token_id, digest.next_token_id
        ));
    }
    if token.owner.is_zero() {
        return Err(format!("token {} minted to the zero address", token_id));
    }
    digest.next_token_id += 1;
    digest.tokens.insert(token_id, token);
    Ok(())
}

fn expect_eq(field: &str, recorded: u64, replayed: u64) -> Result<(), String> {
    if recorded != replayed {
        return Err(format!(
            "recorded {} {} but replay gives {}",
            field, recorded, replayed
        ));
    }
    Ok(())
}
