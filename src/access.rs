use crate::id::Address;
use std::fmt;

/// A mutating operation awaiting authorization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action<'a> {
    Award,
    Transfer { owner: &'a Address },
    WriteOff { owner: &'a Address },
    AddInventory,
    Destroy,
}

impl fmt::Display for Action<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Award => write!(f, "award items"),
            Action::Transfer { owner } => write!(f, "transfer a token owned by {}", owner),
            Action::WriteOff { owner } => write!(f, "write off a token owned by {}", owner),
            Action::AddInventory => write!(f, "add inventory"),
            Action::Destroy => write!(f, "destroy the certificate"),
        }
    }
}

/// Decides whether a caller may perform an action on a certificate.
///
/// How callers are authenticated is up to the layer invoking the ledger; the
/// ledger only enforces the decision at the start of every mutating operation.
pub trait AccessPolicy: fmt::Debug + Send + Sync {
    /// # Parameters
    /// * `caller` - The identity issuing the operation
    /// * `manager` - The certificate's manager (its creator)
    /// * `action` - The operation being attempted
    ///
    /// # Returns
    /// `true` if the operation may proceed
    fn permits(&self, caller: &Address, manager: &Address, action: &Action<'_>) -> bool;
}

/// Default policy: the manager administers the certificate, holders move
/// and consume their own tokens, and the manager may also act on any token.
#[derive(Debug, Clone, Copy, Default)]
pub struct IssuerPolicy;

impl AccessPolicy for IssuerPolicy {
    fn permits(&self, caller: &Address, manager: &Address, action: &Action<'_>) -> bool {
        match action {
            Action::Award | Action::AddInventory | Action::Destroy => caller == manager,
            Action::Transfer { owner } | Action::WriteOff { owner } => {
                caller == *owner || caller == manager
            }
        }
    }
}

/// Permits everything; for callers that authorize upstream
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenPolicy;

impl AccessPolicy for OpenPolicy {
    fn permits(&self, _caller: &Address, _manager: &Address, _action: &Action<'_>) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issuer_policy() {
        let manager = Address::from_label("manager");
        let holder = Address::from_label("holder");
        let stranger = Address::from_label("stranger");
        let policy = IssuerPolicy;

        assert!(policy.permits(&manager, &manager, &Action::Award));
        assert!(!policy.permits(&holder, &manager, &Action::Award));
        assert!(!policy.permits(&holder, &manager, &Action::Destroy));

        let transfer = Action::Transfer { owner: &holder };
        assert!(policy.permits(&holder, &manager, &transfer));
        assert!(policy.permits(&manager, &manager, &transfer));
        assert!(!policy.permits(&stranger, &manager, &transfer));

        let write_off = Action::WriteOff { owner: &holder };
        assert!(!policy.permits(&stranger, &manager, &write_off));
    }

    #[test]
    fn test_open_policy() {
        let a = Address::from_label("a");
        let b = Address::from_label("b");
        assert!(OpenPolicy.permits(&a, &b, &Action::Destroy));
    }
}
