use curve25519_dalek::edwards::CompressedEdwardsY;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

// Address identifies owners, managers, factories and certificate ledgers.
// It is a 32 byte long identifier, resembling a public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address([u8; 32]);

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl FromStr for Address {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(raw).map_err(|e| format!("Invalid address {}: {}", s, e))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| format!("Invalid address {}: expected 32 bytes", s))?;
        Ok(Address(bytes))
    }
}

impl Default for Address {
    fn default() -> Self {
        Address::ZERO
    }
}

impl Deref for Address {
    type Target = [u8; 32];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Address {
    /// The null address; never a valid recipient
    pub const ZERO: Address = Address([0; 32]);

    pub fn new(bytes: [u8; 32]) -> Self {
        Address(bytes)
    }

    /// Get a reference to the internal bytes
    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 32]
    }

    /// Try to build an address from a byte slice of length 32
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; 32] = bytes.try_into().ok()?;
        Some(Address(bytes))
    }

    pub fn create_address(seeds: &[&[u8]], bump: u8) -> [u8; 32] {
        let mut hasher = Sha256::new();

        // Domain separator
        hasher.update(b"UNITS_Certificate");

        for seed in seeds {
            hasher.update(seed);
        }

        hasher.update([bump]);

        hasher.finalize().into()
    }

    /// Verify that a 32-byte array is not a valid point on the ed25519 curve
    ///
    /// Returns true if the bytes do not represent a valid curve point.
    pub fn is_off_curve(bytes: &[u8; 32]) -> bool {
        let Ok(compressed_edwards_y) = CompressedEdwardsY::from_slice(bytes.as_ref()) else {
            return true;
        };
        compressed_edwards_y.decompress().is_none()
    }

    /// Try to find an off-curve address for the given seeds
    pub fn try_find_address(seeds: &[&[u8]]) -> Option<(Address, u8)> {
        for bump in 0..=u8::MAX {
            let bytes = Address::create_address(seeds, bump);
            if Address::is_off_curve(&bytes) {
                return Some((Address(bytes), bump));
            }
        }
        None
    }

    /// Derive the address of the `nonce`-th certificate created by `factory`.
    ///
    /// Derived addresses are off-curve, so no signing key can exist for them.
    pub fn derive_certificate(factory: &Address, nonce: u64) -> Option<Address> {
        let nonce = nonce.to_le_bytes();
        Address::try_find_address(&[factory.bytes(), &nonce]).map(|(address, _)| address)
    }

    /// Derive a stable address from a human-readable label
    pub fn from_label(label: &str) -> Address {
        let mut hasher = Sha256::new();
        hasher.update(b"UNITS_Label");
        hasher.update(label.as_bytes());
        Address(hasher.finalize().into())
    }
}
