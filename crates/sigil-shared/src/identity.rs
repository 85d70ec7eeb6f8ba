use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::IdentityError;
use crate::types::{Address, AddressHash};

/// A session identity: the wallet address plus the X25519 keypair that the
/// directory service publishes for it.
#[derive(Clone)]
pub struct Identity {
    address: Address,
    secret: StaticSecret,
}

/// Serializable format for storing/exporting identity
#[derive(Serialize, Deserialize)]
pub struct IdentityExport {
    pub address: String,
    pub secret_key: [u8; 32],
    pub public_key: [u8; 32],
}

impl Identity {
    /// Generate a fresh encryption keypair for a wallet address
    pub fn generate(address: Address) -> Result<Self, IdentityError> {
        if address.is_unknown() {
            return Err(IdentityError::InvalidAddress);
        }
        Ok(Self {
            address,
            secret: StaticSecret::random_from_rng(OsRng),
        })
    }

    /// Restore identity from secret key bytes
    pub fn from_secret_bytes(address: Address, secret: [u8; 32]) -> Self {
        Self {
            address,
            secret: StaticSecret::from(secret),
        }
    }

    /// Restore identity from a hex-encoded secret (key file contents)
    pub fn from_secret_hex(address: Address, hex_secret: &str) -> Result<Self, IdentityError> {
        let bytes = hex::decode(hex_secret.trim()).map_err(|_| IdentityError::InvalidKeyBytes)?;
        let secret: [u8; 32] = bytes
            .try_into()
            .map_err(|_| IdentityError::InvalidKeyBytes)?;
        Ok(Self::from_secret_bytes(address, secret))
    }

    pub fn from_export(export: &IdentityExport) -> Self {
        Self::from_secret_bytes(Address::new(&export.address), export.secret_key)
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn address_hash(&self) -> AddressHash {
        self.address.hash()
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::from(&self.secret)
    }

    pub fn secret(&self) -> &StaticSecret {
        &self.secret
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret.to_bytes())
    }

    pub fn to_export(&self) -> IdentityExport {
        IdentityExport {
            address: self.address.to_string(),
            secret_key: self.secret.to_bytes(),
            public_key: self.public_key().to_bytes(),
        }
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_roundtrip() {
        let id = Identity::generate(Address::new("0xabc")).unwrap();
        let export = id.to_export();
        let restored = Identity::from_export(&export);
        assert_eq!(id.public_key(), restored.public_key());
        assert_eq!(id.address(), restored.address());
    }

    #[test]
    fn test_secret_hex_roundtrip() {
        let id = Identity::generate(Address::new("0xabc")).unwrap();
        let restored = Identity::from_secret_hex(Address::new("0xabc"), &id.secret_hex()).unwrap();
        assert_eq!(id.public_key(), restored.public_key());
        assert!(Identity::from_secret_hex(Address::new("0xabc"), "abcd").is_err());
    }

    #[test]
    fn test_unknown_address_rejected() {
        assert!(Identity::generate(Address::new("unknown")).is_err());
    }
}
