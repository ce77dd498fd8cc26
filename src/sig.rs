//! Handles the creation and verification of (Ethereum) Signatures and the
//! public identifiers derived from signing keys.

use core::{fmt, str::FromStr};

use crate::abiencode::types::{Address, Hash};
use serde::Serialize;
use sha3::{Digest, Keccak256};

mod k256;
pub use self::k256::{recover_signer, Error, Signer};


/// Add the `\x19Ethereum Signed Message\n<length>` prefix to hash.
///
/// This is the format expected by the Solidity contracts.
fn hash_to_eth_signed_msg_hash(hash: Hash) -> Hash {
    // Packed encoding => We can't use the serializer
    let mut hasher = Keccak256::new();
    hasher.update(b"\x19Ethereum Signed Message:\n32");
    hasher.update(hash.0);
    Hash(hasher.finalize().into())
}

/// Prefix of every [PublicIdentifier].
pub const IDENTIFIER_PREFIX: &str = "indra";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentifierError {
    #[error("identifier must start with \"{IDENTIFIER_PREFIX}\"")]
    MissingPrefix,
    #[error("identifier is not valid base58: {0}")]
    InvalidEncoding(String),
    #[error("identifier does not contain a valid public key")]
    InvalidKey,
}

/// Stable identity of a node: `indra` followed by the base58 encoded,
/// compressed secp256k1 public key.
///
/// The signing [Address] of a participant can always be derived from it.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct PublicIdentifier(String);

impl PublicIdentifier {
    pub fn from_compressed_key(key: &[u8; 33]) -> Self {
        Self(format!("{}{}", IDENTIFIER_PREFIX, bs58::encode(key).into_string()))
    }

    fn compressed_key(&self) -> Result<Vec<u8>, IdentifierError> {
        let encoded = self
            .0
            .strip_prefix(IDENTIFIER_PREFIX)
            .ok_or(IdentifierError::MissingPrefix)?;
        bs58::decode(encoded)
            .into_vec()
            .map_err(|e| IdentifierError::InvalidEncoding(e.to_string()))
    }

    /// Signing address belonging to this identifier.
    pub fn address(&self) -> Result<Address, IdentifierError> {
        let key = self.compressed_key()?;
        self::k256::address_from_sec1(&key).ok_or(IdentifierError::InvalidKey)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for PublicIdentifier {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = PublicIdentifier(s.to_string());
        id.address()?;
        Ok(id)
    }
}

impl fmt::Display for PublicIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PublicIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
