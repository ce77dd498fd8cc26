//! Signer using the k256 Rust crate (implementation of ecdsa in Rust).

use crate::abiencode::types::{Address, Hash, Signature};
use k256::{
    ecdsa::{
        recoverable,
        signature::{hazmat::PrehashSigner, Signature as k256Signature},
        SigningKey, VerifyingKey,
    },
    elliptic_curve::sec1::ToEncodedPoint,
};
use sha3::{Digest, Keccak256};

use super::{hash_to_eth_signed_msg_hash, PublicIdentifier};

pub use k256::ecdsa::Error;

pub struct Signer {
    key: SigningKey,
    addr: Address,
    identifier: PublicIdentifier,
}

impl core::fmt::Debug for Signer {
    // Never print the private key.
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Signer")
            .field("addr", &self.addr)
            .field("identifier", &self.identifier)
            .finish()
    }
}

impl From<&VerifyingKey> for Address {
    fn from(key: &VerifyingKey) -> Self {
        // See https://ethereum.stackexchange.com/questions/65233/goethereum-getting-public-key-from-private-key-hex-formatting
        //
        // Throw away the first byte, which is not part of the public key. It is
        // added by the uncompressed SEC1 encoding.
        let point = key.to_encoded_point(false);
        let hash: [u8; 32] = Keccak256::digest(&point.as_bytes()[1..]).into();

        let mut addr = Address([0; 20]);
        addr.0.copy_from_slice(&hash[32 - 20..]);
        addr
    }
}

/// Address of a SEC1 encoded (compressed or uncompressed) public key.
pub(super) fn address_from_sec1(bytes: &[u8]) -> Option<Address> {
    let key = VerifyingKey::from_sec1_bytes(bytes).ok()?;
    Some((&key).into())
}

fn identifier_of(key: &VerifyingKey) -> PublicIdentifier {
    let mut compressed = [0u8; 33];
    compressed.copy_from_slice(key.to_encoded_point(true).as_bytes());
    PublicIdentifier::from_compressed_key(&compressed)
}

impl Signer {
    pub fn new<R: rand::Rng + rand::CryptoRng>(rng: &mut R) -> Self {
        Self::from_key(SigningKey::random(rng))
    }

    /// Load a signer from a raw 32 byte private key.
    pub fn from_bytes(private_key: &[u8]) -> Result<Self, Error> {
        Ok(Self::from_key(SigningKey::from_bytes(private_key)?))
    }

    fn from_key(key: SigningKey) -> Self {
        let verifying_key = key.verifying_key();
        let addr = (&verifying_key).into();
        let identifier = identifier_of(&verifying_key);
        Self {
            key,
            addr,
            identifier,
        }
    }

    pub fn address(&self) -> Address {
        self.addr
    }

    pub fn public_identifier(&self) -> &PublicIdentifier {
        &self.identifier
    }

    pub fn sign_eth(&self, msg: Hash) -> Result<Signature, Error> {
        // "\x19Ethereum Signed Message:\n32" format
        let hash = hash_to_eth_signed_msg_hash(msg);

        let sig: recoverable::Signature = self.key.sign_prehash(&hash.0)?;

        // Luckily for us, this Signature type already has the format we need:
        // - 65 bytes containing r, s and v in this order
        //
        // But we still have to add 27 to v for the signature to be valid in the
        // EVM.
        let mut sig_bytes = [0u8; 65];
        sig_bytes.copy_from_slice(sig.as_bytes());
        sig_bytes[64] += 27;

        Ok(Signature(sig_bytes))
    }
}

/// Recover the address that produced `eth_sig` over `msg` using
/// [Signer::sign_eth].
pub fn recover_signer(msg: Hash, eth_sig: &Signature) -> Result<Address, Error> {
    // "\x19Ethereum Signed Message:\n32" format
    let hash = hash_to_eth_signed_msg_hash(msg);

    // Undo adding the 27, to go back to the format expected below
    let mut sig_bytes: [u8; 65] = eth_sig.0;
    sig_bytes[64] = sig_bytes[64].checked_sub(27).ok_or_else(Error::new)?;

    let sig = recoverable::Signature::from_bytes(&sig_bytes)?;
    let verifying_key = sig.recover_verifying_key_from_digest_bytes(&hash.0.into())?;
    Ok((&verifying_key).into())
}
