//! Conditional transfers locked inside a channel.
//!
//! Two kinds of transfers are supported: linked transfers (unlocked with a
//! sha256 pre-image) and withdrawals (unlocked with the signatures of both
//! parties). Each kind has its own state, resolver and ABI encoding.

use core::fmt;

use crate::{
    abiencode::{
        self, as_bytes, keccak256,
        types::{Address, Hash, Signature, U256},
    },
    channel::Balance,
    sig::{self, PublicIdentifier},
};
use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};

pub const LINKED_TRANSFER_STATE_ENCODING: &str =
    "tuple(tuple(uint256[2] amount, address[2] to) balance, bytes32 linkedHash)";
pub const LINKED_TRANSFER_RESOLVER_ENCODING: &str = "tuple(bytes32 preImage)";
pub const WITHDRAW_STATE_ENCODING: &str = "tuple(tuple(uint256[2] amount, address[2] to) balance, bytes initiatorSignature, address[2] signers, bytes32 data, uint256 nonce, uint256 fee)";
pub const WITHDRAW_RESOLVER_ENCODING: &str = "tuple(bytes responderSignature)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferKind {
    Linked,
    Withdraw,
}

impl TransferKind {
    pub fn encodings(&self) -> [&'static str; 2] {
        match self {
            TransferKind::Linked => [
                LINKED_TRANSFER_STATE_ENCODING,
                LINKED_TRANSFER_RESOLVER_ENCODING,
            ],
            TransferKind::Withdraw => [WITHDRAW_STATE_ENCODING, WITHDRAW_RESOLVER_ENCODING],
        }
    }

    /// Kind described by a `[state, resolver]` encoding pair.
    pub fn from_encodings<S: AsRef<str>>(encodings: &[S]) -> Option<Self> {
        [TransferKind::Linked, TransferKind::Withdraw]
            .into_iter()
            .find(|kind| {
                encodings.len() == 2
                    && kind
                        .encodings()
                        .iter()
                        .zip(encodings)
                        .all(|(a, b)| *a == b.as_ref())
            })
    }
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferKind::Linked => f.write_str("LinkedTransfer"),
            TransferKind::Withdraw => f.write_str("Withdraw"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("resolver for {resolver} cannot resolve a {state} transfer")]
    ResolverMismatch {
        state: TransferKind,
        resolver: TransferKind,
    },
    #[error("pre-image does not match the linked hash")]
    InvalidPreImage,
    #[error("withdrawal signature of {0:?} is invalid")]
    InvalidSignature(Address),
    #[error("withdrawal fee exceeds the withdrawn amount")]
    FeeTooLarge,
    #[error("balance overflow")]
    Overflow,
    #[error(transparent)]
    Encoding(#[from] abiencode::Error),
}

/// Signatures are `bytes` in the contracts.
fn signature_as_bytes<S>(sig: &Signature, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    as_bytes::serialize(&sig.0, serializer)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkedTransferState {
    pub balance: Balance,
    pub linked_hash: Hash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkedTransferResolver {
    pub pre_image: Hash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawState {
    pub balance: Balance,
    #[serde(serialize_with = "signature_as_bytes")]
    pub initiator_signature: Signature,
    pub signers: [Address; 2],
    pub data: Hash,
    pub nonce: U256,
    pub fee: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawResolver {
    #[serde(serialize_with = "signature_as_bytes")]
    pub responder_signature: Signature,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum TransferState {
    Linked(LinkedTransferState),
    Withdraw(WithdrawState),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum TransferResolver {
    Linked(LinkedTransferResolver),
    Withdraw(WithdrawResolver),
}

impl TransferResolver {
    pub fn kind(&self) -> TransferKind {
        match self {
            TransferResolver::Linked(_) => TransferKind::Linked,
            TransferResolver::Withdraw(_) => TransferKind::Withdraw,
        }
    }
}

/// sha256 hash lock used by linked transfers.
pub fn linked_hash(pre_image: &Hash) -> Hash {
    Hash(Sha256::digest(pre_image.0).into())
}

impl TransferState {
    pub fn kind(&self) -> TransferKind {
        match self {
            TransferState::Linked(_) => TransferKind::Linked,
            TransferState::Withdraw(_) => TransferKind::Withdraw,
        }
    }

    pub fn balance(&self) -> &Balance {
        match self {
            TransferState::Linked(s) => &s.balance,
            TransferState::Withdraw(s) => &s.balance,
        }
    }

    pub fn encodings(&self) -> Vec<String> {
        self.kind().encodings().iter().map(|e| e.to_string()).collect()
    }

    /// `keccak256(abi.encode(state))`
    pub fn initial_state_hash(&self) -> Result<Hash, abiencode::Error> {
        match self {
            TransferState::Linked(s) => abiencode::to_hash(s),
            TransferState::Withdraw(s) => abiencode::to_hash(s),
        }
    }

    /// Final balance of the transfer when unlocked with `resolver`.
    ///
    /// An all-zero resolver cancels the transfer and returns the balance
    /// unchanged.
    pub fn resolve(&self, resolver: &TransferResolver) -> Result<Balance, TransferError> {
        match (self, resolver) {
            (TransferState::Linked(state), TransferResolver::Linked(resolver)) => {
                if resolver.pre_image.is_zero() {
                    return Ok(state.balance);
                }
                if linked_hash(&resolver.pre_image) != state.linked_hash {
                    return Err(TransferError::InvalidPreImage);
                }
                let total = state.balance.total().ok_or(TransferError::Overflow)?;
                Ok(Balance {
                    amount: [U256::zero(), total],
                    to: state.balance.to,
                })
            }
            (TransferState::Withdraw(state), TransferResolver::Withdraw(resolver)) => {
                if resolver.responder_signature.is_zero() {
                    return Ok(state.balance);
                }
                for (sig, signer) in [&state.initiator_signature, &resolver.responder_signature]
                    .into_iter()
                    .zip(state.signers)
                {
                    match sig::recover_signer(state.data, sig) {
                        Ok(recovered) if recovered == signer => {}
                        _ => return Err(TransferError::InvalidSignature(signer)),
                    }
                }
                if state.fee > state.balance.amount[0] {
                    return Err(TransferError::FeeTooLarge);
                }
                // The withdrawn amount leaves the channel, only the fee stays.
                Ok(Balance {
                    amount: [U256::zero(), state.fee],
                    to: state.balance.to,
                })
            }
            (state, resolver) => Err(TransferError::ResolverMismatch {
                state: state.kind(),
                resolver: resolver.kind(),
            }),
        }
    }
}

/// `keccak256(abi.encodePacked(definition, channel, timeout, nonce))`
pub fn transfer_id(
    transfer_definition: Address,
    channel_address: Address,
    transfer_timeout: U256,
    channel_nonce: u64,
) -> Hash {
    // Packed encoding => We can't use the serializer
    let mut data = Vec::with_capacity(20 + 20 + 32 + 32);
    data.extend_from_slice(&transfer_definition.0);
    data.extend_from_slice(&channel_address.0);
    let mut word = [0u8; 32];
    transfer_timeout.to_big_endian(&mut word);
    data.extend_from_slice(&word);
    U256::from(channel_nonce).to_big_endian(&mut word);
    data.extend_from_slice(&word);
    keccak256(&data)
}

/// Role of a participant in a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferRole {
    Initiator,
    Responder,
}

impl TransferRole {
    /// Index into the transfer balance.
    pub fn idx(&self) -> usize {
        match self {
            TransferRole::Initiator => 0,
            TransferRole::Responder => 1,
        }
    }
}

/// On-chain representation of a transfer, its hash is a leaf of the channel
/// merkle tree. The field order matches the Solidity struct.
#[derive(Debug, Clone, Serialize)]
pub struct CoreTransferState {
    pub channel_address: Address,
    pub transfer_id: Hash,
    pub transfer_definition: Address,
    pub initiator: Address,
    pub responder: Address,
    pub asset_id: Address,
    pub balance: Balance,
    pub transfer_timeout: U256,
    pub initial_state_hash: Hash,
}

/// Everything known about a transfer, active or resolved.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FullTransferState {
    pub transfer_id: Hash,
    pub channel_address: Address,
    pub chain_id: u64,
    pub channel_factory_address: Address,
    pub asset_id: Address,
    /// Current balance, the resolved balance once `transfer_resolver` is set.
    pub balance: Balance,
    pub initial_balance: Balance,
    pub transfer_definition: Address,
    pub transfer_state: TransferState,
    pub transfer_resolver: Option<TransferResolver>,
    pub transfer_timeout: U256,
    pub transfer_encodings: Vec<String>,
    pub initial_state_hash: Hash,
    pub meta: serde_json::Value,
    pub initiator: Address,
    pub responder: Address,
    pub initiator_identifier: PublicIdentifier,
    pub responder_identifier: PublicIdentifier,
    /// Channel nonce before the create update.
    pub channel_nonce: u64,
}

impl FullTransferState {
    /// Core state as committed to when the transfer was created.
    pub fn core(&self) -> CoreTransferState {
        CoreTransferState {
            channel_address: self.channel_address,
            transfer_id: self.transfer_id,
            transfer_definition: self.transfer_definition,
            initiator: self.initiator,
            responder: self.responder,
            asset_id: self.asset_id,
            balance: self.initial_balance,
            transfer_timeout: self.transfer_timeout,
            initial_state_hash: self.initial_state_hash,
        }
    }

    /// Merkle leaf of this transfer.
    pub fn hash(&self) -> Result<Hash, abiencode::Error> {
        abiencode::to_hash(&self.core())
    }

    pub fn is_resolved(&self) -> bool {
        self.transfer_resolver.is_some()
    }

    pub fn role_of(&self, identifier: &PublicIdentifier) -> Option<TransferRole> {
        if *identifier == self.initiator_identifier {
            Some(TransferRole::Initiator)
        } else if *identifier == self.responder_identifier {
            Some(TransferRole::Responder)
        } else {
            None
        }
    }

    /// `meta.routingId`, used to correlate transfers across hops.
    pub fn routing_id(&self) -> Option<Hash> {
        self.meta.get("routingId")?.as_str()?.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sig::Signer;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn balance(a: u64, b: u64) -> Balance {
        Balance {
            amount: [a.into(), b.into()],
            to: [Address([1; 20]), Address([2; 20])],
        }
    }

    #[test]
    fn linked_transfer_resolution() {
        let pre_image = Hash([7; 32]);
        let state = TransferState::Linked(LinkedTransferState {
            balance: balance(10, 0),
            linked_hash: linked_hash(&pre_image),
        });

        let paid = state
            .resolve(&TransferResolver::Linked(LinkedTransferResolver { pre_image }))
            .unwrap();
        assert_eq!(paid.amount, [0.into(), 10.into()]);

        let cancelled = state
            .resolve(&TransferResolver::Linked(LinkedTransferResolver {
                pre_image: Hash::default(),
            }))
            .unwrap();
        assert_eq!(cancelled, balance(10, 0));

        let wrong = state.resolve(&TransferResolver::Linked(LinkedTransferResolver {
            pre_image: Hash([8; 32]),
        }));
        assert!(matches!(wrong, Err(TransferError::InvalidPreImage)));
    }

    #[test]
    fn withdraw_resolution() {
        let mut rng = StdRng::seed_from_u64(0);
        let initiator = Signer::new(&mut rng);
        let responder = Signer::new(&mut rng);
        let data: Hash = rng.gen();

        let state = TransferState::Withdraw(WithdrawState {
            balance: balance(10, 0),
            initiator_signature: initiator.sign_eth(data).unwrap(),
            signers: [initiator.address(), responder.address()],
            data,
            nonce: 1.into(),
            fee: 2.into(),
        });

        let resolved = state
            .resolve(&TransferResolver::Withdraw(WithdrawResolver {
                responder_signature: responder.sign_eth(data).unwrap(),
            }))
            .unwrap();
        assert_eq!(resolved.amount, [0.into(), 2.into()]);

        // Signed by the wrong party.
        let forged = state.resolve(&TransferResolver::Withdraw(WithdrawResolver {
            responder_signature: initiator.sign_eth(data).unwrap(),
        }));
        assert!(matches!(forged, Err(TransferError::InvalidSignature(a)) if a == responder.address()));

        let cancelled = state
            .resolve(&TransferResolver::Withdraw(WithdrawResolver {
                responder_signature: Signature::default(),
            }))
            .unwrap();
        assert_eq!(cancelled, balance(10, 0));
    }

    #[test]
    fn resolver_must_match_kind() {
        let state = TransferState::Linked(LinkedTransferState {
            balance: balance(1, 0),
            linked_hash: Hash::default(),
        });
        let res = state.resolve(&TransferResolver::Withdraw(WithdrawResolver {
            responder_signature: Signature([1; 65]),
        }));
        assert!(matches!(res, Err(TransferError::ResolverMismatch { .. })));
    }

    #[test]
    fn encodings_identify_kind() {
        assert_eq!(
            TransferKind::from_encodings(&TransferKind::Withdraw.encodings()),
            Some(TransferKind::Withdraw)
        );
        assert_eq!(
            TransferKind::from_encodings(&[LINKED_TRANSFER_STATE_ENCODING]),
            None
        );
        assert_eq!(
            TransferKind::from_encodings(&[WITHDRAW_STATE_ENCODING, LINKED_TRANSFER_RESOLVER_ENCODING]),
            None
        );
    }

    #[test]
    fn transfer_id_is_packed_keccak() {
        let definition = Address([0xaa; 20]);
        let channel = Address([0xbb; 20]);
        let id = transfer_id(definition, channel, 3.into(), 4);

        let mut expected = vec![0xaa; 20];
        expected.extend_from_slice(&[0xbb; 20]);
        expected.extend_from_slice(&[0; 31]);
        expected.push(3);
        expected.extend_from_slice(&[0; 31]);
        expected.push(4);
        assert_eq!(id, keccak256(&expected));
        assert_ne!(id, transfer_id(definition, channel, 3.into(), 5));
    }

    #[test]
    fn withdraw_state_encodes_signature_as_bytes() {
        let state = WithdrawState {
            balance: balance(1, 0),
            initiator_signature: Signature([0x11; 65]),
            signers: [Address([1; 20]), Address([2; 20])],
            data: Hash([3; 32]),
            nonce: 1.into(),
            fee: 0.into(),
        };
        let encoded = abiencode::encode(&state).unwrap();
        // offset, balance (4), sig offset, signers (2), data, nonce, fee,
        // sig length, sig (3 slots)
        assert_eq!(encoded.len(), 32 * (1 + 4 + 1 + 2 + 3 + 1 + 3));
    }
}
