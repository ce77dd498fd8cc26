use super::{Balance, ChannelUpdate, NetworkContext, PartIdx, PARTICIPANTS};
use crate::{
    abiencode::{
        self,
        types::{Address, Hash, Signature, U256},
    },
    sig::{self, PublicIdentifier, Signer},
};
use serde::Serialize;

/// Complete off-chain view of a channel, as kept by both participants.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FullChannelState {
    pub channel_address: Address,
    pub alice: Address,
    pub bob: Address,
    pub alice_identifier: PublicIdentifier,
    pub bob_identifier: PublicIdentifier,
    pub network_context: NetworkContext,
    pub nonce: u64,
    pub asset_ids: Vec<Address>,
    /// Same order as `asset_ids`.
    pub balances: Vec<Balance>,
    /// Amount escrowed in active transfers, same order as `asset_ids`.
    pub locked_balance: Vec<U256>,
    pub latest_deposit_nonce: u64,
    pub merkle_root: Hash,
    pub latest_update: Option<ChannelUpdate>,
    pub timeout: U256,
    pub in_dispute: bool,
}

/// The part of the channel state both parties sign and that can be enforced
/// on-chain.
#[derive(Debug, Clone, Serialize)]
pub struct CoreChannelState {
    pub channel_address: Address,
    pub alice: Address,
    pub bob: Address,
    pub asset_ids: Vec<Address>,
    pub balances: Vec<Balance>,
    pub locked_balance: Vec<U256>,
    pub nonce: u64,
    pub latest_deposit_nonce: u64,
    pub timeout: U256,
    pub merkle_root: Hash,
}

#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error("missing signature of participant {0}")]
    Missing(PartIdx),
    #[error("signature of participant {idx} is from {recovered:?}, expected {expected:?}")]
    WrongSigner {
        idx: PartIdx,
        recovered: Address,
        expected: Address,
    },
    #[error("could not recover signer: {0}")]
    Recover(String),
    #[error("could not sign: {0}")]
    Sign(String),
    #[error("could not encode state: {0}")]
    Encoding(#[from] abiencode::Error),
}

impl FullChannelState {
    pub fn core(&self) -> CoreChannelState {
        CoreChannelState {
            channel_address: self.channel_address,
            alice: self.alice,
            bob: self.bob,
            asset_ids: self.asset_ids.clone(),
            balances: self.balances.clone(),
            locked_balance: self.locked_balance.clone(),
            nonce: self.nonce,
            latest_deposit_nonce: self.latest_deposit_nonce,
            timeout: self.timeout,
            merkle_root: self.merkle_root,
        }
    }

    /// `keccak256(abi.encode(core))`, the value signed by both parties.
    pub fn commitment_hash(&self) -> Result<Hash, abiencode::Error> {
        abiencode::to_hash(&self.core())
    }

    pub fn participants(&self) -> [Address; PARTICIPANTS] {
        [self.alice, self.bob]
    }

    pub fn identifiers(&self) -> [&PublicIdentifier; PARTICIPANTS] {
        [&self.alice_identifier, &self.bob_identifier]
    }

    /// Index of `identifier` in the channel, `None` if it is not a
    /// participant.
    pub fn part_idx(&self, identifier: &PublicIdentifier) -> Option<PartIdx> {
        self.identifiers().iter().position(|id| *id == identifier)
    }

    pub fn asset_index(&self, asset_id: &Address) -> Option<usize> {
        self.asset_ids.iter().position(|a| a == asset_id)
    }

    pub fn counterparty_identifier(&self, own: &PublicIdentifier) -> &PublicIdentifier {
        if *own == self.alice_identifier {
            &self.bob_identifier
        } else {
            &self.alice_identifier
        }
    }

    /// Sign the commitment of this state.
    pub fn sign(&self, signer: &Signer) -> Result<Signature, SignatureError> {
        let hash = self.commitment_hash()?;
        signer
            .sign_eth(hash)
            .map_err(|e| SignatureError::Sign(e.to_string()))
    }

    /// Check that every present signature in `signatures` belongs to the
    /// matching participant and that at least `required` of them exist.
    pub fn verify_signatures(
        &self,
        signatures: &[Option<Signature>; PARTICIPANTS],
        required: &[PartIdx],
    ) -> Result<(), SignatureError> {
        let hash = self.commitment_hash()?;
        for idx in required {
            if signatures[*idx].is_none() {
                return Err(SignatureError::Missing(*idx));
            }
        }
        for (idx, (sig, expected)) in signatures.iter().zip(self.participants()).enumerate() {
            if let Some(sig) = sig {
                let recovered = sig::recover_signer(hash, sig)
                    .map_err(|e| SignatureError::Recover(e.to_string()))?;
                if recovered != expected {
                    return Err(SignatureError::WrongSigner {
                        idx,
                        recovered,
                        expected,
                    });
                }
            }
        }
        Ok(())
    }

    /// Shorthand for checking both signatures.
    pub fn verify_double_signed(
        &self,
        signatures: &[Option<Signature>; PARTICIPANTS],
    ) -> Result<(), SignatureError> {
        self.verify_signatures(signatures, &[0, 1])
    }
}

/// Dispute recorded on-chain for a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelDispute {
    pub channel_state_hash: Hash,
    pub nonce: u64,
    pub merkle_root: Hash,
    pub consensus_expiry: u64,
    pub defund_expiry: u64,
}
