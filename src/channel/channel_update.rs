use core::fmt;

use super::{Balance, NetworkContext, PartIdx, PARTICIPANTS};
use crate::{
    abiencode::types::{Address, Hash, Signature, U256},
    sig::PublicIdentifier,
    transfer::{TransferResolver, TransferState},
};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateType {
    Setup,
    Deposit,
    Create,
    Resolve,
}

impl UpdateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateType::Setup => "setup",
            UpdateType::Deposit => "deposit",
            UpdateType::Create => "create",
            UpdateType::Resolve => "resolve",
        }
    }
}

impl fmt::Display for UpdateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupDetails {
    pub timeout: U256,
    pub network_context: NetworkContext,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositDetails {
    pub latest_deposit_nonce: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDetails {
    pub transfer_id: Hash,
    pub transfer_definition: Address,
    pub transfer_timeout: U256,
    pub transfer_initial_state: TransferState,
    pub transfer_encodings: Vec<String>,
    /// Proof of the new transfer against `merkle_root`.
    pub merkle_proof_data: Vec<Hash>,
    pub merkle_root: Hash,
    pub meta: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveDetails {
    pub transfer_id: Hash,
    pub transfer_definition: Address,
    pub transfer_resolver: TransferResolver,
    pub merkle_root: Hash,
    pub meta: serde_json::Value,
}

/// Type specific payload of a [ChannelUpdate].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum UpdateDetails {
    Setup(SetupDetails),
    Deposit(DepositDetails),
    Create(CreateDetails),
    Resolve(ResolveDetails),
}

impl UpdateDetails {
    pub fn update_type(&self) -> UpdateType {
        match self {
            UpdateDetails::Setup(_) => UpdateType::Setup,
            UpdateDetails::Deposit(_) => UpdateType::Deposit,
            UpdateDetails::Create(_) => UpdateType::Create,
            UpdateDetails::Resolve(_) => UpdateType::Resolve,
        }
    }

    /// Transfer referenced by create and resolve updates.
    pub fn transfer_id(&self) -> Option<Hash> {
        match self {
            UpdateDetails::Create(d) => Some(d.transfer_id),
            UpdateDetails::Resolve(d) => Some(d.transfer_id),
            _ => None,
        }
    }
}

/// A single step of the channel, proposed by `from_identifier` and
/// counter-signed by `to_identifier`.
///
/// Once both signatures are present the update is canonical and must not be
/// changed anymore.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelUpdate {
    pub channel_address: Address,
    pub from_identifier: PublicIdentifier,
    pub to_identifier: PublicIdentifier,
    #[serde(rename = "type")]
    pub update_type: UpdateType,
    pub nonce: u64,
    /// Post-update balance of `asset_id`.
    pub balance: Balance,
    pub asset_id: Address,
    pub details: UpdateDetails,
    /// `[alice, bob]`
    pub signatures: [Option<Signature>; PARTICIPANTS],
}

impl ChannelUpdate {
    pub fn is_double_signed(&self) -> bool {
        self.signatures.iter().all(Option::is_some)
    }

    /// Whether `update_type` and the variant of `details` agree.
    pub fn has_consistent_type(&self) -> bool {
        self.update_type == self.details.update_type()
    }

    pub fn signature(&self, idx: PartIdx) -> Option<&Signature> {
        self.signatures.get(idx).and_then(Option::as_ref)
    }
}
