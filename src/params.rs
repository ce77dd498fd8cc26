//! Caller supplied parameters of the protocol methods.
//!
//! The `*Input` types mirror the JSON accepted at the boundary, every
//! number, address and hash is a string there. [UpdateParams] is the
//! validated form passed through the protocol.

use core::str::FromStr;

use crate::{
    abiencode::types::{Address, Hash, Signature, U256},
    channel::{Balance, NetworkContext, UpdateType},
    sig::PublicIdentifier,
    transfer::{
        LinkedTransferResolver, LinkedTransferState, TransferKind, TransferResolver,
        TransferState, WithdrawResolver, WithdrawState,
    },
};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {field}: {reason}")]
pub struct ValidationError {
    pub field: &'static str,
    pub reason: String,
}

impl ValidationError {
    fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SetupParams {
    pub counterparty_identifier: PublicIdentifier,
    pub timeout: U256,
    pub network_context: NetworkContext,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateParams {
    pub amount: U256,
    pub asset_id: Address,
    pub transfer_definition: Address,
    pub transfer_initial_state: TransferState,
    pub timeout: U256,
    pub encodings: Vec<String>,
    pub meta: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolveParams {
    pub transfer_id: Hash,
    pub transfer_resolver: TransferResolver,
    pub meta: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParamsDetails {
    Setup(SetupParams),
    Deposit { asset_id: Address },
    Create(CreateParams),
    Resolve(ResolveParams),
}

/// Validated parameters of an update to propose.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateParams {
    pub channel_address: Address,
    pub details: ParamsDetails,
}

impl UpdateParams {
    pub fn update_type(&self) -> UpdateType {
        match self.details {
            ParamsDetails::Setup(_) => UpdateType::Setup,
            ParamsDetails::Deposit { .. } => UpdateType::Deposit,
            ParamsDetails::Create(_) => UpdateType::Create,
            ParamsDetails::Resolve(_) => UpdateType::Resolve,
        }
    }
}

fn parse<T: FromStr>(field: &'static str, value: &str, expected: &str) -> Result<T, ValidationError> {
    value
        .parse()
        .map_err(|_| ValidationError::new(field, format!("{value:?} is not {expected}")))
}

fn parse_address(field: &'static str, value: &str) -> Result<Address, ValidationError> {
    parse(field, value, "an address")
}

fn parse_hash(field: &'static str, value: &str) -> Result<Hash, ValidationError> {
    parse(field, value, "a bytes32 hex string")
}

fn parse_signature(field: &'static str, value: &str) -> Result<Signature, ValidationError> {
    parse(field, value, "a signature")
}

/// Unsigned decimal integer.
fn parse_integer(field: &'static str, value: &str) -> Result<U256, ValidationError> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ValidationError::new(
            field,
            format!("{value:?} is not a decimal integer"),
        ));
    }
    U256::from_dec_str(value).map_err(|_| ValidationError::new(field, "value does not fit 256 bits"))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkContextInput {
    pub chain_id: u64,
    pub provider_url: String,
    pub channel_factory_address: String,
    pub channel_mastercopy_address: String,
    #[serde(default)]
    pub linked_transfer_definition: Option<String>,
    #[serde(default)]
    pub withdraw_definition: Option<String>,
}

impl NetworkContextInput {
    pub fn validate(&self) -> Result<NetworkContext, ValidationError> {
        if self.chain_id < 1 {
            return Err(ValidationError::new("chainId", "must be at least 1"));
        }
        if !self.provider_url.contains("://") {
            return Err(ValidationError::new("providerUrl", "not a URL"));
        }
        let definition = |field, value: &Option<String>| {
            value.as_deref().map(|v| parse_address(field, v)).transpose()
        };
        Ok(NetworkContext {
            chain_id: self.chain_id,
            provider_url: self.provider_url.clone(),
            channel_factory_address: parse_address(
                "channelFactoryAddress",
                &self.channel_factory_address,
            )?,
            channel_mastercopy_address: parse_address(
                "channelMastercopyAddress",
                &self.channel_mastercopy_address,
            )?,
            linked_transfer_definition: definition(
                "linkedTransferDefinition",
                &self.linked_transfer_definition,
            )?,
            withdraw_definition: definition("withdrawDefinition", &self.withdraw_definition)?,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupInput {
    pub counterparty_identifier: String,
    pub timeout: String,
    pub network_context: NetworkContextInput,
}

impl SetupInput {
    /// The channel address is derived by the protocol, so setup validates
    /// into [SetupParams] only.
    pub fn validate(&self) -> Result<SetupParams, ValidationError> {
        Ok(SetupParams {
            counterparty_identifier: self
                .counterparty_identifier
                .parse()
                .map_err(|e| ValidationError::new("counterpartyIdentifier", format!("{e}")))?,
            timeout: parse_integer("timeout", &self.timeout)?,
            network_context: self.network_context.validate()?,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositInput {
    pub channel_address: String,
    pub asset_id: String,
}

impl DepositInput {
    pub fn validate(&self) -> Result<UpdateParams, ValidationError> {
        Ok(UpdateParams {
            channel_address: parse_address("channelAddress", &self.channel_address)?,
            details: ParamsDetails::Deposit {
                asset_id: parse_address("assetId", &self.asset_id)?,
            },
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
struct BalanceInput {
    amount: Vec<String>,
    to: Vec<String>,
}

impl BalanceInput {
    fn validate(&self) -> Result<Balance, ValidationError> {
        if self.amount.len() != 2 || self.to.len() != 2 {
            return Err(ValidationError::new("balance", "expected two entries"));
        }
        Ok(Balance {
            amount: [
                parse_integer("balance.amount", &self.amount[0])?,
                parse_integer("balance.amount", &self.amount[1])?,
            ],
            to: [
                parse_address("balance.to", &self.to[0])?,
                parse_address("balance.to", &self.to[1])?,
            ],
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LinkedStateInput {
    balance: BalanceInput,
    linked_hash: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WithdrawStateInput {
    balance: BalanceInput,
    initiator_signature: String,
    signers: Vec<String>,
    data: String,
    nonce: String,
    fee: String,
}

fn from_value<T: serde::de::DeserializeOwned>(
    field: &'static str,
    value: &Value,
) -> Result<T, ValidationError> {
    serde_json::from_value(value.clone()).map_err(|e| ValidationError::new(field, e.to_string()))
}

/// Parse an initial state of the kind described by `encodings`.
pub fn parse_transfer_state(
    encodings: &[String],
    value: &Value,
) -> Result<TransferState, ValidationError> {
    const FIELD: &str = "transferInitialState";
    let kind = TransferKind::from_encodings(encodings)
        .ok_or_else(|| ValidationError::new("encodings", "unknown transfer encodings"))?;
    Ok(match kind {
        TransferKind::Linked => {
            let input: LinkedStateInput = from_value(FIELD, value)?;
            TransferState::Linked(LinkedTransferState {
                balance: input.balance.validate()?,
                linked_hash: parse_hash("linkedHash", &input.linked_hash)?,
            })
        }
        TransferKind::Withdraw => {
            let input: WithdrawStateInput = from_value(FIELD, value)?;
            if input.signers.len() != 2 {
                return Err(ValidationError::new("signers", "expected two signers"));
            }
            TransferState::Withdraw(WithdrawState {
                balance: input.balance.validate()?,
                initiator_signature: parse_signature(
                    "initiatorSignature",
                    &input.initiator_signature,
                )?,
                signers: [
                    parse_address("signers", &input.signers[0])?,
                    parse_address("signers", &input.signers[1])?,
                ],
                data: parse_hash("data", &input.data)?,
                nonce: parse_integer("nonce", &input.nonce)?,
                fee: parse_integer("fee", &input.fee)?,
            })
        }
    })
}

/// Resolvers are told apart by their only field.
pub fn parse_transfer_resolver(value: &Value) -> Result<TransferResolver, ValidationError> {
    const FIELD: &str = "transferResolver";
    let field = |name| value.get(name).and_then(Value::as_str);
    match (field("preImage"), field("responderSignature")) {
        (Some(pre_image), None) => Ok(TransferResolver::Linked(LinkedTransferResolver {
            pre_image: parse_hash("preImage", pre_image)?,
        })),
        (None, Some(sig)) => Ok(TransferResolver::Withdraw(WithdrawResolver {
            responder_signature: parse_signature("responderSignature", sig)?,
        })),
        _ => Err(ValidationError::new(FIELD, "unknown resolver")),
    }
}

fn meta(value: &Option<Value>) -> Result<Value, ValidationError> {
    match value {
        None | Some(Value::Null) => Ok(Value::Object(Default::default())),
        Some(v @ Value::Object(_)) => Ok(v.clone()),
        Some(_) => Err(ValidationError::new("meta", "must be an object")),
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInput {
    pub channel_address: String,
    pub amount: String,
    pub asset_id: String,
    pub transfer_definition: String,
    pub transfer_initial_state: Value,
    pub timeout: String,
    pub encodings: Vec<String>,
    #[serde(default)]
    pub meta: Option<Value>,
}

impl CreateInput {
    pub fn validate(&self) -> Result<UpdateParams, ValidationError> {
        Ok(UpdateParams {
            channel_address: parse_address("channelAddress", &self.channel_address)?,
            details: ParamsDetails::Create(CreateParams {
                amount: parse_integer("amount", &self.amount)?,
                asset_id: parse_address("assetId", &self.asset_id)?,
                transfer_definition: parse_address(
                    "transferDefinition",
                    &self.transfer_definition,
                )?,
                transfer_initial_state: parse_transfer_state(
                    &self.encodings,
                    &self.transfer_initial_state,
                )?,
                timeout: parse_integer("timeout", &self.timeout)?,
                encodings: self.encodings.clone(),
                meta: meta(&self.meta)?,
            }),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveInput {
    pub channel_address: String,
    pub transfer_id: String,
    pub transfer_resolver: Value,
    #[serde(default)]
    pub meta: Option<Value>,
}

impl ResolveInput {
    pub fn validate(&self) -> Result<UpdateParams, ValidationError> {
        Ok(UpdateParams {
            channel_address: parse_address("channelAddress", &self.channel_address)?,
            details: ParamsDetails::Resolve(ResolveParams {
                transfer_id: parse_hash("transferId", &self.transfer_id)?,
                transfer_resolver: parse_transfer_resolver(&self.transfer_resolver)?,
                meta: meta(&self.meta)?,
            }),
        })
    }
}
