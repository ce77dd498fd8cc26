//! Interfaces of the collaborators the protocol relies on: persistence,
//! messaging, chain access, cross-process locking and application level
//! validation.
//!
//! In-memory implementations live in [crate::memory].

use std::{sync::Arc, time::Duration};

use crate::{
    abiencode::types::{Address, Hash, U256},
    channel::{Balance, ChannelDispute, ChannelUpdate, FullChannelState},
    config::ProtocolConfig,
    params::UpdateParams,
    sig::{PublicIdentifier, Signer},
    sync::InboundError,
    transfer::FullTransferState,
};
use async_trait::async_trait;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("inconsistent store data: {0}")]
    Inconsistent(String),
}

/// Durable storage of channels and transfers.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_channel_state(
        &self,
        channel_address: &Address,
    ) -> Result<Option<FullChannelState>, StoreError>;

    async fn get_channel_state_by_participants(
        &self,
        alice: &PublicIdentifier,
        bob: &PublicIdentifier,
        chain_id: u64,
    ) -> Result<Option<FullChannelState>, StoreError>;

    async fn get_channel_states(&self) -> Result<Vec<FullChannelState>, StoreError>;

    /// Persist `channel`. When its latest update is a create, `transfer` is
    /// added to the active transfers, when it is a resolve, `transfer` (with
    /// its resolver) replaces the stored one and leaves the active set.
    async fn save_channel_state(
        &self,
        channel: &FullChannelState,
        transfer: Option<&FullTransferState>,
    ) -> Result<(), StoreError>;

    async fn get_active_transfers(
        &self,
        channel_address: &Address,
    ) -> Result<Vec<FullTransferState>, StoreError>;

    /// Any transfer ever created, active or resolved.
    async fn get_transfer_state(
        &self,
        transfer_id: &Hash,
    ) -> Result<Option<FullTransferState>, StoreError>;

    async fn get_transfer_by_routing_id(
        &self,
        channel_address: &Address,
        routing_id: &Hash,
    ) -> Result<Option<FullTransferState>, StoreError>;

    async fn save_channel_dispute(
        &self,
        channel: &FullChannelState,
        dispute: &ChannelDispute,
    ) -> Result<(), StoreError>;

    async fn get_channel_dispute(
        &self,
        channel_address: &Address,
    ) -> Result<Option<ChannelDispute>, StoreError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ChainError {
    #[error("chain {0} is not supported")]
    UnsupportedChain(u64),
    #[error("chain read failed: {0}")]
    ReadFailed(String),
    #[error("transfer resolution failed: {0}")]
    ResolveFailed(String),
}

/// Most recent deposit made by alice into the channel for one asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LatestDeposit {
    pub nonce: u64,
    pub amount: U256,
}

/// Read-only access to the chain.
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Creation code of the channel proxy, used for CREATE2 address
    /// derivation.
    async fn channel_factory_bytecode(
        &self,
        channel_factory: &Address,
        chain_id: u64,
    ) -> Result<Vec<u8>, ChainError>;

    async fn latest_deposit_by_asset(
        &self,
        channel_address: &Address,
        asset_id: &Address,
        chain_id: u64,
    ) -> Result<LatestDeposit, ChainError>;

    /// Total amount of `asset_id` held by the channel contract.
    async fn channel_onchain_balance(
        &self,
        channel_address: &Address,
        asset_id: &Address,
        chain_id: u64,
    ) -> Result<U256, ChainError>;

    /// Run the transfer definition's resolve function, `transfer` must have
    /// its resolver set.
    async fn resolve(&self, transfer: &FullTransferState, chain_id: u64)
        -> Result<Balance, ChainError>;

    async fn block_number(&self, chain_id: u64) -> Result<u64, ChainError>;

    async fn channel_dispute(
        &self,
        channel_address: &Address,
        chain_id: u64,
    ) -> Result<Option<ChannelDispute>, ChainError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum MessagingError {
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("counterparty rejected update: {0}")]
    Counterparty(Box<InboundError>),
    #[error("transport failure: {0}")]
    Transport(String),
}

/// Opaque handle identifying where the response to a received protocol
/// message has to go.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Inbox(pub String);

/// Successful answer to a protocol message: the counter-signed update and
/// the update preceding it.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolResponse {
    pub update: ChannelUpdate,
    pub previous_update: Option<ChannelUpdate>,
}

/// Protocol message received from a counterparty.
#[derive(Debug, Clone)]
pub struct ProtocolMessage {
    pub update: ChannelUpdate,
    /// The update the sender applied before `update`, used to catch up.
    pub previous_update: Option<ChannelUpdate>,
    pub inbox: Inbox,
}

pub type ProtocolMessageHandler = Arc<dyn Fn(ProtocolMessage) + Send + Sync>;

/// Request/response messaging between channel participants.
#[async_trait]
pub trait Messaging: Send + Sync {
    /// Send `update` to its `to_identifier` and wait for the response.
    async fn send_protocol_message(
        &self,
        update: &ChannelUpdate,
        previous_update: Option<&ChannelUpdate>,
        timeout: Duration,
        retries: u32,
    ) -> Result<ProtocolResponse, MessagingError>;

    /// Deliver protocol messages addressed to `identifier` to `handler`.
    async fn on_receive_protocol_message(
        &self,
        identifier: &PublicIdentifier,
        handler: ProtocolMessageHandler,
    ) -> Result<(), MessagingError>;

    async fn respond_to_protocol_message(
        &self,
        inbox: &Inbox,
        update: &ChannelUpdate,
        previous_update: Option<&ChannelUpdate>,
    ) -> Result<(), MessagingError>;

    async fn respond_with_protocol_error(
        &self,
        inbox: &Inbox,
        error: &InboundError,
    ) -> Result<(), MessagingError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum LockError {
    #[error("could not acquire lock {0:?}: {1}")]
    Acquire(Address, String),
    #[error("lock {0:?} is not held with the given key")]
    NotHeld(Address),
}

/// Mutual exclusion per channel across processes.
///
/// Alice's side is the authority for a channel's lock, `is_alice` and the
/// counterparty tell implementations where to forward requests.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Returns the key needed to release the lock.
    async fn acquire_lock(
        &self,
        lock_name: &Address,
        is_alice: bool,
        counterparty: &PublicIdentifier,
    ) -> Result<String, LockError>;

    async fn release_lock(
        &self,
        lock_name: &Address,
        lock_value: &str,
        is_alice: bool,
        counterparty: &PublicIdentifier,
    ) -> Result<(), LockError>;
}

/// Application level checks run before an update is proposed or accepted.
///
/// The error string is forwarded to the caller (and to the counterparty for
/// inbound updates).
#[async_trait]
pub trait ExternalValidation: Send + Sync {
    async fn validate_inbound(
        &self,
        update: &ChannelUpdate,
        state: Option<&FullChannelState>,
        transfer: Option<&FullTransferState>,
    ) -> Result<(), String>;

    async fn validate_outbound(
        &self,
        params: &UpdateParams,
        state: Option<&FullChannelState>,
        transfer: Option<&FullTransferState>,
    ) -> Result<(), String>;
}

/// [ExternalValidation] accepting everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

#[async_trait]
impl ExternalValidation for AcceptAll {
    async fn validate_inbound(
        &self,
        _update: &ChannelUpdate,
        _state: Option<&FullChannelState>,
        _transfer: Option<&FullTransferState>,
    ) -> Result<(), String> {
        Ok(())
    }

    async fn validate_outbound(
        &self,
        _params: &UpdateParams,
        _state: Option<&FullChannelState>,
        _transfer: Option<&FullTransferState>,
    ) -> Result<(), String> {
        Ok(())
    }
}

/// Collaborators and settings shared by every channel of a protocol
/// instance.
pub struct Services {
    pub store: Arc<dyn Store>,
    pub messaging: Arc<dyn Messaging>,
    pub chain: Arc<dyn ChainReader>,
    pub lock: Arc<dyn LockService>,
    pub validation: Arc<dyn ExternalValidation>,
    pub signer: Arc<Signer>,
    pub config: ProtocolConfig,
}
