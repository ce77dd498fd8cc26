//! In-memory implementations of the [services](crate::services), for tests
//! and for running several protocol instances inside one process.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use crate::{
    abiencode::types::{Address, Hash, U256},
    channel::{Balance, ChannelDispute, ChannelUpdate, FullChannelState, UpdateDetails},
    services::{
        ChainError, ChainReader, Inbox, LatestDeposit, LockError, LockService, Messaging,
        MessagingError, ProtocolMessage, ProtocolMessageHandler, ProtocolResponse, Store,
        StoreError,
    },
    sig::PublicIdentifier,
    sync::InboundError,
    transfer::FullTransferState,
};
use async_trait::async_trait;
use tokio::sync::{oneshot, OwnedMutexGuard};
use tracing::{debug, trace};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct StoreInner {
    channels: HashMap<Address, FullChannelState>,
    transfers: HashMap<Hash, FullTransferState>,
    /// Active transfer ids per channel, in creation order.
    active: HashMap<Address, Vec<Hash>>,
    disputes: HashMap<Address, ChannelDispute>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_channel_state(
        &self,
        channel_address: &Address,
    ) -> Result<Option<FullChannelState>, StoreError> {
        Ok(lock(&self.inner).channels.get(channel_address).cloned())
    }

    async fn get_channel_state_by_participants(
        &self,
        alice: &PublicIdentifier,
        bob: &PublicIdentifier,
        chain_id: u64,
    ) -> Result<Option<FullChannelState>, StoreError> {
        Ok(lock(&self.inner)
            .channels
            .values()
            .find(|c| {
                c.alice_identifier == *alice
                    && c.bob_identifier == *bob
                    && c.network_context.chain_id == chain_id
            })
            .cloned())
    }

    async fn get_channel_states(&self) -> Result<Vec<FullChannelState>, StoreError> {
        Ok(lock(&self.inner).channels.values().cloned().collect())
    }

    async fn save_channel_state(
        &self,
        channel: &FullChannelState,
        transfer: Option<&FullTransferState>,
    ) -> Result<(), StoreError> {
        let mut inner = lock(&self.inner);
        let details = channel.latest_update.as_ref().map(|u| &u.details);
        match (details, transfer) {
            (Some(UpdateDetails::Create(_)), Some(transfer)) => {
                inner
                    .active
                    .entry(channel.channel_address)
                    .or_default()
                    .push(transfer.transfer_id);
                inner.transfers.insert(transfer.transfer_id, transfer.clone());
            }
            (Some(UpdateDetails::Resolve(_)), Some(transfer)) => {
                if let Some(active) = inner.active.get_mut(&channel.channel_address) {
                    active.retain(|id| *id != transfer.transfer_id);
                }
                inner.transfers.insert(transfer.transfer_id, transfer.clone());
            }
            (Some(UpdateDetails::Create(_) | UpdateDetails::Resolve(_)), None) => {
                return Err(StoreError::Inconsistent(
                    "transfer update saved without its transfer".into(),
                ))
            }
            _ => {}
        }
        inner
            .channels
            .insert(channel.channel_address, channel.clone());
        Ok(())
    }

    async fn get_active_transfers(
        &self,
        channel_address: &Address,
    ) -> Result<Vec<FullTransferState>, StoreError> {
        let inner = lock(&self.inner);
        let ids = inner.active.get(channel_address).map(Vec::as_slice).unwrap_or_default();
        ids.iter()
            .map(|id| {
                inner.transfers.get(id).cloned().ok_or_else(|| {
                    StoreError::Inconsistent(format!("active transfer {id:?} is missing"))
                })
            })
            .collect()
    }

    async fn get_transfer_state(
        &self,
        transfer_id: &Hash,
    ) -> Result<Option<FullTransferState>, StoreError> {
        Ok(lock(&self.inner).transfers.get(transfer_id).cloned())
    }

    async fn get_transfer_by_routing_id(
        &self,
        channel_address: &Address,
        routing_id: &Hash,
    ) -> Result<Option<FullTransferState>, StoreError> {
        Ok(lock(&self.inner)
            .transfers
            .values()
            .find(|t| t.channel_address == *channel_address && t.routing_id() == Some(*routing_id))
            .cloned())
    }

    async fn save_channel_dispute(
        &self,
        channel: &FullChannelState,
        dispute: &ChannelDispute,
    ) -> Result<(), StoreError> {
        let mut inner = lock(&self.inner);
        inner
            .channels
            .insert(channel.channel_address, channel.clone());
        inner
            .disputes
            .insert(channel.channel_address, dispute.clone());
        Ok(())
    }

    async fn get_channel_dispute(
        &self,
        channel_address: &Address,
    ) -> Result<Option<ChannelDispute>, StoreError> {
        Ok(lock(&self.inner).disputes.get(channel_address).cloned())
    }
}

#[derive(Default)]
struct ChainInner {
    /// Keyed by (channel, asset).
    balances: HashMap<(Address, Address), U256>,
    deposits: HashMap<(Address, Address), LatestDeposit>,
    disputes: HashMap<Address, ChannelDispute>,
    block_number: u64,
}

/// Simulated chain, resolving transfers with their built-in rules.
pub struct MemoryChainReader {
    chain_id: u64,
    proxy_bytecode: Vec<u8>,
    inner: Mutex<ChainInner>,
}

impl MemoryChainReader {
    pub fn new(chain_id: u64, proxy_bytecode: Vec<u8>) -> Self {
        Self {
            chain_id,
            proxy_bytecode,
            inner: Mutex::default(),
        }
    }

    fn check_chain(&self, chain_id: u64) -> Result<(), ChainError> {
        if chain_id != self.chain_id {
            return Err(ChainError::UnsupportedChain(chain_id));
        }
        Ok(())
    }

    /// Deposit by alice, tracked with a deposit nonce.
    pub fn deposit_alice(&self, channel: Address, asset: Address, amount: U256) {
        let mut inner = lock(&self.inner);
        *inner.balances.entry((channel, asset)).or_default() += amount;
        let latest = inner.deposits.entry((channel, asset)).or_default();
        latest.nonce += 1;
        latest.amount = amount;
    }

    /// Deposit by bob, a plain transfer to the channel.
    pub fn deposit_bob(&self, channel: Address, asset: Address, amount: U256) {
        *lock(&self.inner).balances.entry((channel, asset)).or_default() += amount;
    }

    pub fn set_block_number(&self, block_number: u64) {
        lock(&self.inner).block_number = block_number;
    }

    pub fn set_dispute(&self, channel: Address, dispute: ChannelDispute) {
        lock(&self.inner).disputes.insert(channel, dispute);
    }
}

#[async_trait]
impl ChainReader for MemoryChainReader {
    async fn channel_factory_bytecode(
        &self,
        _channel_factory: &Address,
        chain_id: u64,
    ) -> Result<Vec<u8>, ChainError> {
        self.check_chain(chain_id)?;
        Ok(self.proxy_bytecode.clone())
    }

    async fn latest_deposit_by_asset(
        &self,
        channel_address: &Address,
        asset_id: &Address,
        chain_id: u64,
    ) -> Result<LatestDeposit, ChainError> {
        self.check_chain(chain_id)?;
        Ok(lock(&self.inner)
            .deposits
            .get(&(*channel_address, *asset_id))
            .copied()
            .unwrap_or_default())
    }

    async fn channel_onchain_balance(
        &self,
        channel_address: &Address,
        asset_id: &Address,
        chain_id: u64,
    ) -> Result<U256, ChainError> {
        self.check_chain(chain_id)?;
        Ok(lock(&self.inner)
            .balances
            .get(&(*channel_address, *asset_id))
            .copied()
            .unwrap_or_default())
    }

    async fn resolve(
        &self,
        transfer: &FullTransferState,
        chain_id: u64,
    ) -> Result<Balance, ChainError> {
        self.check_chain(chain_id)?;
        let resolver = transfer
            .transfer_resolver
            .as_ref()
            .ok_or_else(|| ChainError::ResolveFailed("transfer has no resolver".into()))?;
        transfer
            .transfer_state
            .resolve(resolver)
            .map_err(|e| ChainError::ResolveFailed(e.to_string()))
    }

    async fn block_number(&self, chain_id: u64) -> Result<u64, ChainError> {
        self.check_chain(chain_id)?;
        Ok(lock(&self.inner).block_number)
    }

    async fn channel_dispute(
        &self,
        channel_address: &Address,
        chain_id: u64,
    ) -> Result<Option<ChannelDispute>, ChainError> {
        self.check_chain(chain_id)?;
        Ok(lock(&self.inner).disputes.get(channel_address).cloned())
    }
}

/// Sender of a request and where its response goes.
type PendingResponse = (
    PublicIdentifier,
    oneshot::Sender<Result<ProtocolResponse, InboundError>>,
);

#[derive(Default)]
struct HubInner {
    handlers: HashMap<PublicIdentifier, ProtocolMessageHandler>,
    pending: HashMap<Inbox, PendingResponse>,
    offline: HashSet<PublicIdentifier>,
}

/// Routes protocol messages between the [MemoryMessaging] endpoints
/// connected to it.
#[derive(Default)]
pub struct MemoryMessagingHub {
    inner: Mutex<HubInner>,
    next_inbox: AtomicU64,
}

impl MemoryMessagingHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Endpoint sending as `identifier`.
    pub fn endpoint(self: &Arc<Self>, identifier: PublicIdentifier) -> MemoryMessaging {
        MemoryMessaging {
            hub: Arc::clone(self),
            identifier,
        }
    }

    /// Drop every message and response addressed to `identifier` while
    /// offline.
    pub fn set_offline(&self, identifier: &PublicIdentifier, offline: bool) {
        let mut inner = lock(&self.inner);
        if offline {
            inner.offline.insert(identifier.clone());
        } else {
            inner.offline.remove(identifier);
        }
    }

    fn respond(
        &self,
        inbox: &Inbox,
        response: Result<ProtocolResponse, InboundError>,
    ) -> Result<(), MessagingError> {
        let mut inner = lock(&self.inner);
        let owner = match inner.pending.get(inbox) {
            Some((owner, _)) => owner,
            None => return Err(MessagingError::Transport(format!("unknown inbox {}", inbox.0))),
        };
        if inner.offline.contains(owner) {
            // The sender stays pending until its own timeout.
            trace!(to = %owner, "response dropped");
            return Ok(());
        }
        match inner.pending.remove(inbox) {
            Some((_, tx)) => tx
                .send(response)
                .map_err(|_| MessagingError::Transport(format!("{} is gone", inbox.0))),
            None => Err(MessagingError::Transport(format!("unknown inbox {}", inbox.0))),
        }
    }
}

pub struct MemoryMessaging {
    hub: Arc<MemoryMessagingHub>,
    identifier: PublicIdentifier,
}

#[async_trait]
impl Messaging for MemoryMessaging {
    async fn send_protocol_message(
        &self,
        update: &ChannelUpdate,
        previous_update: Option<&ChannelUpdate>,
        timeout: Duration,
        retries: u32,
    ) -> Result<ProtocolResponse, MessagingError> {
        for attempt in 0..=retries {
            let inbox = Inbox(format!(
                "{}.{}",
                self.identifier,
                self.hub.next_inbox.fetch_add(1, Ordering::Relaxed)
            ));
            let (tx, rx) = oneshot::channel();
            let handler = {
                let mut inner = lock(&self.hub.inner);
                inner
                    .pending
                    .insert(inbox.clone(), (self.identifier.clone(), tx));
                if inner.offline.contains(&update.to_identifier) {
                    None
                } else {
                    inner.handlers.get(&update.to_identifier).cloned()
                }
            };
            match handler {
                Some(handler) => handler(ProtocolMessage {
                    update: update.clone(),
                    previous_update: previous_update.cloned(),
                    inbox: inbox.clone(),
                }),
                None => trace!(to = %update.to_identifier, "message dropped"),
            }

            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(Ok(response))) => return Ok(response),
                Ok(Ok(Err(err))) => return Err(MessagingError::Counterparty(Box::new(err))),
                Ok(Err(_)) => {
                    return Err(MessagingError::Transport("response channel closed".into()))
                }
                Err(_) => {
                    lock(&self.hub.inner).pending.remove(&inbox);
                    debug!(attempt, to = %update.to_identifier, "protocol message timed out");
                }
            }
        }
        Err(MessagingError::Timeout(timeout))
    }

    async fn on_receive_protocol_message(
        &self,
        identifier: &PublicIdentifier,
        handler: ProtocolMessageHandler,
    ) -> Result<(), MessagingError> {
        lock(&self.hub.inner)
            .handlers
            .insert(identifier.clone(), handler);
        Ok(())
    }

    async fn respond_to_protocol_message(
        &self,
        inbox: &Inbox,
        update: &ChannelUpdate,
        previous_update: Option<&ChannelUpdate>,
    ) -> Result<(), MessagingError> {
        self.hub.respond(
            inbox,
            Ok(ProtocolResponse {
                update: update.clone(),
                previous_update: previous_update.cloned(),
            }),
        )
    }

    async fn respond_with_protocol_error(
        &self,
        inbox: &Inbox,
        error: &InboundError,
    ) -> Result<(), MessagingError> {
        self.hub.respond(inbox, Err(error.clone()))
    }
}

/// Per-channel locks held until released with the returned key.
#[derive(Default)]
pub struct MemoryLockService {
    locks: Mutex<HashMap<Address, Arc<tokio::sync::Mutex<()>>>>,
    held: Mutex<HashMap<String, OwnedMutexGuard<()>>>,
    next_key: AtomicU64,
}

impl MemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockService for MemoryLockService {
    async fn acquire_lock(
        &self,
        lock_name: &Address,
        _is_alice: bool,
        _counterparty: &PublicIdentifier,
    ) -> Result<String, LockError> {
        let mutex = Arc::clone(lock(&self.locks).entry(*lock_name).or_default());
        let guard = mutex.lock_owned().await;
        let key = format!(
            "{}:{}",
            lock_name,
            self.next_key.fetch_add(1, Ordering::Relaxed)
        );
        lock(&self.held).insert(key.clone(), guard);
        Ok(key)
    }

    async fn release_lock(
        &self,
        lock_name: &Address,
        lock_value: &str,
        _is_alice: bool,
        _counterparty: &PublicIdentifier,
    ) -> Result<(), LockError> {
        match lock(&self.held).remove(lock_value) {
            Some(guard) => {
                drop(guard);
                Ok(())
            }
            None => Err(LockError::NotHeld(*lock_name)),
        }
    }
}
