use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError, Weak},
};

use crate::{
    abiencode::types::{Address, Hash},
    channel::{FullChannelState, UpdateDetails},
    config::ConfigError,
    events::{ChannelUpdateEvent, ProtocolEvents},
    params::{
        CreateInput, DepositInput, ParamsDetails, ResolveInput, SetupInput, SetupParams,
        UpdateParams, ValidationError,
    },
    queue::{Interrupt, QueueError, SerializedQueue, Sequential, UpdateExecutor},
    services::{LockError, MessagingError, ProtocolMessage, Services, StoreError},
    sig::PublicIdentifier,
    sync::{
        self, InboundError, InboundMessage, InboundReason, OutboundError, OutboundReason,
        SyncOutcome,
    },
    transfer::FullTransferState,
    update::{channel_address_for, reconciled_deposit, GenerationError},
};
use async_trait::async_trait;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error(transparent)]
    InvalidParams(#[from] ValidationError),
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),
    #[error(transparent)]
    Outbound(#[from] OutboundError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Messaging(#[from] MessagingError),
    #[error("could not derive channel address: {0}")]
    ChannelAddress(#[from] GenerationError),
}

impl ProtocolError {
    /// Machine readable reason of the failure.
    pub fn reason(&self) -> &'static str {
        match self {
            ProtocolError::InvalidParams(_) => "InvalidParams",
            ProtocolError::InvalidConfig(_) => "InvalidConfig",
            ProtocolError::Outbound(e) => e.reason.as_str(),
            ProtocolError::Lock(_) => "LockFailed",
            ProtocolError::Store(_) => "StoreFailure",
            ProtocolError::Messaging(_) => "MessagingFailure",
            ProtocolError::ChannelAddress(_) => "Create2Failed",
        }
    }
}

/// Runs the updates of one channel on behalf of its queue.
pub struct ChannelExecutor {
    services: Arc<Services>,
    channel_address: Address,
}

#[async_trait]
impl UpdateExecutor for ChannelExecutor {
    type SelfUpdate = UpdateParams;
    type OtherUpdate = InboundMessage;
    type SelfOutput = SyncOutcome;
    type OtherOutput = SyncOutcome;
    type SelfError = OutboundError;
    type OtherError = InboundError;

    async fn current_nonce(&self) -> Result<u64, QueueError> {
        self.services
            .store
            .get_channel_state(&self.channel_address)
            .await
            .map(|c| c.map_or(0, |c| c.nonce))
            .map_err(|e| QueueError::NonceUnavailable(e.to_string()))
    }

    async fn execute_self(
        &self,
        params: &UpdateParams,
        interrupt: Interrupt,
    ) -> Option<Result<SyncOutcome, OutboundError>> {
        sync::outbound(params, &self.services, &interrupt).await
    }

    async fn execute_other(
        &self,
        message: &InboundMessage,
        interrupt: Interrupt,
    ) -> Option<Result<SyncOutcome, InboundError>> {
        sync::inbound(message, &self.services, &interrupt).await
    }

    fn other_nonce(&self, message: &InboundMessage) -> u64 {
        message.update.nonce
    }

    /// A message carrying the update we are missing may run as well, it
    /// catches up first.
    fn matches_nonce(&self, message: &InboundMessage, expected: u64) -> bool {
        message.update.nonce == expected
            || message
                .previous_update
                .as_ref()
                .map_or(false, |p| p.nonce == expected)
    }
}

type ChannelQueue = SerializedQueue<ChannelExecutor>;

struct Inner {
    services: Arc<Services>,
    events: ProtocolEvents,
    queues: Mutex<HashMap<Address, ChannelQueue>>,
}

/// A protocol instance, proposing and accepting channel updates on behalf
/// of one signer.
///
/// Updates of every channel run through that channel's queue. Our own
/// updates additionally hold the channel lock of the [LockService] while
/// they run.
///
/// [LockService]: crate::services::LockService
#[derive(Clone)]
pub struct ChannelProtocol {
    inner: Arc<Inner>,
}

impl ChannelProtocol {
    /// Start handling protocol messages and reconcile the stored channels
    /// with the chain.
    pub async fn connect(services: Services) -> Result<Self, ProtocolError> {
        services.config.validate()?;
        let inner = Arc::new(Inner {
            services: Arc::new(services),
            events: ProtocolEvents::default(),
            queues: Mutex::default(),
        });

        let weak: Weak<Inner> = Arc::downgrade(&inner);
        let identifier = inner.services.signer.public_identifier().clone();
        inner
            .services
            .messaging
            .on_receive_protocol_message(
                &identifier,
                Arc::new(move |message: ProtocolMessage| {
                    if let Some(inner) = weak.upgrade() {
                        tokio::spawn(async move { inner.handle_message(message).await });
                    }
                }),
            )
            .await?;

        let protocol = Self { inner };
        let channels = protocol.inner.services.store.get_channel_states().await?;
        protocol.inner.reconcile_disputes(&channels).await;
        if protocol.inner.services.config.sync_on_startup {
            protocol.inner.resync(&channels).await;
        }
        info!(identifier = %identifier, channels = channels.len(), "protocol connected");
        Ok(protocol)
    }

    pub fn public_identifier(&self) -> &PublicIdentifier {
        self.inner.services.signer.public_identifier()
    }

    pub fn signer_address(&self) -> Address {
        self.inner.services.signer.address()
    }

    pub fn events(&self) -> &ProtocolEvents {
        &self.inner.events
    }

    #[instrument(skip_all, fields(counterparty = %input.counterparty_identifier))]
    pub async fn setup(&self, input: &SetupInput) -> Result<FullChannelState, ProtocolError> {
        self.setup_with(input.validate()?).await
    }

    /// Set up a channel with us as alice.
    pub async fn setup_with(&self, params: SetupParams) -> Result<FullChannelState, ProtocolError> {
        let services = &self.inner.services;
        let channel_address = channel_address_for(
            services.signer.public_identifier(),
            &params.counterparty_identifier,
            &params.network_context,
            services.chain.as_ref(),
        )
        .await?;
        self.update(UpdateParams {
            channel_address,
            details: ParamsDetails::Setup(params),
        })
        .await
    }

    #[instrument(skip_all, fields(channel = %input.channel_address))]
    pub async fn deposit(&self, input: &DepositInput) -> Result<FullChannelState, ProtocolError> {
        self.update(input.validate()?).await
    }

    #[instrument(skip_all, fields(channel = %input.channel_address))]
    pub async fn create(&self, input: &CreateInput) -> Result<FullChannelState, ProtocolError> {
        self.update(input.validate()?).await
    }

    #[instrument(skip_all, fields(channel = %input.channel_address, transfer = %input.transfer_id))]
    pub async fn resolve(&self, input: &ResolveInput) -> Result<FullChannelState, ProtocolError> {
        self.update(input.validate()?).await
    }

    /// Propose an update from already validated params. Timeouts are retried
    /// up to `max_protocol_retries` times.
    pub async fn update(&self, params: UpdateParams) -> Result<FullChannelState, ProtocolError> {
        let config = &self.inner.services.config;
        let mut retry = 0;
        loop {
            match self.inner.execute(&params).await {
                Err(ProtocolError::Outbound(e))
                    if e.reason == OutboundReason::Timeout
                        && retry < config.max_protocol_retries =>
                {
                    retry += 1;
                    warn!(retry, channel = %params.channel_address, "update timed out, retrying");
                    tokio::time::sleep(config.retry_delay).await;
                }
                result => return result.map(|outcome| outcome.applied.updated_channel_state),
            }
        }
    }

    /// The next resolve of `transfer_id`, `None` if it does not happen
    /// within `resolve_timeout`.
    pub async fn wait_for_transfer_resolution(
        &self,
        transfer_id: Hash,
    ) -> Option<ChannelUpdateEvent> {
        self.inner
            .events
            .channel_update
            .wait_for(
                self.inner.services.config.resolve_timeout,
                Some(Arc::new(move |event: &ChannelUpdateEvent| {
                    matches!(
                        event.updated_channel_state.latest_update.as_ref().map(|u| &u.details),
                        Some(UpdateDetails::Resolve(d)) if d.transfer_id == transfer_id
                    )
                })),
            )
            .await
    }

    pub async fn get_channel_state(
        &self,
        channel_address: &Address,
    ) -> Result<Option<FullChannelState>, ProtocolError> {
        Ok(self
            .inner
            .services
            .store
            .get_channel_state(channel_address)
            .await?)
    }

    pub async fn get_channel_state_by_participants(
        &self,
        alice: &PublicIdentifier,
        bob: &PublicIdentifier,
        chain_id: u64,
    ) -> Result<Option<FullChannelState>, ProtocolError> {
        Ok(self
            .inner
            .services
            .store
            .get_channel_state_by_participants(alice, bob, chain_id)
            .await?)
    }

    pub async fn get_channel_states(&self) -> Result<Vec<FullChannelState>, ProtocolError> {
        Ok(self.inner.services.store.get_channel_states().await?)
    }

    pub async fn get_transfer_state(
        &self,
        transfer_id: &Hash,
    ) -> Result<Option<FullTransferState>, ProtocolError> {
        Ok(self
            .inner
            .services
            .store
            .get_transfer_state(transfer_id)
            .await?)
    }

    pub async fn get_active_transfers(
        &self,
        channel_address: &Address,
    ) -> Result<Vec<FullTransferState>, ProtocolError> {
        Ok(self
            .inner
            .services
            .store
            .get_active_transfers(channel_address)
            .await?)
    }
}

impl Inner {
    fn queue(&self, channel_address: Address, is_alice: bool) -> ChannelQueue {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(channel_address)
            .or_insert_with(|| {
                let executor = ChannelExecutor {
                    services: Arc::clone(&self.services),
                    channel_address,
                };
                SerializedQueue::new(Arc::new(executor), is_alice, Box::new(Sequential))
            })
            .clone()
    }

    fn post(&self, outcome: &SyncOutcome) {
        for event in outcome.events() {
            self.events.channel_update.post(event.clone());
        }
    }

    /// Whether we are alice and who the counterparty is. The proposer of a
    /// setup is alice.
    async fn roles(
        &self,
        params: &UpdateParams,
    ) -> Result<(bool, PublicIdentifier), ProtocolError> {
        if let ParamsDetails::Setup(setup) = &params.details {
            return Ok((true, setup.counterparty_identifier.clone()));
        }
        let own = self.services.signer.public_identifier();
        let channel = self
            .services
            .store
            .get_channel_state(&params.channel_address)
            .await?
            .ok_or_else(|| {
                OutboundError::new(
                    OutboundReason::ChannelNotFound,
                    format!("no channel at {}", params.channel_address),
                )
                .with_params(params)
            })?;
        Ok((
            channel.alice_identifier == *own,
            channel.counterparty_identifier(own).clone(),
        ))
    }

    #[instrument(skip_all, fields(channel = %params.channel_address, update_type = %params.update_type()))]
    async fn execute(&self, params: &UpdateParams) -> Result<SyncOutcome, ProtocolError> {
        let (is_alice, counterparty) = self.roles(params).await?;
        let lock = &self.services.lock;
        let key = lock
            .acquire_lock(&params.channel_address, is_alice, &counterparty)
            .await?;
        let result = self
            .queue(params.channel_address, is_alice)
            .execute_self(params.clone())
            .await;
        if let Err(e) = lock
            .release_lock(&params.channel_address, &key, is_alice, &counterparty)
            .await
        {
            warn!(error = %e, "could not release channel lock");
        }

        let outcome = result?;
        self.post(&outcome);
        Ok(outcome)
    }

    async fn handle_message(&self, message: ProtocolMessage) {
        let own = self.services.signer.public_identifier();
        if message.update.from_identifier == *own {
            debug!("ignoring our own update");
            return;
        }
        let channel_address = message.update.channel_address;
        let is_alice = match self.services.store.get_channel_state(&channel_address).await {
            Ok(channel) => channel.map_or(false, |c| c.alice_identifier == *own),
            Err(e) => {
                let err = InboundError::new(InboundReason::StoreFailure, e.to_string())
                    .with_update(&message.update);
                self.respond_with_error(&message, &err).await;
                return;
            }
        };

        let inbound = InboundMessage {
            update: message.update.clone(),
            previous_update: message.previous_update.clone(),
            inbox: message.inbox.clone(),
        };
        match self.queue(channel_address, is_alice).execute_other(inbound).await {
            Ok(outcome) => self.post(&outcome),
            Err(err) if err.reason.is_queue_rejection() => {
                let err = self.answer_for_rejection(&message, err).await;
                self.respond_with_error(&message, &err).await;
            }
            Err(err) => {
                debug!(reason = %err.reason, error = %err, "counterparty update failed");
            }
        }
    }

    /// The queue only knows the nonce did not fit, tell the proposer whether
    /// it can catch up.
    async fn answer_for_rejection(&self, message: &ProtocolMessage, err: InboundError) -> InboundError {
        if err.reason != InboundReason::NonceMismatch {
            return err.with_update(&message.update);
        }
        let channel = match self
            .services
            .store
            .get_channel_state(&message.update.channel_address)
            .await
        {
            Ok(channel) => channel,
            Err(e) => {
                return InboundError::new(InboundReason::StoreFailure, e.to_string())
                    .with_update(&message.update)
            }
        };
        let local = channel.as_ref().map_or(0, |c| c.nonce);
        let latest = channel.as_ref().and_then(|c| c.latest_update.as_ref());
        let reason = if message.update.nonce <= local {
            InboundReason::StaleUpdate
        } else {
            InboundReason::RestoreNeeded
        };
        InboundError::new(reason, err.context)
            .with_update(&message.update)
            .with_latest(latest)
    }

    async fn respond_with_error(&self, message: &ProtocolMessage, err: &InboundError) {
        debug!(reason = %err.reason, nonce = message.update.nonce, "rejecting counterparty update");
        if let Err(e) = self
            .services
            .messaging
            .respond_with_protocol_error(&message.inbox, err)
            .await
        {
            warn!(error = %e, "could not send protocol error");
        }
    }

    /// Mark channels with a live on-chain dispute, and clear the flag of
    /// channels whose dispute expired.
    async fn reconcile_disputes(&self, channels: &[FullChannelState]) {
        let chain = self.services.chain.as_ref();
        for channel in channels {
            let chain_id = channel.network_context.chain_id;
            let dispute = match chain.channel_dispute(&channel.channel_address, chain_id).await {
                Ok(Some(dispute)) => dispute,
                Ok(None) => continue,
                Err(e) => {
                    error!(channel = %channel.channel_address, error = %e, "could not get dispute");
                    continue;
                }
            };
            let block = match chain.block_number(chain_id).await {
                Ok(block) => block,
                Err(e) => {
                    error!(chain_id, error = %e, "could not get block number");
                    continue;
                }
            };
            let in_dispute = block <= dispute.defund_expiry;
            let updated = FullChannelState {
                in_dispute,
                ..channel.clone()
            };
            match self.services.store.save_channel_dispute(&updated, &dispute).await {
                Ok(()) => info!(channel = %channel.channel_address, in_dispute, "dispute reconciled"),
                Err(e) => {
                    error!(channel = %channel.channel_address, error = %e, "could not save dispute")
                }
            }
        }
    }

    /// Propose a deposit reconciliation for the asset of each channel's
    /// latest update if the chain holds deposits the channel does not
    /// account for yet. Catches up with a counterparty that moved on while we
    /// were offline.
    async fn resync(&self, channels: &[FullChannelState]) {
        for channel in channels {
            let asset_id = match channel.latest_update.as_ref() {
                Some(update) if channel.asset_index(&update.asset_id).is_some() => update.asset_id,
                _ => continue,
            };
            let stored = match self.services.store.get_channel_state(&channel.channel_address).await {
                Ok(Some(stored)) => stored,
                _ => continue,
            };
            if stored.in_dispute {
                continue;
            }
            match reconciled_deposit(&stored, &asset_id, self.services.chain.as_ref()).await {
                Ok((balance, nonce))
                    if nonce == stored.latest_deposit_nonce
                        && stored
                            .asset_index(&asset_id)
                            .map_or(false, |idx| stored.balances[idx] == balance) =>
                {
                    debug!(channel = %channel.channel_address, "deposits already reconciled");
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(channel = %channel.channel_address, error = %e, "could not reconcile deposits");
                    continue;
                }
            }
            let params = UpdateParams {
                channel_address: channel.channel_address,
                details: ParamsDetails::Deposit { asset_id },
            };
            match self.execute(&params).await {
                Ok(outcome) => debug!(
                    channel = %channel.channel_address,
                    nonce = outcome.applied.updated_channel_state.nonce,
                    "synced on start"
                ),
                Err(e) => warn!(
                    channel = %channel.channel_address,
                    reason = e.reason(),
                    error = %e,
                    "failed to sync on start"
                ),
            }
        }
    }
}
