//! Exchanging updates with the counterparty.
//!
//! [outbound] proposes one of our updates and commits it once the
//! counterparty returned it counter-signed. [inbound] handles a proposal of
//! the counterparty. Both catch up when one side missed exactly one update,
//! larger gaps need a restore.

use core::fmt;

use crate::{
    channel::{ChannelUpdate, FullChannelState, SignatureError, UpdateType},
    events::ChannelUpdateEvent,
    params::{ParamsDetails, UpdateParams},
    queue::{Interrupt, QueueError},
    services::{Inbox, MessagingError, Services, StoreError},
    transfer::FullTransferState,
    update::{
        apply_to_transfers, apply_update, generate_update, validate_counterparty_update,
        ApplyError, InvalidUpdate,
    },
};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundReason {
    /// The update is not newer than our state. The error carries our latest
    /// update so the proposer can catch up.
    StaleUpdate,
    /// More than one update is missing on one side.
    RestoreNeeded,
    ChannelNotFound,
    InDispute,
    InvalidUpdate,
    ApplyFailed,
    ExternalValidationFailed,
    BadSignatures,
    SigningFailed,
    StoreFailure,
    NonceMismatch,
    NonceUnavailable,
    QueueClosed,
}

impl InboundReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            InboundReason::StaleUpdate => "StaleUpdate",
            InboundReason::RestoreNeeded => "RestoreNeeded",
            InboundReason::ChannelNotFound => "ChannelNotFound",
            InboundReason::InDispute => "InDispute",
            InboundReason::InvalidUpdate => "InvalidUpdate",
            InboundReason::ApplyFailed => "ApplyFailed",
            InboundReason::ExternalValidationFailed => "ExternalValidationFailed",
            InboundReason::BadSignatures => "BadSignatures",
            InboundReason::SigningFailed => "SigningFailed",
            InboundReason::StoreFailure => "StoreFailure",
            InboundReason::NonceMismatch => "NonceMismatch",
            InboundReason::NonceUnavailable => "NonceUnavailable",
            InboundReason::QueueClosed => "QueueClosed",
        }
    }

    /// Rejected by the queue before the update was looked at, no response
    /// has been sent for it yet.
    pub fn is_queue_rejection(&self) -> bool {
        matches!(
            self,
            InboundReason::NonceMismatch
                | InboundReason::NonceUnavailable
                | InboundReason::QueueClosed
        )
    }
}

impl fmt::Display for InboundReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure to handle an update proposed by the counterparty. It is sent
/// back to the proposer.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{reason}: {context}")]
pub struct InboundError {
    pub reason: InboundReason,
    pub update: Option<Box<ChannelUpdate>>,
    /// Our latest update, set for [InboundReason::StaleUpdate].
    pub latest_update: Option<Box<ChannelUpdate>>,
    pub context: String,
}

impl InboundError {
    pub fn new(reason: InboundReason, context: impl Into<String>) -> Self {
        Self {
            reason,
            update: None,
            latest_update: None,
            context: context.into(),
        }
    }

    pub fn with_update(mut self, update: &ChannelUpdate) -> Self {
        self.update = Some(Box::new(update.clone()));
        self
    }

    pub fn with_latest(mut self, latest: Option<&ChannelUpdate>) -> Self {
        self.latest_update = latest.map(|u| Box::new(u.clone()));
        self
    }
}

impl From<QueueError> for InboundError {
    fn from(e: QueueError) -> Self {
        let reason = match e {
            QueueError::NonceMismatch { .. } => InboundReason::NonceMismatch,
            QueueError::Closed => InboundReason::QueueClosed,
            QueueError::NonceUnavailable(_) => InboundReason::NonceUnavailable,
        };
        InboundError::new(reason, e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundReason {
    ChannelNotFound,
    InDispute,
    ValidationFailed,
    GenerationFailed,
    /// The counterparty rejected the update.
    CounterpartyFailure,
    RestoreNeeded,
    /// Catching up with the counterparty failed.
    SyncFailure,
    BadSignatures,
    Timeout,
    MessagingFailure,
    StoreFailure,
    NonceMismatch,
    QueueClosed,
}

impl OutboundReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboundReason::ChannelNotFound => "ChannelNotFound",
            OutboundReason::InDispute => "InDispute",
            OutboundReason::ValidationFailed => "ValidationFailed",
            OutboundReason::GenerationFailed => "GenerationFailed",
            OutboundReason::CounterpartyFailure => "CounterpartyFailure",
            OutboundReason::RestoreNeeded => "RestoreNeeded",
            OutboundReason::SyncFailure => "SyncFailure",
            OutboundReason::BadSignatures => "BadSignatures",
            OutboundReason::Timeout => "Timeout",
            OutboundReason::MessagingFailure => "MessagingFailure",
            OutboundReason::StoreFailure => "StoreFailure",
            OutboundReason::NonceMismatch => "NonceMismatch",
            OutboundReason::QueueClosed => "QueueClosed",
        }
    }
}

impl fmt::Display for OutboundReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure to get one of our updates accepted.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{reason}: {context}")]
pub struct OutboundError {
    pub reason: OutboundReason,
    pub params: Option<Box<UpdateParams>>,
    pub update: Option<Box<ChannelUpdate>>,
    pub context: String,
}

impl OutboundError {
    pub fn new(reason: OutboundReason, context: impl Into<String>) -> Self {
        Self {
            reason,
            params: None,
            update: None,
            context: context.into(),
        }
    }

    pub fn with_params(mut self, params: &UpdateParams) -> Self {
        self.params = Some(Box::new(params.clone()));
        self
    }

    pub fn with_update(mut self, update: &ChannelUpdate) -> Self {
        self.update = Some(Box::new(update.clone()));
        self
    }
}

impl From<QueueError> for OutboundError {
    fn from(e: QueueError) -> Self {
        let reason = match e {
            QueueError::NonceMismatch { .. } => OutboundReason::NonceMismatch,
            QueueError::Closed => OutboundReason::QueueClosed,
            QueueError::NonceUnavailable(_) => OutboundReason::StoreFailure,
        };
        OutboundError::new(reason, e.to_string())
    }
}

/// Events of a successful exchange: the update we caught up with (if any)
/// and the update that was proposed.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub synced: Option<ChannelUpdateEvent>,
    pub applied: ChannelUpdateEvent,
}

impl SyncOutcome {
    pub fn events(&self) -> impl Iterator<Item = &ChannelUpdateEvent> {
        self.synced.iter().chain(Some(&self.applied))
    }
}

/// Proposal received from the counterparty.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub update: ChannelUpdate,
    pub previous_update: Option<ChannelUpdate>,
    pub inbox: Inbox,
}

#[derive(Debug, thiserror::Error)]
enum SyncError {
    #[error("update is not double signed")]
    NotDoubleSigned,
    #[error(transparent)]
    Invalid(#[from] InvalidUpdate),
    #[error(transparent)]
    Apply(#[from] ApplyError),
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SyncError {
    fn inbound_reason(&self) -> InboundReason {
        match self {
            SyncError::NotDoubleSigned | SyncError::Signature(_) => InboundReason::BadSignatures,
            SyncError::Invalid(_) => InboundReason::InvalidUpdate,
            SyncError::Apply(_) => InboundReason::ApplyFailed,
            SyncError::Store(_) => InboundReason::StoreFailure,
        }
    }
}

fn event(
    channel: FullChannelState,
    active_transfers: Vec<FullTransferState>,
    transfer: Option<FullTransferState>,
) -> ChannelUpdateEvent {
    ChannelUpdateEvent {
        updated_channel_state: channel,
        updated_transfers: active_transfers,
        updated_transfer: transfer,
    }
}

async fn active_transfers(
    channel: Option<&FullChannelState>,
    services: &Services,
) -> Result<Vec<FullTransferState>, StoreError> {
    match channel {
        Some(c) => services.store.get_active_transfers(&c.channel_address).await,
        None => Ok(vec![]),
    }
}

/// Apply and store an update both parties already signed.
async fn apply_synced_update(
    update: &ChannelUpdate,
    previous: Option<&FullChannelState>,
    services: &Services,
) -> Result<ChannelUpdateEvent, SyncError> {
    if !update.is_double_signed() {
        return Err(SyncError::NotDoubleSigned);
    }
    let active = active_transfers(previous, services).await?;
    let transfer =
        validate_counterparty_update(update, previous, &active, services.chain.as_ref()).await?;
    let channel = apply_update(update, previous, &active, transfer.as_ref())?;
    channel.verify_double_signed(&update.signatures)?;
    services
        .store
        .save_channel_state(&channel, transfer.as_ref())
        .await?;
    debug!(channel = %channel.channel_address, nonce = channel.nonce, "caught up with counterparty");
    let active = apply_to_transfers(update, &active, transfer.as_ref());
    Ok(event(channel, active, transfer))
}

/// Whether `a` and `b` are the same update, ignoring signatures.
fn same_update(a: &ChannelUpdate, b: &ChannelUpdate) -> bool {
    let strip = |u: &ChannelUpdate| ChannelUpdate {
        signatures: [None, None],
        ..u.clone()
    };
    strip(a) == strip(b)
}

/// Propose the update described by `params`.
///
/// Returns `None` if interrupted before the update was committed.
pub async fn outbound(
    params: &UpdateParams,
    services: &Services,
    interrupt: &Interrupt,
) -> Option<Result<SyncOutcome, OutboundError>> {
    propose(params, services, interrupt)
        .await
        .map_err(|e| e.with_params(params))
        .transpose()
}

async fn propose(
    params: &UpdateParams,
    services: &Services,
    interrupt: &Interrupt,
) -> Result<Option<SyncOutcome>, OutboundError> {
    let store = services.store.as_ref();
    let mut synced: Option<ChannelUpdateEvent> = None;

    loop {
        let previous = store
            .get_channel_state(&params.channel_address)
            .await
            .map_err(|e| OutboundError::new(OutboundReason::StoreFailure, e.to_string()))?;
        if previous.as_ref().map_or(false, |p| p.in_dispute) {
            return Err(OutboundError::new(
                OutboundReason::InDispute,
                "channel is in dispute",
            ));
        }
        if previous.is_none() && !matches!(params.details, ParamsDetails::Setup(_)) {
            return Err(OutboundError::new(
                OutboundReason::ChannelNotFound,
                format!("no channel at {}", params.channel_address),
            ));
        }

        let transfer = match &params.details {
            ParamsDetails::Resolve(resolve) => store
                .get_transfer_state(&resolve.transfer_id)
                .await
                .map_err(|e| OutboundError::new(OutboundReason::StoreFailure, e.to_string()))?,
            _ => None,
        };
        services
            .validation
            .validate_outbound(params, previous.as_ref(), transfer.as_ref())
            .await
            .map_err(|e| OutboundError::new(OutboundReason::ValidationFailed, e))?;

        let generated = generate_update(
            params,
            previous.as_ref(),
            store,
            services.chain.as_ref(),
            &services.signer,
        )
        .await
        .map_err(|e| OutboundError::new(OutboundReason::GenerationFailed, e.to_string()))?;
        let update = &generated.update;

        if interrupt.is_fired() {
            return Ok(None);
        }
        debug!(
            channel = %update.channel_address,
            nonce = update.nonce,
            update_type = %update.update_type,
            "proposing update"
        );
        let prior = previous.as_ref().and_then(|p| p.latest_update.as_ref());
        let response = tokio::select! {
            response = services.messaging.send_protocol_message(
                update,
                prior,
                services.config.sync_timeout,
                services.config.message_retries,
            ) => response,
            _ = interrupt.fired() => {
                debug!(channel = %update.channel_address, "proposal interrupted");
                return Ok(None);
            }
        };

        // A retried proposal the counterparty already signed comes back as
        // stale, carrying our own update.
        let response = match response {
            Ok(response) => Ok(response.update),
            Err(MessagingError::Counterparty(err)) => match err.latest_update.as_deref() {
                Some(latest)
                    if err.reason == InboundReason::StaleUpdate && same_update(latest, update) =>
                {
                    Ok(latest.clone())
                }
                _ => Err(MessagingError::Counterparty(err)),
            },
            Err(err) => Err(err),
        };

        let err = match response {
            Ok(counter_signed) => {
                if !same_update(&counter_signed, update) {
                    return Err(OutboundError::new(
                        OutboundReason::CounterpartyFailure,
                        "counterparty returned a different update",
                    )
                    .with_update(update));
                }
                let mut channel = generated.channel;
                channel
                    .verify_double_signed(&counter_signed.signatures)
                    .map_err(|e| {
                        OutboundError::new(OutboundReason::BadSignatures, e.to_string())
                            .with_update(&counter_signed)
                    })?;
                channel.latest_update = Some(counter_signed);
                store
                    .save_channel_state(&channel, generated.transfer.as_ref())
                    .await
                    .map_err(|e| OutboundError::new(OutboundReason::StoreFailure, e.to_string()))?;
                info!(
                    channel = %channel.channel_address,
                    nonce = channel.nonce,
                    "update double signed"
                );
                return Ok(Some(SyncOutcome {
                    synced,
                    applied: event(channel, generated.active_transfers, generated.transfer),
                }));
            }
            Err(err) => err,
        };

        match err {
            MessagingError::Counterparty(err)
                if err.reason == InboundReason::StaleUpdate && synced.is_none() =>
            {
                let local = previous.as_ref().map_or(0, |p| p.nonce);
                let message = err.to_string();
                let latest = match err.latest_update {
                    Some(latest) if latest.nonce == local + 1 => latest,
                    Some(latest) if latest.nonce > local + 1 => {
                        return Err(OutboundError::new(
                            OutboundReason::RestoreNeeded,
                            format!("counterparty is at nonce {}, we are at {local}", latest.nonce),
                        )
                        .with_update(update))
                    }
                    _ => {
                        return Err(OutboundError::new(
                            OutboundReason::CounterpartyFailure,
                            message,
                        )
                        .with_update(update))
                    }
                };
                debug!(nonce = latest.nonce, "counterparty is ahead, syncing");
                let applied = apply_synced_update(&latest, previous.as_ref(), services)
                    .await
                    .map_err(|e| OutboundError::new(OutboundReason::SyncFailure, e.to_string()))?;
                synced = Some(applied);
            }
            MessagingError::Counterparty(err) if err.reason == InboundReason::RestoreNeeded => {
                return Err(
                    OutboundError::new(OutboundReason::RestoreNeeded, err.to_string())
                        .with_update(update),
                )
            }
            MessagingError::Counterparty(err) => {
                return Err(OutboundError::new(
                    OutboundReason::CounterpartyFailure,
                    err.to_string(),
                )
                .with_update(update))
            }
            MessagingError::Timeout(after) => {
                warn!(channel = %update.channel_address, ?after, "counterparty did not respond");
                return Err(
                    OutboundError::new(OutboundReason::Timeout, format!("no response in {after:?}"))
                        .with_update(update),
                );
            }
            MessagingError::Transport(e) => {
                return Err(
                    OutboundError::new(OutboundReason::MessagingFailure, e).with_update(update)
                )
            }
        }
    }
}

/// Handle a proposal of the counterparty and answer it.
///
/// Returns `None` if interrupted before anything was stored, the proposal
/// is answered once it ran.
pub async fn inbound(
    message: &InboundMessage,
    services: &Services,
    interrupt: &Interrupt,
) -> Option<Result<SyncOutcome, InboundError>> {
    match accept(message, services, interrupt).await {
        Ok(outcome) => outcome.map(Ok),
        Err(err) => {
            let err = err.with_update(&message.update);
            debug!(reason = %err.reason, "rejecting counterparty update");
            if let Err(e) = services
                .messaging
                .respond_with_protocol_error(&message.inbox, &err)
                .await
            {
                warn!(error = %e, "could not send protocol error");
            }
            Some(Err(err))
        }
    }
}

async fn accept(
    message: &InboundMessage,
    services: &Services,
    interrupt: &Interrupt,
) -> Result<Option<SyncOutcome>, InboundError> {
    let update = &message.update;
    let store = services.store.as_ref();
    let own_id = services.signer.public_identifier();

    let mut previous = store
        .get_channel_state(&update.channel_address)
        .await
        .map_err(|e| InboundError::new(InboundReason::StoreFailure, e.to_string()))?;
    if previous.as_ref().map_or(false, |p| p.in_dispute) {
        return Err(InboundError::new(InboundReason::InDispute, "channel is in dispute"));
    }
    if update.to_identifier != *own_id {
        return Err(InboundError::new(
            InboundReason::InvalidUpdate,
            "update is not addressed to us",
        ));
    }

    let local = previous.as_ref().map_or(0, |p| p.nonce);
    let latest = previous.as_ref().and_then(|p| p.latest_update.as_ref());
    if update.nonce <= local {
        return Err(InboundError::new(
            InboundReason::StaleUpdate,
            format!("update nonce {} is not above {local}", update.nonce),
        )
        .with_latest(latest));
    }
    if update.nonce > local + 2 {
        return Err(InboundError::new(
            InboundReason::RestoreNeeded,
            format!("update nonce {} is too far ahead of {local}", update.nonce),
        )
        .with_latest(latest));
    }

    let mut synced = None;
    if update.nonce == local + 2 {
        let missing = message
            .previous_update
            .as_ref()
            .filter(|p| p.nonce == local + 1)
            .ok_or_else(|| {
                InboundError::new(
                    InboundReason::RestoreNeeded,
                    format!("missing update {} to catch up", local + 1),
                )
                .with_latest(latest)
            })?;
        let applied = apply_synced_update(missing, previous.as_ref(), services)
            .await
            .map_err(|e| InboundError::new(e.inbound_reason(), e.to_string()))?;
        previous = Some(applied.updated_channel_state.clone());
        synced = Some(applied);
    } else if previous.is_none() && update.update_type != UpdateType::Setup {
        return Err(InboundError::new(
            InboundReason::ChannelNotFound,
            format!("no channel at {}", update.channel_address),
        ));
    }
    let previous = previous.as_ref();

    let active = active_transfers(previous, services)
        .await
        .map_err(|e| InboundError::new(InboundReason::StoreFailure, e.to_string()))?;
    let transfer =
        validate_counterparty_update(update, previous, &active, services.chain.as_ref())
            .await
            .map_err(|e| InboundError::new(InboundReason::InvalidUpdate, e.to_string()))?;
    services
        .validation
        .validate_inbound(update, previous, transfer.as_ref())
        .await
        .map_err(|e| InboundError::new(InboundReason::ExternalValidationFailed, e))?;

    let mut channel = apply_update(update, previous, &active, transfer.as_ref())
        .map_err(|e| InboundError::new(InboundReason::ApplyFailed, e.to_string()))?;
    let (from, own) = match (channel.part_idx(&update.from_identifier), channel.part_idx(own_id)) {
        (Some(from), Some(own)) if from != own => (from, own),
        _ => {
            return Err(InboundError::new(
                InboundReason::InvalidUpdate,
                "update is not between the channel participants",
            ))
        }
    };
    channel
        .verify_signatures(&update.signatures, &[from])
        .map_err(|e| InboundError::new(InboundReason::BadSignatures, e.to_string()))?;

    let mut signed = update.clone();
    if signed.signatures[own].is_none() {
        let sig = channel
            .sign(&services.signer)
            .map_err(|e| InboundError::new(InboundReason::SigningFailed, e.to_string()))?;
        signed.signatures[own] = Some(sig);
    }
    channel.latest_update = Some(signed.clone());

    if interrupt.is_fired() {
        debug!(channel = %update.channel_address, "counterparty update interrupted");
        return Ok(None);
    }
    store
        .save_channel_state(&channel, transfer.as_ref())
        .await
        .map_err(|e| InboundError::new(InboundReason::StoreFailure, e.to_string()))?;
    info!(
        channel = %channel.channel_address,
        nonce = channel.nonce,
        update_type = %update.update_type,
        "counter-signed update"
    );

    let prior = previous.and_then(|p| p.latest_update.as_ref());
    if let Err(e) = services
        .messaging
        .respond_to_protocol_message(&message.inbox, &signed, prior)
        .await
    {
        warn!(error = %e, "could not answer counterparty");
    }

    let active = apply_to_transfers(update, &active, transfer.as_ref());
    Ok(Some(SyncOutcome {
        synced,
        applied: event(channel, active, transfer),
    }))
}
