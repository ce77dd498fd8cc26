//! Build single-signed updates from validated parameters.

use super::apply::{apply_to_transfers, apply_update, ApplyError};
use crate::{
    abiencode::{
        self,
        types::{Address, Hash, U256},
    },
    channel::{
        self, Balance, ChannelUpdate, CreateDetails, DepositDetails, FullChannelState,
        NetworkContext, ResolveDetails, SetupDetails, SignatureError, UpdateDetails,
    },
    merkle,
    params::{CreateParams, ParamsDetails, ResolveParams, SetupParams, UpdateParams},
    services::{ChainError, ChainReader, Store, StoreError},
    sig::{IdentifierError, PublicIdentifier, Signer},
    transfer::{self, FullTransferState, TransferKind, TransferRole},
};

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("channel {0:?} not found")]
    ChannelNotFound(Address),
    #[error("channel {0:?} already exists")]
    ChannelAlreadySetup(Address),
    #[error("channel address mismatch: derived {derived:?}, got {given:?}")]
    Create2Mismatch { derived: Address, given: Address },
    #[error("could not compute channel address: {0}")]
    Create2Failed(String),
    #[error("on-chain balance of {asset:?} ({onchain}) is below the reconciled balance")]
    InsufficientOnchainBalance { asset: Address, onchain: U256 },
    #[error("balance of {asset:?} is too low to lock {amount}")]
    InsufficientBalance { asset: Address, amount: U256 },
    #[error("asset {0:?} is not part of the channel")]
    AssetNotFound(Address),
    #[error("invalid transfer type: {0}")]
    InvalidTransferType(String),
    #[error("transfer initial balance must be [amount, 0]")]
    InvalidInitialBalance,
    #[error("transfer {0:?} is not active")]
    TransferNotFound(Hash),
    #[error("signer is not a participant of the channel")]
    NotParticipant,
    #[error("balance overflow")]
    Overflow,
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Apply(#[from] ApplyError),
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error(transparent)]
    Identifier(#[from] IdentifierError),
    #[error(transparent)]
    Encoding(#[from] abiencode::Error),
}

/// Result of [generate_update]: the single-signed update and the state it
/// leads to.
#[derive(Debug, Clone)]
pub struct GeneratedUpdate {
    pub update: ChannelUpdate,
    pub channel: FullChannelState,
    pub active_transfers: Vec<FullTransferState>,
    /// Created or resolved transfer.
    pub transfer: Option<FullTransferState>,
}

/// Deterministic address of the channel between `alice` and `bob`.
pub async fn channel_address_for(
    alice: &PublicIdentifier,
    bob: &PublicIdentifier,
    network_context: &NetworkContext,
    chain: &dyn ChainReader,
) -> Result<Address, GenerationError> {
    let code = chain
        .channel_factory_bytecode(
            &network_context.channel_factory_address,
            network_context.chain_id,
        )
        .await
        .map_err(|e| GenerationError::Create2Failed(e.to_string()))?;
    Ok(channel::channel_address(
        alice.address()?,
        bob.address()?,
        network_context.chain_id,
        network_context.channel_factory_address,
        &code,
    ))
}

/// Build the update described by `params` on top of `previous` and sign it.
///
/// The update is dry-run through [apply_update] so a successfully
/// generated update is always applicable.
pub async fn generate_update(
    params: &UpdateParams,
    previous: Option<&FullChannelState>,
    store: &dyn Store,
    chain: &dyn ChainReader,
    signer: &Signer,
) -> Result<GeneratedUpdate, GenerationError> {
    let active_transfers = match previous {
        Some(p) => store.get_active_transfers(&p.channel_address).await?,
        None => vec![],
    };

    let (update, transfer) = match (&params.details, previous) {
        (ParamsDetails::Setup(setup), None) => {
            (setup_update(params.channel_address, setup, chain, signer).await?, None)
        }
        (ParamsDetails::Setup(_), Some(p)) => {
            return Err(GenerationError::ChannelAlreadySetup(p.channel_address))
        }
        (_, None) => return Err(GenerationError::ChannelNotFound(params.channel_address)),
        (ParamsDetails::Deposit { asset_id }, Some(p)) => {
            (deposit_update(p, asset_id, chain, signer).await?, None)
        }
        (ParamsDetails::Create(create), Some(p)) => {
            let (update, transfer) = create_update(p, create, &active_transfers, signer)?;
            (update, Some(transfer))
        }
        (ParamsDetails::Resolve(resolve), Some(p)) => {
            let (update, transfer) =
                resolve_update(p, resolve, &active_transfers, chain, signer).await?;
            (update, Some(transfer))
        }
    };

    sign_generated(update, previous, active_transfers, transfer, signer)
}

/// Apply `update` and add our signature to it.
fn sign_generated(
    mut update: ChannelUpdate,
    previous: Option<&FullChannelState>,
    active_transfers: Vec<FullTransferState>,
    transfer: Option<FullTransferState>,
    signer: &Signer,
) -> Result<GeneratedUpdate, GenerationError> {
    let mut channel = apply_update(&update, previous, &active_transfers, transfer.as_ref())?;
    let idx = channel
        .part_idx(signer.public_identifier())
        .ok_or(GenerationError::NotParticipant)?;
    update.signatures[idx] = Some(channel.sign(signer)?);
    channel.latest_update = Some(update.clone());

    Ok(GeneratedUpdate {
        active_transfers: apply_to_transfers(&update, &active_transfers, transfer.as_ref()),
        update,
        channel,
        transfer,
    })
}

fn base_update(
    channel: &FullChannelState,
    signer: &Signer,
    asset_id: Address,
    balance: Balance,
    details: UpdateDetails,
) -> ChannelUpdate {
    ChannelUpdate {
        channel_address: channel.channel_address,
        from_identifier: signer.public_identifier().clone(),
        to_identifier: channel
            .counterparty_identifier(signer.public_identifier())
            .clone(),
        update_type: details.update_type(),
        nonce: channel.nonce + 1,
        balance,
        asset_id,
        details,
        signatures: [None, None],
    }
}

async fn setup_update(
    channel_address: Address,
    params: &SetupParams,
    chain: &dyn ChainReader,
    signer: &Signer,
) -> Result<ChannelUpdate, GenerationError> {
    let alice = signer.public_identifier();
    let bob = &params.counterparty_identifier;
    let derived = channel_address_for(alice, bob, &params.network_context, chain).await?;
    if derived != channel_address {
        return Err(GenerationError::Create2Mismatch {
            derived,
            given: channel_address,
        });
    }

    Ok(ChannelUpdate {
        channel_address,
        from_identifier: alice.clone(),
        to_identifier: bob.clone(),
        update_type: channel::UpdateType::Setup,
        nonce: 1,
        balance: Balance::new([signer.address(), bob.address()?]),
        asset_id: Address::ZERO,
        details: UpdateDetails::Setup(SetupDetails {
            timeout: params.timeout,
            network_context: params.network_context.clone(),
        }),
        signatures: [None, None],
    })
}

/// Reconcile the channel balance of `asset_id` with the chain.
///
/// Alice's deposits are tracked by nonce on-chain, everything else held by
/// the channel contract that is neither alice's nor locked belongs to bob.
/// Balance of `asset_id` after crediting deposits made on-chain since the
/// last reconciliation, with the deposit nonce it accounts for.
pub async fn reconciled_deposit(
    channel: &FullChannelState,
    asset_id: &Address,
    chain: &dyn ChainReader,
) -> Result<(Balance, u64), GenerationError> {
    let chain_id = channel.network_context.chain_id;
    let onchain = chain
        .channel_onchain_balance(&channel.channel_address, asset_id, chain_id)
        .await?;
    let latest = chain
        .latest_deposit_by_asset(&channel.channel_address, asset_id, chain_id)
        .await?;

    let (previous, locked) = match channel.asset_index(asset_id) {
        Some(idx) => (channel.balances[idx], channel.locked_balance[idx]),
        None => (Balance::new(channel.participants()), U256::zero()),
    };

    let (alice, latest_deposit_nonce) = if latest.nonce > channel.latest_deposit_nonce {
        let amount = previous.amount[0]
            .checked_add(latest.amount)
            .ok_or(GenerationError::Overflow)?;
        (amount, latest.nonce)
    } else {
        (previous.amount[0], channel.latest_deposit_nonce)
    };
    let bob = onchain
        .checked_sub(alice)
        .and_then(|rest| rest.checked_sub(locked))
        .ok_or(GenerationError::InsufficientOnchainBalance {
            asset: *asset_id,
            onchain,
        })?;

    let balance = Balance {
        amount: [alice, bob],
        to: previous.to,
    };
    Ok((balance, latest_deposit_nonce))
}

async fn deposit_update(
    channel: &FullChannelState,
    asset_id: &Address,
    chain: &dyn ChainReader,
    signer: &Signer,
) -> Result<ChannelUpdate, GenerationError> {
    let (balance, latest_deposit_nonce) = reconciled_deposit(channel, asset_id, chain).await?;
    Ok(base_update(
        channel,
        signer,
        *asset_id,
        balance,
        UpdateDetails::Deposit(DepositDetails {
            latest_deposit_nonce,
        }),
    ))
}

/// Definition registered in the network context for `kind`.
fn registered_definition(context: &NetworkContext, kind: TransferKind) -> Option<Address> {
    match kind {
        TransferKind::Linked => context.linked_transfer_definition,
        TransferKind::Withdraw => context.withdraw_definition,
    }
}

fn create_update(
    channel: &FullChannelState,
    params: &CreateParams,
    active_transfers: &[FullTransferState],
    signer: &Signer,
) -> Result<(ChannelUpdate, FullTransferState), GenerationError> {
    let state = &params.transfer_initial_state;
    let kind = state.kind();
    if registered_definition(&channel.network_context, kind) != Some(params.transfer_definition) {
        return Err(GenerationError::InvalidTransferType(format!(
            "{:?} is not the {} definition of chain {}",
            params.transfer_definition, kind, channel.network_context.chain_id
        )));
    }
    if TransferKind::from_encodings(&params.encodings) != Some(kind) {
        return Err(GenerationError::InvalidTransferType(format!(
            "encodings do not describe a {kind} transfer"
        )));
    }
    let initial_balance = *state.balance();
    if initial_balance.amount != [params.amount, U256::zero()] {
        return Err(GenerationError::InvalidInitialBalance);
    }

    let idx = channel
        .asset_index(&params.asset_id)
        .ok_or(GenerationError::AssetNotFound(params.asset_id))?;
    let own = signer.public_identifier();
    let part = channel.part_idx(own).ok_or(GenerationError::NotParticipant)?;
    let counterparty = channel.counterparty_identifier(own).clone();

    let mut balance = channel.balances[idx];
    balance.amount[part] = balance.amount[part].checked_sub(params.amount).ok_or(
        GenerationError::InsufficientBalance {
            asset: params.asset_id,
            amount: params.amount,
        },
    )?;

    let transfer = FullTransferState {
        transfer_id: transfer::transfer_id(
            params.transfer_definition,
            channel.channel_address,
            params.timeout,
            channel.nonce,
        ),
        channel_address: channel.channel_address,
        chain_id: channel.network_context.chain_id,
        channel_factory_address: channel.network_context.channel_factory_address,
        asset_id: params.asset_id,
        balance: initial_balance,
        initial_balance,
        transfer_definition: params.transfer_definition,
        transfer_state: state.clone(),
        transfer_resolver: None,
        transfer_timeout: params.timeout,
        transfer_encodings: params.encodings.clone(),
        initial_state_hash: state.initial_state_hash()?,
        meta: params.meta.clone(),
        initiator: signer.address(),
        responder: counterparty.address()?,
        initiator_identifier: own.clone(),
        responder_identifier: counterparty,
        channel_nonce: channel.nonce,
    };

    let leaf = transfer.hash()?;
    let mut leaves = merkle::leaves(active_transfers)?;
    leaves.push(leaf);
    let merkle_proof_data = merkle::proof(&leaves, &leaf).unwrap_or_default();

    let update = base_update(
        channel,
        signer,
        params.asset_id,
        balance,
        UpdateDetails::Create(CreateDetails {
            transfer_id: transfer.transfer_id,
            transfer_definition: transfer.transfer_definition,
            transfer_timeout: transfer.transfer_timeout,
            transfer_initial_state: transfer.transfer_state.clone(),
            transfer_encodings: transfer.transfer_encodings.clone(),
            merkle_proof_data,
            merkle_root: merkle::root(&leaves),
            meta: transfer.meta.clone(),
        }),
    );
    Ok((update, transfer))
}

/// Channel balance after paying out a resolved transfer.
pub(crate) fn paid_out_balance(
    channel: &FullChannelState,
    transfer: &FullTransferState,
    resolved: &Balance,
) -> Result<Balance, GenerationError> {
    let idx = channel
        .asset_index(&transfer.asset_id)
        .ok_or(GenerationError::AssetNotFound(transfer.asset_id))?;
    let mut balance = channel.balances[idx];
    for role in [TransferRole::Initiator, TransferRole::Responder] {
        let id = match role {
            TransferRole::Initiator => &transfer.initiator_identifier,
            TransferRole::Responder => &transfer.responder_identifier,
        };
        let part = channel.part_idx(id).ok_or(GenerationError::NotParticipant)?;
        balance.amount[part] = balance.amount[part]
            .checked_add(resolved.amount[role.idx()])
            .ok_or(GenerationError::Overflow)?;
    }
    Ok(balance)
}

async fn resolve_update(
    channel: &FullChannelState,
    params: &ResolveParams,
    active_transfers: &[FullTransferState],
    chain: &dyn ChainReader,
    signer: &Signer,
) -> Result<(ChannelUpdate, FullTransferState), GenerationError> {
    let mut transfer = active_transfers
        .iter()
        .find(|t| t.transfer_id == params.transfer_id)
        .cloned()
        .ok_or(GenerationError::TransferNotFound(params.transfer_id))?;
    if params.transfer_resolver.kind() != transfer.transfer_state.kind() {
        return Err(GenerationError::InvalidTransferType(format!(
            "{} resolver for a {} transfer",
            params.transfer_resolver.kind(),
            transfer.transfer_state.kind()
        )));
    }

    transfer.transfer_resolver = Some(params.transfer_resolver.clone());
    let resolved = chain
        .resolve(&transfer, channel.network_context.chain_id)
        .await?;
    let balance = paid_out_balance(channel, &transfer, &resolved)?;
    transfer.balance = resolved;

    let remaining: Vec<_> = active_transfers
        .iter()
        .filter(|t| t.transfer_id != transfer.transfer_id)
        .cloned()
        .collect();

    let update = base_update(
        channel,
        signer,
        transfer.asset_id,
        balance,
        UpdateDetails::Resolve(ResolveDetails {
            transfer_id: transfer.transfer_id,
            transfer_definition: transfer.transfer_definition,
            transfer_resolver: params.transfer_resolver.clone(),
            merkle_root: merkle::root_of(&remaining)?,
            meta: params.meta.clone(),
        }),
    );
    Ok((update, transfer))
}
