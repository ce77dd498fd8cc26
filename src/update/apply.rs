//! Pure state transition: previous channel state + update -> next state.

use crate::{
    abiencode::{
        self,
        types::{Address, Hash, U256},
    },
    channel::{ChannelUpdate, FullChannelState, UpdateDetails, UpdateType},
    merkle,
    sig::IdentifierError,
    transfer::FullTransferState,
};

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("update nonce {actual} does not follow channel nonce (expected {expected})")]
    StaleUpdate { expected: u64, actual: u64 },
    #[error("update type {update_type} does not match its details")]
    BadUpdateType { update_type: UpdateType },
    #[error("channel {0:?} not found")]
    ChannelNotFound(Address),
    #[error("update is for channel {actual:?}, expected {expected:?}")]
    ChannelMismatch {
        expected: Address,
        actual: Address,
    },
    #[error("transfer {0:?} not found")]
    TransferNotFound(Hash),
    #[error("asset {0:?} is not part of the channel")]
    AssetNotFound(Address),
    #[error("update is for asset {actual:?}, transfer locks {expected:?}")]
    AssetMismatch { expected: Address, actual: Address },
    #[error("merkle root mismatch: update has {expected:?}, computed {computed:?}")]
    MerkleMismatch { expected: Hash, computed: Hash },
    #[error("locked balance overflow")]
    Overflow,
    #[error("locked balance underflow")]
    Underflow,
    #[error("invalid participant identifier: {0}")]
    Identifier(#[from] IdentifierError),
    #[error(transparent)]
    Encoding(#[from] abiencode::Error),
}

/// Compute the channel state after `update`.
///
/// `active_transfers` are the transfers active *before* the update. For
/// create and resolve updates, `transfer` is the transfer being created or
/// resolved (with its resolver attached).
///
/// The returned state has `latest_update` set to `update`, signatures added
/// later have to be copied over by the caller.
pub fn apply_update(
    update: &ChannelUpdate,
    previous: Option<&FullChannelState>,
    active_transfers: &[FullTransferState],
    transfer: Option<&FullTransferState>,
) -> Result<FullChannelState, ApplyError> {
    if !update.has_consistent_type() {
        return Err(ApplyError::BadUpdateType {
            update_type: update.update_type,
        });
    }

    let previous_nonce = previous.map(|p| p.nonce).unwrap_or(0);
    if update.nonce != previous_nonce + 1 {
        return Err(ApplyError::StaleUpdate {
            expected: previous_nonce + 1,
            actual: update.nonce,
        });
    }

    let mut next = match &update.details {
        UpdateDetails::Setup(details) => {
            if previous.map_or(false, |p| p.nonce != 0) {
                return Err(ApplyError::StaleUpdate {
                    expected: previous_nonce + 1,
                    actual: update.nonce,
                });
            }
            // The setup initiator is always alice.
            FullChannelState {
                channel_address: update.channel_address,
                alice: update.from_identifier.address()?,
                bob: update.to_identifier.address()?,
                alice_identifier: update.from_identifier.clone(),
                bob_identifier: update.to_identifier.clone(),
                network_context: details.network_context.clone(),
                nonce: 0,
                asset_ids: vec![],
                balances: vec![],
                locked_balance: vec![],
                latest_deposit_nonce: 0,
                merkle_root: Hash::default(),
                latest_update: None,
                timeout: details.timeout,
                in_dispute: false,
            }
        }
        UpdateDetails::Deposit(details) => {
            let mut next = existing(update, previous)?;
            match next.asset_index(&update.asset_id) {
                Some(idx) => next.balances[idx] = update.balance,
                None => {
                    next.asset_ids.push(update.asset_id);
                    next.balances.push(update.balance);
                    next.locked_balance.push(U256::zero());
                }
            }
            next.latest_deposit_nonce = details.latest_deposit_nonce;
            next
        }
        UpdateDetails::Create(details) => {
            let mut next = existing(update, previous)?;
            let transfer = transfer
                .filter(|t| t.transfer_id == details.transfer_id)
                .ok_or(ApplyError::TransferNotFound(details.transfer_id))?;
            let idx = transfer_asset_index(&next, update, transfer)?;

            next.locked_balance[idx] = next.locked_balance[idx]
                .checked_add(transfer.initial_balance.amount[0])
                .ok_or(ApplyError::Overflow)?;
            next.balances[idx] = update.balance;

            let mut leaves = merkle::leaves(active_transfers)?;
            leaves.push(transfer.hash()?);
            next.merkle_root = checked_root(&leaves, details.merkle_root)?;
            next
        }
        UpdateDetails::Resolve(details) => {
            let mut next = existing(update, previous)?;
            let transfer = transfer
                .filter(|t| t.transfer_id == details.transfer_id)
                .ok_or(ApplyError::TransferNotFound(details.transfer_id))?;
            if !active_transfers
                .iter()
                .any(|t| t.transfer_id == details.transfer_id)
            {
                return Err(ApplyError::TransferNotFound(details.transfer_id));
            }
            let idx = transfer_asset_index(&next, update, transfer)?;

            next.locked_balance[idx] = next.locked_balance[idx]
                .checked_sub(transfer.initial_balance.amount[0])
                .ok_or(ApplyError::Underflow)?;
            next.balances[idx] = update.balance;

            let remaining: Vec<_> = active_transfers
                .iter()
                .filter(|t| t.transfer_id != details.transfer_id)
                .cloned()
                .collect();
            next.merkle_root = checked_root(&merkle::leaves(&remaining)?, details.merkle_root)?;
            next
        }
    };

    next.nonce = update.nonce;
    next.latest_update = Some(update.clone());
    Ok(next)
}

/// Copy of the previous state, which has to exist for anything but setup.
fn existing(
    update: &ChannelUpdate,
    previous: Option<&FullChannelState>,
) -> Result<FullChannelState, ApplyError> {
    let previous = previous.ok_or(ApplyError::ChannelNotFound(update.channel_address))?;
    if previous.channel_address != update.channel_address {
        return Err(ApplyError::ChannelMismatch {
            expected: previous.channel_address,
            actual: update.channel_address,
        });
    }
    Ok(previous.clone())
}

/// Index of the asset a create or resolve moves; the update and the
/// transfer have to agree on it.
fn transfer_asset_index(
    channel: &FullChannelState,
    update: &ChannelUpdate,
    transfer: &FullTransferState,
) -> Result<usize, ApplyError> {
    if transfer.asset_id != update.asset_id {
        return Err(ApplyError::AssetMismatch {
            expected: transfer.asset_id,
            actual: update.asset_id,
        });
    }
    channel
        .asset_index(&transfer.asset_id)
        .ok_or(ApplyError::AssetNotFound(transfer.asset_id))
}

fn checked_root(leaves: &[Hash], expected: Hash) -> Result<Hash, ApplyError> {
    let computed = merkle::root(leaves);
    if computed != expected {
        return Err(ApplyError::MerkleMismatch { expected, computed });
    }
    Ok(computed)
}

/// Active transfers after `update` was applied.
pub fn apply_to_transfers(
    update: &ChannelUpdate,
    active_transfers: &[FullTransferState],
    transfer: Option<&FullTransferState>,
) -> Vec<FullTransferState> {
    let mut active = active_transfers.to_vec();
    match (&update.details, transfer) {
        (UpdateDetails::Create(_), Some(transfer)) => active.push(transfer.clone()),
        (UpdateDetails::Resolve(details), _) => {
            active.retain(|t| t.transfer_id != details.transfer_id)
        }
        _ => {}
    }
    active
}
