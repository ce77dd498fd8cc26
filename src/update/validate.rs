//! Checks on updates proposed by the counterparty, run before they are
//! applied.
//!
//! The applier only checks that an update is well-formed relative to the
//! previous state. The checks here make sure the counterparty did not
//! invent balances: deposits must be backed on-chain, creates must lock what
//! the initiator gives up and resolves must pay out what the transfer
//! definition says.

use super::generate::{channel_address_for, paid_out_balance, GenerationError};
use crate::{
    abiencode::{
        self,
        types::{Address, Hash, U256},
    },
    channel::{Balance, ChannelUpdate, CreateDetails, FullChannelState, ResolveDetails, UpdateDetails},
    services::{ChainError, ChainReader},
    sig::IdentifierError,
    transfer::{self, FullTransferState, TransferKind},
};

#[derive(Debug, thiserror::Error)]
pub enum InvalidUpdate {
    #[error("update is for {actual:?}, the channel between these parties is {expected:?}")]
    ChannelAddress { expected: Address, actual: Address },
    #[error("update is not from the counterparty of this channel")]
    WrongParticipants,
    #[error("deposit claims more than the {onchain} held on-chain")]
    DepositExceedsOnchain { onchain: U256 },
    #[error("deposit decreases a balance")]
    DepositDecreasesBalance,
    #[error("invalid transfer: {0}")]
    Transfer(String),
    #[error("balance mismatch: expected {expected:?}, update has {actual:?}")]
    BalanceMismatch { expected: Balance, actual: Balance },
    #[error("transfer {0:?} is not active")]
    TransferNotFound(Hash),
    #[error("update is for asset {actual:?}, the transfer locks {expected:?}")]
    AssetMismatch { expected: Address, actual: Address },
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error(transparent)]
    Identifier(#[from] IdentifierError),
    #[error(transparent)]
    Encoding(#[from] abiencode::Error),
}

/// Validate `update` against `previous` and return the transfer it creates
/// or resolves.
pub async fn validate_counterparty_update(
    update: &ChannelUpdate,
    previous: Option<&FullChannelState>,
    active_transfers: &[FullTransferState],
    chain: &dyn ChainReader,
) -> Result<Option<FullTransferState>, InvalidUpdate> {
    if let Some(channel) = previous {
        let from = channel.part_idx(&update.from_identifier);
        let to = channel.part_idx(&update.to_identifier);
        if from.is_none() || to.is_none() || from == to {
            return Err(InvalidUpdate::WrongParticipants);
        }
    }

    match (&update.details, previous) {
        (UpdateDetails::Setup(details), _) => {
            let expected = channel_address_for(
                &update.from_identifier,
                &update.to_identifier,
                &details.network_context,
                chain,
            )
            .await?;
            if expected != update.channel_address {
                return Err(InvalidUpdate::ChannelAddress {
                    expected,
                    actual: update.channel_address,
                });
            }
            Ok(None)
        }
        // The applier reports the missing channel.
        (_, None) => Ok(None),
        (UpdateDetails::Deposit(_), Some(channel)) => {
            check_deposit(update, channel, chain).await?;
            Ok(None)
        }
        (UpdateDetails::Create(details), Some(channel)) => {
            transfer_for_create(update, details, channel).map(Some)
        }
        (UpdateDetails::Resolve(details), Some(channel)) => {
            transfer_for_resolve(update, details, channel, active_transfers, chain)
                .await
                .map(Some)
        }
    }
}

async fn check_deposit(
    update: &ChannelUpdate,
    channel: &FullChannelState,
    chain: &dyn ChainReader,
) -> Result<(), InvalidUpdate> {
    let (previous, locked) = match channel.asset_index(&update.asset_id) {
        Some(idx) => (channel.balances[idx], channel.locked_balance[idx]),
        None => (Balance::new(channel.participants()), U256::zero()),
    };
    if update.balance.amount[0] < previous.amount[0] || update.balance.amount[1] < previous.amount[1] {
        return Err(InvalidUpdate::DepositDecreasesBalance);
    }

    let onchain = chain
        .channel_onchain_balance(
            &channel.channel_address,
            &update.asset_id,
            channel.network_context.chain_id,
        )
        .await?;
    let claimed = update
        .balance
        .total()
        .and_then(|total| total.checked_add(locked));
    match claimed {
        Some(claimed) if claimed <= onchain => Ok(()),
        _ => Err(InvalidUpdate::DepositExceedsOnchain { onchain }),
    }
}

/// Rebuild the transfer a create update commits to.
pub fn transfer_for_create(
    update: &ChannelUpdate,
    details: &CreateDetails,
    channel: &FullChannelState,
) -> Result<FullTransferState, InvalidUpdate> {
    let state = &details.transfer_initial_state;
    let kind = state.kind();
    let context = &channel.network_context;
    let registered = match kind {
        TransferKind::Linked => context.linked_transfer_definition,
        TransferKind::Withdraw => context.withdraw_definition,
    };
    if registered != Some(details.transfer_definition) {
        return Err(InvalidUpdate::Transfer(format!(
            "{:?} is not a registered {kind} definition",
            details.transfer_definition
        )));
    }
    if TransferKind::from_encodings(&details.transfer_encodings) != Some(kind) {
        return Err(InvalidUpdate::Transfer("encodings do not match the state".into()));
    }

    let expected_id = transfer::transfer_id(
        details.transfer_definition,
        channel.channel_address,
        details.transfer_timeout,
        channel.nonce,
    );
    if expected_id != details.transfer_id {
        return Err(InvalidUpdate::Transfer(format!(
            "id {:?} does not match {expected_id:?}",
            details.transfer_id
        )));
    }

    let initial_balance = *state.balance();
    let amount = initial_balance.amount[0];
    if !initial_balance.amount[1].is_zero() {
        return Err(InvalidUpdate::Transfer("responder must not lock funds".into()));
    }
    let idx = channel
        .asset_index(&update.asset_id)
        .ok_or_else(|| InvalidUpdate::Transfer(format!("unknown asset {:?}", update.asset_id)))?;
    let initiator = channel
        .part_idx(&update.from_identifier)
        .ok_or(InvalidUpdate::WrongParticipants)?;
    let mut expected = channel.balances[idx];
    expected.amount[initiator] = expected.amount[initiator]
        .checked_sub(amount)
        .ok_or_else(|| InvalidUpdate::Transfer("initiator cannot afford the transfer".into()))?;
    if expected != update.balance {
        return Err(InvalidUpdate::BalanceMismatch {
            expected,
            actual: update.balance,
        });
    }

    Ok(FullTransferState {
        transfer_id: details.transfer_id,
        channel_address: channel.channel_address,
        chain_id: context.chain_id,
        channel_factory_address: context.channel_factory_address,
        asset_id: update.asset_id,
        balance: initial_balance,
        initial_balance,
        transfer_definition: details.transfer_definition,
        transfer_state: state.clone(),
        transfer_resolver: None,
        transfer_timeout: details.transfer_timeout,
        transfer_encodings: details.transfer_encodings.clone(),
        initial_state_hash: state.initial_state_hash()?,
        meta: details.meta.clone(),
        initiator: update.from_identifier.address()?,
        responder: update.to_identifier.address()?,
        initiator_identifier: update.from_identifier.clone(),
        responder_identifier: update.to_identifier.clone(),
        channel_nonce: channel.nonce,
    })
}

/// The active transfer a resolve update unlocks, with resolver and final
/// balance attached.
pub async fn transfer_for_resolve(
    update: &ChannelUpdate,
    details: &ResolveDetails,
    channel: &FullChannelState,
    active_transfers: &[FullTransferState],
    chain: &dyn ChainReader,
) -> Result<FullTransferState, InvalidUpdate> {
    let mut transfer = active_transfers
        .iter()
        .find(|t| t.transfer_id == details.transfer_id)
        .cloned()
        .ok_or(InvalidUpdate::TransferNotFound(details.transfer_id))?;
    if transfer.transfer_definition != details.transfer_definition {
        return Err(InvalidUpdate::Transfer("definition does not match".into()));
    }
    if transfer.asset_id != update.asset_id {
        return Err(InvalidUpdate::AssetMismatch {
            expected: transfer.asset_id,
            actual: update.asset_id,
        });
    }
    transfer.transfer_resolver = Some(details.transfer_resolver.clone());

    let resolved = chain.resolve(&transfer, channel.network_context.chain_id).await?;
    let expected = paid_out_balance(channel, &transfer, &resolved)?;
    if expected != update.balance {
        return Err(InvalidUpdate::BalanceMismatch {
            expected,
            actual: update.balance,
        });
    }
    transfer.balance = resolved;
    Ok(transfer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        memory::{MemoryChainReader, MemoryStore},
        params::{CreateParams, ParamsDetails, ResolveParams, UpdateParams},
        services::Store,
        test_utils::*,
        transfer::{linked_hash, LinkedTransferState, TransferState},
        update::generate::{generate_update, GeneratedUpdate},
    };

    const OTHER_ASSET: Address = Address([7; 20]);

    fn chain() -> MemoryChainReader {
        MemoryChainReader::new(1337, vec![0x60, 0x80, 0x60, 0x40])
    }

    fn create_params(channel: &FullChannelState, amount: u64, pre_image: Hash) -> UpdateParams {
        let state = TransferState::Linked(LinkedTransferState {
            balance: Balance {
                amount: [amount.into(), U256::zero()],
                to: channel.participants(),
            },
            linked_hash: linked_hash(&pre_image),
        });
        UpdateParams {
            channel_address: channel.channel_address,
            details: ParamsDetails::Create(CreateParams {
                amount: amount.into(),
                asset_id: Address::ZERO,
                transfer_definition: LINKED_DEFINITION,
                encodings: state.encodings(),
                transfer_initial_state: state,
                timeout: 3600u64.into(),
                meta: serde_json::json!({}),
            }),
        }
    }

    /// Alice locks 4 of the zero asset for bob; the channel also holds a
    /// second asset.
    async fn created(
        store: &MemoryStore,
        chain: &MemoryChainReader,
        seed: u64,
        pre_image: Hash,
    ) -> (FullChannelState, GeneratedUpdate) {
        let (alice, bob) = signers(seed);
        let mut channel = with_asset(setup_channel(&alice, &bob), Address::ZERO, [10, 0]);
        channel = with_asset(channel, OTHER_ASSET, [100, 50]);
        let generated = generate_update(
            &create_params(&channel, 4, pre_image),
            Some(&channel),
            store,
            chain,
            &alice,
        )
        .await
        .unwrap();
        (channel, generated)
    }

    async fn resolved(
        store: &MemoryStore,
        chain: &MemoryChainReader,
        seed: u64,
    ) -> (GeneratedUpdate, GeneratedUpdate) {
        let pre_image = Hash([0x42; 32]);
        let (_, created) = created(store, chain, seed, pre_image).await;
        let transfer = created.transfer.clone().unwrap();
        store
            .save_channel_state(&created.channel, Some(&transfer))
            .await
            .unwrap();
        let (_, bob) = signers(seed);
        let params = UpdateParams {
            channel_address: transfer.channel_address,
            details: ParamsDetails::Resolve(ResolveParams {
                transfer_id: transfer.transfer_id,
                transfer_resolver: linked_resolver(pre_image),
                meta: serde_json::json!({}),
            }),
        };
        let resolved = generate_update(&params, Some(&created.channel), store, chain, &bob)
            .await
            .unwrap();
        (created, resolved)
    }

    #[tokio::test]
    async fn deposit_must_be_backed_onchain() {
        let (alice, bob) = signers(20);
        let chain = chain();
        let channel = setup_channel(&alice, &bob);
        chain.deposit_alice(channel.channel_address, Address::ZERO, 5u64.into());
        chain.deposit_bob(channel.channel_address, Address::ZERO, 3u64.into());
        let generated = generate_update(
            &UpdateParams {
                channel_address: channel.channel_address,
                details: ParamsDetails::Deposit {
                    asset_id: Address::ZERO,
                },
            },
            Some(&channel),
            &MemoryStore::new(),
            &chain,
            &bob,
        )
        .await
        .unwrap();
        let transfer = validate_counterparty_update(&generated.update, Some(&channel), &[], &chain)
            .await
            .unwrap();
        assert!(transfer.is_none());

        let mut inflated = generated.update.clone();
        inflated.balance.amount[1] = 4u64.into();
        assert!(matches!(
            validate_counterparty_update(&inflated, Some(&channel), &[], &chain).await,
            Err(InvalidUpdate::DepositExceedsOnchain { onchain }) if onchain == U256::from(8u64)
        ));

        // Alice already holds 6 in the channel.
        let funded = with_asset(setup_channel(&alice, &bob), Address::ZERO, [6, 0]);
        assert!(matches!(
            validate_counterparty_update(&generated.update, Some(&funded), &[], &chain).await,
            Err(InvalidUpdate::DepositDecreasesBalance)
        ));
    }

    #[tokio::test]
    async fn update_must_come_from_the_counterparty() {
        let (alice, bob) = signers(21);
        let (stranger, _) = signers(22);
        let channel = with_asset(setup_channel(&alice, &bob), Address::ZERO, [10, 0]);
        let (_, generated) = created(&MemoryStore::new(), &chain(), 21, Hash([1; 32])).await;

        let mut update = generated.update.clone();
        update.from_identifier = stranger.public_identifier().clone();
        assert!(matches!(
            validate_counterparty_update(&update, Some(&channel), &[], &chain()).await,
            Err(InvalidUpdate::WrongParticipants)
        ));

        let mut update = generated.update;
        update.to_identifier = update.from_identifier.clone();
        assert!(matches!(
            validate_counterparty_update(&update, Some(&channel), &[], &chain()).await,
            Err(InvalidUpdate::WrongParticipants)
        ));
    }

    #[tokio::test]
    async fn create_is_rebuilt_from_the_update() {
        let chain = chain();
        let (channel, generated) = created(&MemoryStore::new(), &chain, 23, Hash([1; 32])).await;
        let expected = generated.transfer.clone().unwrap();

        let transfer = validate_counterparty_update(&generated.update, Some(&channel), &[], &chain)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(transfer.transfer_id, expected.transfer_id);
        assert_eq!(transfer.hash().unwrap(), expected.hash().unwrap());

        let details = match &generated.update.details {
            UpdateDetails::Create(details) => details.clone(),
            other => panic!("unexpected details {other:?}"),
        };

        let mut wrong_id = details.clone();
        wrong_id.transfer_id = Hash([0xab; 32]);
        assert!(matches!(
            transfer_for_create(&generated.update, &wrong_id, &channel),
            Err(InvalidUpdate::Transfer(_))
        ));

        let mut unregistered = details.clone();
        unregistered.transfer_definition = WITHDRAW_DEFINITION;
        assert!(matches!(
            transfer_for_create(&generated.update, &unregistered, &channel),
            Err(InvalidUpdate::Transfer(_))
        ));

        let mut wrong_encodings = details.clone();
        wrong_encodings.transfer_encodings = vec!["tuple(uint256)".into(), "tuple()".into()];
        assert!(matches!(
            transfer_for_create(&generated.update, &wrong_encodings, &channel),
            Err(InvalidUpdate::Transfer(_))
        ));

        // Alice keeps more than she gives up.
        let mut update = generated.update.clone();
        update.balance.amount[0] = 7u64.into();
        assert!(matches!(
            transfer_for_create(&update, &details, &channel),
            Err(InvalidUpdate::BalanceMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn resolve_must_pay_out_the_transfer() {
        let chain = chain();
        let store = MemoryStore::new();
        let (created, resolved) = resolved(&store, &chain, 24).await;
        let active = created.active_transfers.clone();

        let transfer = validate_counterparty_update(&resolved.update, Some(&created.channel), &active, &chain)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(transfer.balance.amount, [U256::zero(), 4u64.into()]);

        let mut greedy = resolved.update.clone();
        greedy.balance.amount[1] = 5u64.into();
        assert!(matches!(
            validate_counterparty_update(&greedy, Some(&created.channel), &active, &chain).await,
            Err(InvalidUpdate::BalanceMismatch { .. })
        ));

        assert!(matches!(
            validate_counterparty_update(&resolved.update, Some(&created.channel), &[], &chain).await,
            Err(InvalidUpdate::TransferNotFound(_))
        ));
    }

    #[tokio::test]
    async fn resolve_must_name_the_transfer_asset() {
        let chain = chain();
        let store = MemoryStore::new();
        let (created, resolved) = resolved(&store, &chain, 25).await;
        let active = created.active_transfers.clone();

        // The payout matches, but it is booked on the other asset.
        let mut update = resolved.update.clone();
        update.asset_id = OTHER_ASSET;
        assert!(matches!(
            validate_counterparty_update(&update, Some(&created.channel), &active, &chain).await,
            Err(InvalidUpdate::AssetMismatch { expected, actual })
                if expected == Address::ZERO && actual == OTHER_ASSET
        ));
    }
}
