//! Fixtures shared by the unit tests.

use crate::{
    abiencode::types::{Address, Hash, U256},
    channel::{Balance, FullChannelState, NetworkContext},
    sig::Signer,
    transfer::{
        self, linked_hash, FullTransferState, LinkedTransferResolver, LinkedTransferState,
        TransferResolver, TransferState,
    },
};
use rand::{rngs::StdRng, SeedableRng};

pub const LINKED_DEFINITION: Address = Address([0x11; 20]);
pub const WITHDRAW_DEFINITION: Address = Address([0x22; 20]);

pub fn signers(seed: u64) -> (Signer, Signer) {
    let mut rng = StdRng::seed_from_u64(seed);
    (Signer::new(&mut rng), Signer::new(&mut rng))
}

pub fn network_context() -> NetworkContext {
    NetworkContext {
        chain_id: 1337,
        provider_url: "http://localhost:8545".to_string(),
        channel_factory_address: Address([0xfa; 20]),
        channel_mastercopy_address: Address([0xfb; 20]),
        linked_transfer_definition: Some(LINKED_DEFINITION),
        withdraw_definition: Some(WITHDRAW_DEFINITION),
    }
}

/// Channel right after setup (nonce 1, no assets).
pub fn setup_channel(alice: &Signer, bob: &Signer) -> FullChannelState {
    FullChannelState {
        channel_address: Address([0xcc; 20]),
        alice: alice.address(),
        bob: bob.address(),
        alice_identifier: alice.public_identifier().clone(),
        bob_identifier: bob.public_identifier().clone(),
        network_context: network_context(),
        nonce: 1,
        asset_ids: vec![],
        balances: vec![],
        locked_balance: vec![],
        latest_deposit_nonce: 0,
        merkle_root: Hash::default(),
        latest_update: None,
        timeout: 86400.into(),
        in_dispute: false,
    }
}

/// Add `asset` with the given balance to `channel`.
pub fn with_asset(mut channel: FullChannelState, asset: Address, amount: [u64; 2]) -> FullChannelState {
    channel.asset_ids.push(asset);
    channel.balances.push(Balance {
        amount: [amount[0].into(), amount[1].into()],
        to: channel.participants(),
    });
    channel.locked_balance.push(U256::zero());
    channel
}

/// Linked transfer from `initiator` (0 alice, 1 bob) locking `amount` of
/// the zero asset.
pub fn linked_transfer(
    channel: &FullChannelState,
    initiator: usize,
    amount: u64,
    pre_image: Hash,
) -> FullTransferState {
    let participants = channel.participants();
    let identifiers = channel.identifiers();
    let responder = 1 - initiator;
    let balance = Balance {
        amount: [amount.into(), U256::zero()],
        to: [participants[initiator], participants[responder]],
    };
    let state = TransferState::Linked(LinkedTransferState {
        balance,
        linked_hash: linked_hash(&pre_image),
    });
    let timeout = U256::from(3600);
    FullTransferState {
        transfer_id: transfer::transfer_id(
            LINKED_DEFINITION,
            channel.channel_address,
            timeout,
            channel.nonce,
        ),
        channel_address: channel.channel_address,
        chain_id: channel.network_context.chain_id,
        channel_factory_address: channel.network_context.channel_factory_address,
        asset_id: Address::ZERO,
        balance,
        initial_balance: balance,
        transfer_definition: LINKED_DEFINITION,
        initial_state_hash: state.initial_state_hash().unwrap(),
        transfer_encodings: state.encodings(),
        transfer_state: state,
        transfer_resolver: None,
        transfer_timeout: timeout,
        meta: serde_json::json!({}),
        initiator: participants[initiator],
        responder: participants[responder],
        initiator_identifier: identifiers[initiator].clone(),
        responder_identifier: identifiers[responder].clone(),
        channel_nonce: channel.nonce,
    }
}

pub fn linked_resolver(pre_image: Hash) -> TransferResolver {
    TransferResolver::Linked(LinkedTransferResolver { pre_image })
}
