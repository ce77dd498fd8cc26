#![allow(dead_code)]

use std::sync::Arc;

use channel_protocol::{
    channel::FullChannelState,
    memory::{MemoryChainReader, MemoryLockService, MemoryMessagingHub, MemoryStore},
    params::{CreateInput, DepositInput, ResolveInput, SetupInput},
    services::{AcceptAll, ExternalValidation, Services},
    sig::Signer,
    transfer::{linked_hash, FullTransferState, TransferKind},
    Address, ChannelProtocol, Hash, ProtocolConfig,
};
use rand::{rngs::StdRng, SeedableRng};
use serde_json::json;
use tracing_subscriber::EnvFilter;

pub const CHAIN_ID: u64 = 1337;
pub const FACTORY: &str = "0xfafafafafafafafafafafafafafafafafafafafa";
pub const MASTERCOPY: &str = "0xfbfbfbfbfbfbfbfbfbfbfbfbfbfbfbfbfbfbfbfb";
pub const LINKED_DEFINITION: &str = "0x1111111111111111111111111111111111111111";
pub const WITHDRAW_DEFINITION: &str = "0x2222222222222222222222222222222222222222";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn test_config() -> ProtocolConfig {
    ProtocolConfig {
        sync_on_startup: false,
        max_protocol_retries: 2,
        ..ProtocolConfig::default()
    }
}

pub struct Node {
    pub protocol: ChannelProtocol,
    pub store: Arc<MemoryStore>,
    pub seed: u64,
}

impl Node {
    pub fn signer(&self) -> Signer {
        Signer::new(&mut StdRng::seed_from_u64(self.seed))
    }

    pub async fn channel(&self, address: Address) -> FullChannelState {
        self.protocol
            .get_channel_state(&address)
            .await
            .unwrap()
            .expect("channel is stored")
    }
}

/// Two participants sharing one chain and one messaging hub.
pub struct Network {
    pub hub: Arc<MemoryMessagingHub>,
    pub chain: Arc<MemoryChainReader>,
    pub alice: Node,
    pub bob: Node,
}

impl Network {
    pub async fn new(seed: u64) -> Self {
        Self::with_validation(seed, Arc::new(AcceptAll)).await
    }

    /// Bob validates with `bob_validation`.
    pub async fn with_validation(seed: u64, bob_validation: Arc<dyn ExternalValidation>) -> Self {
        init_tracing();
        let hub = MemoryMessagingHub::new();
        let chain = Arc::new(MemoryChainReader::new(CHAIN_ID, vec![0x3d, 0x60, 0x2d, 0x80]));
        let alice = start_node(
            &hub,
            &chain,
            seed,
            Arc::new(MemoryStore::new()),
            Arc::new(AcceptAll),
            test_config(),
        )
        .await;
        let bob = start_node(
            &hub,
            &chain,
            seed + 1,
            Arc::new(MemoryStore::new()),
            bob_validation,
            test_config(),
        )
        .await;
        Self {
            hub,
            chain,
            alice,
            bob,
        }
    }

    /// Connect a fresh protocol instance for the signer and store of
    /// `node`, as after a restart.
    pub async fn restart(&self, node: &Node, config: ProtocolConfig) -> Node {
        start_node(
            &self.hub,
            &self.chain,
            node.seed,
            Arc::clone(&node.store),
            Arc::new(AcceptAll),
            config,
        )
        .await
    }

    /// Set up a channel with alice as the initiator.
    pub async fn setup(&self) -> Address {
        let channel = self
            .alice
            .protocol
            .setup(&setup_input(self.bob.protocol.public_identifier().as_str()))
            .await
            .unwrap();
        assert_eq!(channel.nonce, 1);
        channel.channel_address
    }

    /// Fund the channel on-chain and reconcile, alice's part as a tracked
    /// deposit and bob's as a plain transfer.
    pub async fn fund(&self, channel: Address, alice: u64, bob: u64) -> FullChannelState {
        self.chain.deposit_alice(channel, Address::ZERO, alice.into());
        self.chain.deposit_bob(channel, Address::ZERO, bob.into());
        self.alice
            .protocol
            .deposit(&deposit_input(channel))
            .await
            .unwrap()
    }
}

pub async fn start_node(
    hub: &Arc<MemoryMessagingHub>,
    chain: &Arc<MemoryChainReader>,
    seed: u64,
    store: Arc<MemoryStore>,
    validation: Arc<dyn ExternalValidation>,
    config: ProtocolConfig,
) -> Node {
    let signer = Signer::new(&mut StdRng::seed_from_u64(seed));
    let services = Services {
        store: store.clone(),
        messaging: Arc::new(hub.endpoint(signer.public_identifier().clone())),
        chain: chain.clone(),
        lock: Arc::new(MemoryLockService::new()),
        validation,
        signer: Arc::new(signer),
        config,
    };
    let protocol = ChannelProtocol::connect(services).await.unwrap();
    Node {
        protocol,
        store,
        seed,
    }
}

pub fn setup_input(counterparty: &str) -> SetupInput {
    serde_json::from_value(json!({
        "counterpartyIdentifier": counterparty,
        "timeout": "86400",
        "networkContext": {
            "chainId": CHAIN_ID,
            "providerUrl": "http://localhost:8545",
            "channelFactoryAddress": FACTORY,
            "channelMastercopyAddress": MASTERCOPY,
            "linkedTransferDefinition": LINKED_DEFINITION,
            "withdrawDefinition": WITHDRAW_DEFINITION,
        },
    }))
    .unwrap()
}

pub fn deposit_input(channel: Address) -> DepositInput {
    serde_json::from_value(json!({
        "channelAddress": channel.to_string(),
        "assetId": Address::ZERO.to_string(),
    }))
    .unwrap()
}

/// Linked transfer of `amount` from `from` to `to`.
pub fn linked_create_input(
    channel: Address,
    from: Address,
    to: Address,
    amount: u64,
    pre_image: Hash,
) -> CreateInput {
    serde_json::from_value(json!({
        "channelAddress": channel.to_string(),
        "amount": amount.to_string(),
        "assetId": Address::ZERO.to_string(),
        "transferDefinition": LINKED_DEFINITION,
        "transferInitialState": {
            "balance": {
                "amount": [amount.to_string(), "0"],
                "to": [from.to_string(), to.to_string()],
            },
            "linkedHash": linked_hash(&pre_image).to_string(),
        },
        "timeout": "3600",
        "encodings": TransferKind::Linked.encodings(),
        "meta": { "routingId": Hash([0x77; 32]).to_string() },
    }))
    .unwrap()
}

pub fn linked_resolve_input(channel: Address, transfer_id: Hash, pre_image: Hash) -> ResolveInput {
    serde_json::from_value(json!({
        "channelAddress": channel.to_string(),
        "transferId": transfer_id.to_string(),
        "transferResolver": { "preImage": pre_image.to_string() },
    }))
    .unwrap()
}

/// The transfer created by the latest update of `channel`.
pub fn created_transfer_id(channel: &FullChannelState) -> Hash {
    channel
        .latest_update
        .as_ref()
        .and_then(|u| u.details.transfer_id())
        .expect("latest update is a create")
}

/// Active transfers match the channel's merkle root.
pub async fn assert_merkle_consistent(node: &Node, channel: Address) {
    let state = node.channel(channel).await;
    let active: Vec<FullTransferState> = node.protocol.get_active_transfers(&channel).await.unwrap();
    assert_eq!(
        channel_protocol::merkle::root_of(&active).unwrap(),
        state.merkle_root
    );
}
