//! Channel data: the state both parties keep in sync, the updates moving it
//! forward and the on-chain representation they sign.

mod address;
mod channel_update;
mod state;

pub use address::*;
pub use channel_update::*;
pub use state::*;

use crate::abiencode::types::{Address, U256};
use serde::Serialize;

/// Index of a participant in the channel.
///
/// `0` is Alice, the party that initiated the setup.
pub type PartIdx = usize;

pub const PARTICIPANTS: usize = 2;

/// Chain and contract information a channel lives on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkContext {
    pub chain_id: u64,
    pub provider_url: String,
    pub channel_factory_address: Address,
    pub channel_mastercopy_address: Address,
    pub linked_transfer_definition: Option<Address>,
    pub withdraw_definition: Option<Address>,
}

/// Balance of a single asset. `amount[i]` belongs to `to[i]`.
///
/// The field order matches the Solidity struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Balance {
    pub amount: [U256; 2],
    pub to: [Address; 2],
}

impl Balance {
    pub fn new(to: [Address; 2]) -> Self {
        Self {
            amount: [U256::zero(); 2],
            to,
        }
    }

    /// Sum of both amounts, `None` on overflow.
    pub fn total(&self) -> Option<U256> {
        self.amount[0].checked_add(self.amount[1])
    }
}
