//! Creating, checking and applying channel updates.
//!
//! Everything here is free of messaging and persistence, the chain and the
//! store are only read.

mod apply;
mod generate;
mod validate;

pub use apply::{apply_to_transfers, apply_update, ApplyError};
pub use generate::{
    channel_address_for, generate_update, reconciled_deposit, GeneratedUpdate, GenerationError,
};
pub use validate::{validate_counterparty_update, InvalidUpdate};
