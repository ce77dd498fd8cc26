//! Two-party state channel protocol: participants agree on channel updates
//! (setup, deposit, transfer create and resolve) by exchanging
//! double-signed updates, one channel at a time.
//!
//! [protocol::ChannelProtocol] is the entry point. It is built from the
//! [services] it depends on, [memory] has in-process implementations of all
//! of them.

mod abiencode {
    mod error;
    mod hashing;
    mod ser;

    pub mod as_bytes;
    pub mod types;

    pub use error::{Error, Result};
    pub use hashing::{keccak256, to_hash};
    pub use ser::{encode, to_writer, Serializer, Writer};

    #[cfg(test)]
    pub mod tests;
}
pub mod sig;

pub mod channel;
pub mod config;
pub mod events;
pub mod memory;
pub mod merkle;
pub mod params;
pub mod protocol;
pub mod queue;
pub mod services;
pub mod sync;
pub mod transfer;
pub mod update;

#[cfg(test)]
mod test_utils;

pub use abiencode::types::{Address, Hash, ParseError, Signature, U256};
pub use config::ProtocolConfig;
pub use protocol::{ChannelProtocol, ProtocolError};
pub use services::Services;
