//! Errors of the ABI encoder.

use serde::ser;

/// Reasons a value cannot be ABI encoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// No Solidity type corresponds to this Rust type, e.g. floats, enums,
    /// options and maps. Channel and transfer data that contains them has to
    /// be converted into plain structs first.
    #[error("type is not representable in abi encoding: {0}")]
    TypeNotRepresentable(&'static str),
    /// Representable, but not implemented by the encoder (`char`).
    #[error("type is not yet implemented: {0}")]
    TypeNotYetSupported(&'static str),
    /// Raised by a hand-written `Serialize` implementation.
    #[error("{0}")]
    Custom(String),
}

impl ser::Error for Error {
    fn custom<T: core::fmt::Display>(msg: T) -> Self {
        Error::Custom(msg.to_string())
    }
}

pub type Result<T> = core::result::Result<T, Error>;
