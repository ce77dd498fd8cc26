//! `#[serde(with = "as_bytes")]` encodes a byte container as dynamic
//! Solidity `bytes` instead of `uint8[]`. Signatures in withdraw commitments
//! are the main user.
//!
//! Human readable formats get a `0x` prefixed hex string.

use super::ser::MARK_DYNAMIC_BYTES;
use serde::{Serialize, Serializer};

/// Borrowed bytes that go through `serialize_bytes`.
struct Raw<'a>(&'a [u8]);

impl Serialize for Raw<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(self.0)
    }
}

pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    T: AsRef<[u8]> + ?Sized,
    S: Serializer,
{
    let bytes = value.as_ref();
    if serializer.is_human_readable() {
        serializer.collect_str(&format_args!("0x{}", hex::encode(bytes)))
    } else {
        serializer.serialize_newtype_struct(MARK_DYNAMIC_BYTES, &Raw(bytes))
    }
}
