//! Encoder tests compare against slot listings such as
//!
//! ```text
//! 0000000000000000000000000000000000000000000000000000000000000045 x
//! 0000000000000000000000000000000000000000000000000000000000000001 y
//! ```
//!
//! Every non-empty line starts with one 32 byte slot in hex; the rest of the
//! line is a note shown when the slot does not match.

mod simple;
mod solidity_docs;

use super::*;
use serde::Serialize;

/// Collects slots as hex so mismatches print readably.
#[derive(Default)]
struct SlotCollector(Vec<String>);

impl Writer for SlotCollector {
    fn write(&mut self, slot: &[u8]) {
        assert_eq!(slot.len(), 32, "encoder wrote a partial slot");
        self.0.push(hex::encode(slot));
    }
}

/// `(slot, whole line)` pairs of a listing.
fn parse_listing(listing: &str) -> Vec<(String, &str)> {
    listing
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let slot = line
                .get(..64)
                .unwrap_or_else(|| panic!("line does not start with a slot: {line:?}"));
            assert!(hex::decode(slot).is_ok(), "not a hex slot: {line:?}");
            (slot.to_lowercase(), line)
        })
        .collect()
}

fn compare(written: SlotCollector, listing: &str) {
    let expected = parse_listing(listing);
    for (idx, (actual, (slot, line))) in written.0.iter().zip(&expected).enumerate() {
        assert_eq!(actual, slot, "slot {idx} differs, expected {line}");
    }
    assert_eq!(
        written.0.len(),
        expected.len(),
        "wrote {} slots, expected {}",
        written.0.len(),
        expected.len()
    );
}

/// Function arguments: like [serialize_and_compare] but without the offset
/// of the outer tuple.
pub fn serialize_and_compare_fnargs<T: Serialize>(value: &T, listing: &str) {
    let mut written = SlotCollector::default();
    ser::to_fnargs_writer(value, &mut written).unwrap();
    compare(written, listing);
}

pub fn serialize_and_compare<T: Serialize>(value: &T, listing: &str) {
    let mut written = SlotCollector::default();
    to_writer(value, &mut written).unwrap();
    compare(written, listing);
}
