use super::*;
use types::U256;

// The following tests come from the solidity documentation:
// https://docs.soliditylang.org/en/v0.8.17/abi-spec.html#examples
//
// The code below intentionally does NOT include the method ID (4 bytes), as
// that is not representable in the serializer and can be added afterwards.
//
// The solidity docs explains function arguments, which does not include the
// 0x20 offset of structs, therefore we use serialize_and_compare_fnargs.

/// `bytes10` for the tests below.
#[derive(Debug)]
struct Bytes10([u8; 10]);

impl Serialize for Bytes10 {
    fn serialize<S>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_bytes(&self.0)
    }
}

/*
contract Foo {
    function baz(uint32 x, bool y) public pure returns (bool r) { r = x > 32 || y; }
    function sam(bytes memory, bool, uint[] memory) public pure {}
}
*/
#[test]
fn foo_baz() {
    #[derive(Serialize, Debug)]
    struct Baz(u32, bool);

    let d = Baz(69, true);

    let expected = "
0000000000000000000000000000000000000000000000000000000000000045
0000000000000000000000000000000000000000000000000000000000000001
    ";
    serialize_and_compare(&d, expected);
}

#[test]
fn foo_sam() {
    #[derive(Serialize, Debug)]
    struct Sam(#[serde(with = "as_bytes")] Vec<u8>, bool, Vec<U256>);

    let d = Sam(b"dave".to_vec(), true, vec![1.into(), 2.into(), 3.into()]);

    let expected = "
0000000000000000000000000000000000000000000000000000000000000060 // [0] (bytes) offset
0000000000000000000000000000000000000000000000000000000000000001 // [1] (bool)
00000000000000000000000000000000000000000000000000000000000000a0 // [2] (uint[]) offset
0000000000000000000000000000000000000000000000000000000000000004 // [0] (bytes) length
6461766500000000000000000000000000000000000000000000000000000000 // [0] (bytes)
0000000000000000000000000000000000000000000000000000000000000003 // [2] (uint[]) length
0000000000000000000000000000000000000000000000000000000000000001 // [2][0]
0000000000000000000000000000000000000000000000000000000000000002 // [2][1]
0000000000000000000000000000000000000000000000000000000000000003 // [2][2]
    ";
    serialize_and_compare_fnargs(&d, expected);
}

// function f(uint256, uint32[], bytes10, bytes)
#[test]
fn dynamic_types() {
    #[derive(Serialize, Debug)]
    struct F(
        U256,
        Vec<u32>,
        Bytes10,
        #[serde(with = "as_bytes")] Vec<u8>,
    );

    let d = F(
        0x123.into(),
        vec![0x456, 0x789],
        Bytes10(*b"1234567890"),
        b"Hello, world!".to_vec(),
    );

    let expected = "
0000000000000000000000000000000000000000000000000000000000000123 // [0] (uint256)
0000000000000000000000000000000000000000000000000000000000000080 // [1] (uint32[]) offset
3132333435363738393000000000000000000000000000000000000000000000 // [2] (bytes10)
00000000000000000000000000000000000000000000000000000000000000e0 // [3] (bytes) offset
0000000000000000000000000000000000000000000000000000000000000002 // [1] length
0000000000000000000000000000000000000000000000000000000000000456 // [1][0]
0000000000000000000000000000000000000000000000000000000000000789 // [1][1]
000000000000000000000000000000000000000000000000000000000000000d // [3] length
48656c6c6f2c20776f726c642100000000000000000000000000000000000000 // [3]
    ";
    serialize_and_compare_fnargs(&d, expected);
}

// function g(uint256[][], string[])
#[test]
fn nested_dynamic_arrays() {
    #[derive(Serialize, Debug)]
    struct G(Vec<Vec<U256>>, Vec<String>);

    let d = G(
        vec![vec![1.into(), 2.into()], vec![3.into()]],
        vec!["one".into(), "two".into(), "three".into()],
    );

    let expected = "
0000000000000000000000000000000000000000000000000000000000000040 // offset of [[1, 2], [3]]
0000000000000000000000000000000000000000000000000000000000000140 // offset of [\"one\", \"two\", \"three\"]
0000000000000000000000000000000000000000000000000000000000000002 // count for [[1, 2], [3]]
0000000000000000000000000000000000000000000000000000000000000040 // offset of [1, 2]
00000000000000000000000000000000000000000000000000000000000000a0 // offset of [3]
0000000000000000000000000000000000000000000000000000000000000002 // count for [1, 2]
0000000000000000000000000000000000000000000000000000000000000001 // encoding of 1
0000000000000000000000000000000000000000000000000000000000000002 // encoding of 2
0000000000000000000000000000000000000000000000000000000000000001 // count for [3]
0000000000000000000000000000000000000000000000000000000000000003 // encoding of 3
0000000000000000000000000000000000000000000000000000000000000003 // count for [\"one\", \"two\", \"three\"]
0000000000000000000000000000000000000000000000000000000000000060 // offset for \"one\"
00000000000000000000000000000000000000000000000000000000000000a0 // offset for \"two\"
00000000000000000000000000000000000000000000000000000000000000e0 // offset for \"three\"
0000000000000000000000000000000000000000000000000000000000000003 // count for \"one\"
6f6e650000000000000000000000000000000000000000000000000000000000 // encoding of \"one\"
0000000000000000000000000000000000000000000000000000000000000003 // count for \"two\"
74776f0000000000000000000000000000000000000000000000000000000000 // encoding of \"two\"
0000000000000000000000000000000000000000000000000000000000000005 // count for \"three\"
7468726565000000000000000000000000000000000000000000000000000000 // encoding of \"three\"
    ";
    serialize_and_compare_fnargs(&d, expected);
}
