use super::*;
use types::{Address, Hash, U256};

#[test]
fn address_is_right_aligned() {
    // Random address from etherscan, do not use!
    let addr: Address = "0x95222290DD7278Aa3Ddd389Cc1E1d165CC4BAfe5"
        .parse()
        .unwrap();

    let expected = "
00000000000000000000000095222290dd7278aa3ddd389cc1e1d165cc4bafe5
    ";
    serialize_and_compare_fnargs(&addr, expected);
}

#[test]
fn hash_and_u256() {
    #[derive(Serialize, Debug)]
    struct D {
        h: Hash,
        v: U256,
    }
    let d = D {
        h: Hash([0x11; 32]),
        v: U256::MAX,
    };

    let expected = "
1111111111111111111111111111111111111111111111111111111111111111
ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff
    ";
    serialize_and_compare(&d, expected);
}

#[test]
fn negative_numbers_are_sign_extended() {
    let expected = "
ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff
    ";
    serialize_and_compare_fnargs(&-1i8, expected);
    serialize_and_compare_fnargs(&-1i64, expected);
}

#[test]
fn static_struct_in_struct() {
    #[derive(Serialize, Debug)]
    struct Inner {
        amount: [U256; 2],
    }
    #[derive(Serialize, Debug)]
    struct Outer {
        a: u8,
        inner: Inner,
        b: bool,
    }

    let d = Outer {
        a: 1,
        inner: Inner {
            amount: [2.into(), 3.into()],
        },
        b: true,
    };

    // Completely static, everything is inlined and there is no outer offset.
    let expected = "
0000000000000000000000000000000000000000000000000000000000000001 // a
0000000000000000000000000000000000000000000000000000000000000002 // inner.amount[0]
0000000000000000000000000000000000000000000000000000000000000003 // inner.amount[1]
0000000000000000000000000000000000000000000000000000000000000001 // b
    ";
    serialize_and_compare(&d, expected);
}

#[test]
fn dynamic_struct_has_outer_offset() {
    #[derive(Serialize, Debug)]
    struct D {
        a: u64,
        b: Vec<u64>,
    }

    let d = D { a: 1, b: vec![2] };

    let expected = "
0000000000000000000000000000000000000000000000000000000000000020 // offset of d
0000000000000000000000000000000000000000000000000000000000000001 // a
0000000000000000000000000000000000000000000000000000000000000040 // offset of b
0000000000000000000000000000000000000000000000000000000000000001 // b.length
0000000000000000000000000000000000000000000000000000000000000002 // b[0]
    ";
    serialize_and_compare(&d, expected);
}

#[test]
fn array_of_static_structs() {
    #[derive(Serialize, Debug)]
    struct Pair {
        x: u8,
        y: u8,
    }

    let d: Vec<Pair> = vec![Pair { x: 1, y: 2 }, Pair { x: 3, y: 4 }];

    let expected = "
0000000000000000000000000000000000000000000000000000000000000020 // offset
0000000000000000000000000000000000000000000000000000000000000002 // length
0000000000000000000000000000000000000000000000000000000000000001 // [0].x
0000000000000000000000000000000000000000000000000000000000000002 // [0].y
0000000000000000000000000000000000000000000000000000000000000003 // [1].x
0000000000000000000000000000000000000000000000000000000000000004 // [1].y
    ";
    serialize_and_compare(&d, expected);
}

#[test]
fn empty_bytes() {
    #[derive(Serialize, Debug)]
    struct D(#[serde(with = "as_bytes")] Vec<u8>);

    let expected = "
0000000000000000000000000000000000000000000000000000000000000020 // offset
0000000000000000000000000000000000000000000000000000000000000000 // length
    ";
    serialize_and_compare_fnargs(&D(vec![]), expected);
}

#[test]
fn unrepresentable_types() {
    #[derive(Serialize, Debug)]
    enum E {
        A,
    }

    assert_eq!(
        encode(&Some(1u8)),
        Err(Error::TypeNotRepresentable("Option"))
    );
    assert_eq!(encode(&E::A), Err(Error::TypeNotRepresentable("E")));
    assert_eq!(encode(&1.5f64), Err(Error::TypeNotRepresentable("f64")));
    assert_eq!(encode(&'c'), Err(Error::TypeNotYetSupported("char")));
}

#[test]
fn hash_matches_keccak_of_encoding() {
    let d = (1u8, 2u8);
    let encoded = encode(&d).unwrap();
    assert_eq!(encoded.len(), 64);
    assert_eq!(to_hash(&d).unwrap(), keccak256(&encoded));
}
