use crate::abiencode::{
    keccak256,
    types::{Address, U256},
};

/// Deterministic address of the channel multisig for `alice` and `bob`.
///
/// The factory deploys the proxy with CREATE2, so the address follows from
/// the factory address, the salt (`keccak256(alice ‖ bob ‖ chainId)`, packed)
/// and the proxy creation code.
pub fn channel_address(
    alice: Address,
    bob: Address,
    chain_id: u64,
    factory: Address,
    proxy_creation_code: &[u8],
) -> Address {
    // Packed encoding => We can't use the serializer
    let mut salt_input = Vec::with_capacity(20 + 20 + 32);
    salt_input.extend_from_slice(&alice.0);
    salt_input.extend_from_slice(&bob.0);
    let mut chain_id_bytes = [0u8; 32];
    U256::from(chain_id).to_big_endian(&mut chain_id_bytes);
    salt_input.extend_from_slice(&chain_id_bytes);
    let salt = keccak256(&salt_input);

    let code_hash = keccak256(proxy_creation_code);

    let mut create2_input = Vec::with_capacity(1 + 20 + 32 + 32);
    create2_input.push(0xff);
    create2_input.extend_from_slice(&factory.0);
    create2_input.extend_from_slice(&salt.0);
    create2_input.extend_from_slice(&code_hash.0);
    let hash = keccak256(&create2_input);

    let mut addr = Address::ZERO;
    addr.0.copy_from_slice(&hash.0[32 - 20..]);
    addr
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depends_on_all_inputs() {
        let alice = Address([1; 20]);
        let bob = Address([2; 20]);
        let factory = Address([3; 20]);
        let code = [0x60u8, 0x80, 0x60, 0x40];

        let base = channel_address(alice, bob, 1, factory, &code);
        assert_eq!(base, channel_address(alice, bob, 1, factory, &code));
        assert_ne!(base, channel_address(bob, alice, 1, factory, &code));
        assert_ne!(base, channel_address(alice, bob, 2, factory, &code));
        assert_ne!(base, channel_address(alice, bob, 1, Address([4; 20]), &code));
        assert_ne!(base, channel_address(alice, bob, 1, factory, &code[..3]));
    }
}
