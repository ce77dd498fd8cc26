//! Merkle tree over the hashes of the active transfers of a channel.
//!
//! Leaves are sorted and pairs are hashed in sorted order, so proofs do not
//! need to carry left/right information. A layer with an odd number of nodes
//! promotes its last node unchanged. The root of an empty tree is the zero
//! hash.

use crate::{
    abiencode::{self, keccak256, types::Hash},
    transfer::FullTransferState,
};

fn hash_pair(a: &Hash, b: &Hash) -> Hash {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    let mut data = [0u8; 64];
    data[..32].copy_from_slice(&first.0);
    data[32..].copy_from_slice(&second.0);
    keccak256(&data)
}

fn next_layer(layer: &[Hash]) -> Vec<Hash> {
    layer
        .chunks(2)
        .map(|pair| match pair {
            [a, b] => hash_pair(a, b),
            [a] => *a,
            _ => unreachable!("chunks(2) yields one or two elements"),
        })
        .collect()
}

fn sorted(leaves: &[Hash]) -> Vec<Hash> {
    let mut layer = leaves.to_vec();
    layer.sort_unstable();
    layer
}

pub fn root(leaves: &[Hash]) -> Hash {
    let mut layer = sorted(leaves);
    if layer.is_empty() {
        return Hash::default();
    }
    while layer.len() > 1 {
        layer = next_layer(&layer);
    }
    layer[0]
}

/// Sibling hashes from `leaf` up to the root, `None` if `leaf` is not part of
/// the tree.
pub fn proof(leaves: &[Hash], leaf: &Hash) -> Option<Vec<Hash>> {
    let mut layer = sorted(leaves);
    let mut idx = layer.iter().position(|l| l == leaf)?;
    let mut proof = Vec::new();
    while layer.len() > 1 {
        let sibling = idx ^ 1;
        if sibling < layer.len() {
            proof.push(layer[sibling]);
        }
        layer = next_layer(&layer);
        idx /= 2;
    }
    Some(proof)
}

pub fn verify(proof: &[Hash], leaf: &Hash, root: &Hash) -> bool {
    let computed = proof.iter().fold(*leaf, |acc, p| hash_pair(&acc, p));
    computed == *root
}

/// Leaves of `transfers`, in the order given.
pub fn leaves(transfers: &[FullTransferState]) -> Result<Vec<Hash>, abiencode::Error> {
    transfers.iter().map(FullTransferState::hash).collect()
}

/// Root over the given (active) transfers.
pub fn root_of(transfers: &[FullTransferState]) -> Result<Hash, abiencode::Error> {
    Ok(root(&leaves(transfers)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn random_leaves(n: usize) -> Vec<Hash> {
        let mut rng = StdRng::seed_from_u64(n as u64);
        (0..n).map(|_| rng.gen()).collect()
    }

    #[test]
    fn empty_and_single() {
        assert_eq!(root(&[]), Hash::default());
        let leaf = Hash([5; 32]);
        assert_eq!(root(&[leaf]), leaf);
        assert_eq!(proof(&[leaf], &leaf), Some(vec![]));
    }

    #[test]
    fn order_independent() {
        let mut leaves = random_leaves(5);
        let r = root(&leaves);
        leaves.reverse();
        assert_eq!(root(&leaves), r);
    }

    #[test]
    fn proofs_verify() {
        for n in 1..10 {
            let leaves = random_leaves(n);
            let r = root(&leaves);
            for leaf in &leaves {
                let p = proof(&leaves, leaf).unwrap();
                assert!(verify(&p, leaf, &r), "n = {}", n);
                assert!(!verify(&p, &Hash([0xff; 32]), &r));
            }
        }
    }

    #[test]
    fn missing_leaf_has_no_proof() {
        let leaves = random_leaves(3);
        assert_eq!(proof(&leaves, &Hash([1; 32])), None);
    }

    #[test]
    fn two_leaves() {
        let a = Hash([1; 32]);
        let b = Hash([2; 32]);
        assert_eq!(root(&[b, a]), hash_pair(&a, &b));
        assert_eq!(hash_pair(&a, &b), hash_pair(&b, &a));
    }
}
