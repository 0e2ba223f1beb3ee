//! Merkle commitment over an ordered list of leaf digests.
//!
//! Levels are built bottom-up by hashing adjacent pairs; an odd node at the
//! end of a level is paired with itself. An empty leaf set commits to the
//! all-zero digest.

use super::crypto::{self, Digest};

/// Computes the Merkle root of the given leaves, hex encoded
pub fn merkle_root<T: AsRef<[u8]>>(leaves: &[T]) -> String {
    if leaves.is_empty() {
        return hex::encode([0u8; 32]);
    }

    let mut level: Vec<Digest> = leaves
        .iter()
        .map(|leaf| crypto::hash(leaf.as_ref()))
        .collect();

    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                let left = &pair[0];
                let right = pair.get(1).unwrap_or(left);
                hash_pair(left, right)
            })
            .collect();
    }

    hex::encode(level[0])
}

fn hash_pair(left: &Digest, right: &Digest) -> Digest {
    let mut combined = [0u8; 64];
    combined[..32].copy_from_slice(left);
    combined[32..].copy_from_slice(right);
    crypto::hash(&combined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::crypto::ZERO_HASH;

    #[test]
    fn test_empty_root_is_zero_digest() {
        let leaves: Vec<String> = Vec::new();
        assert_eq!(merkle_root(leaves.as_slice()), ZERO_HASH);
    }

    #[test]
    fn test_single_leaf_root_is_leaf_hash() {
        assert_eq!(merkle_root(&["a"]), crypto::hash_hex(b"a"));
    }

    #[test]
    fn test_odd_leaf_is_paired_with_itself() {
        let a = crypto::hash(b"a");
        let b = crypto::hash(b"b");
        let c = crypto::hash(b"c");
        let expected = hash_pair(&hash_pair(&a, &b), &hash_pair(&c, &c));

        assert_eq!(merkle_root(&["a", "b", "c"]), hex::encode(expected));
    }

    #[test]
    fn test_order_matters() {
        assert_ne!(merkle_root(&["a", "b"]), merkle_root(&["b", "a"]));
    }
}
