//! Merkle root recomputation over foreign trees.
//!
//! The server never builds these trees itself. Writers declare the ordered
//! leaf hashes of a snapshot in its root commitment and the server only
//! recomputes the root to check the declaration, and tests individual leaves
//! for membership before persisting their blobs.

use sha2::{Digest as _, Sha256};

use crate::id::{Digest, RootHash};

/// Recomputes the Merkle root over an ordered list of leaf hashes.
///
/// Parents are `sha256(left || right)`; an odd trailing node is promoted
/// unchanged to the next level. A single leaf is its own root. An empty
/// list yields the all-zero digest, matching the root an empty commitment
/// must declare.
pub fn merkle_root(leaves: &[Digest]) -> RootHash {
    if leaves.is_empty() {
        return RootHash::zero();
    }

    let mut level: Vec<[u8; 32]> = leaves.iter().map(Digest::to_bytes).collect();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            match pair {
                [left, right] => {
                    let mut hasher = Sha256::new();
                    hasher.update(left);
                    hasher.update(right);
                    next.push(hasher.finalize().into());
                }
                [odd] => next.push(*odd),
                _ => unreachable!("chunks(2) yields one or two elements"),
            }
        }
        level = next;
    }

    let root = Digest::from_bytes(level[0]);
    root.as_str().parse().expect("digest is a valid root hash")
}

/// Whether `leaf` participates in the tree described by `leaves`.
pub fn contains_leaf(leaves: &[Digest], leaf: &Digest) -> bool {
    leaves.iter().any(|candidate| candidate == leaf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::sha256_hex;

    fn leaf(byte: u8) -> Digest {
        Digest::from_bytes([byte; 32])
    }

    #[test]
    fn empty_tree_is_zero_root() {
        assert!(merkle_root(&[]).is_zero());
    }

    #[test]
    fn single_leaf_is_its_own_root() {
        let l = leaf(3);
        assert_eq!(merkle_root(&[l.clone()]).as_str(), l.as_str());
    }

    #[test]
    fn two_leaves_hash_to_parent() {
        let (a, b) = (leaf(1), leaf(2));
        let mut concat = Vec::new();
        concat.extend_from_slice(&a.to_bytes());
        concat.extend_from_slice(&b.to_bytes());
        let expected = sha256_hex(&concat);
        assert_eq!(merkle_root(&[a, b]).as_str(), expected.as_str());
    }

    #[test]
    fn odd_leaf_is_promoted() {
        let (a, b, c) = (leaf(1), leaf(2), leaf(3));
        let pair_root = merkle_root(&[a.clone(), b.clone()]);
        let pair_digest: Digest = pair_root.as_str().parse().unwrap();
        let expected = merkle_root(&[pair_digest, c.clone()]);
        assert_eq!(merkle_root(&[a, b, c]), expected);
    }

    #[test]
    fn order_matters() {
        let (a, b) = (leaf(1), leaf(2));
        assert_ne!(
            merkle_root(&[a.clone(), b.clone()]),
            merkle_root(&[b, a])
        );
    }

    #[test]
    fn membership() {
        let leaves = vec![leaf(1), leaf(2)];
        assert!(contains_leaf(&leaves, &leaf(2)));
        assert!(!contains_leaf(&leaves, &leaf(9)));
    }
}
