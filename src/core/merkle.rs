use crate::error::{LedgerError, Result};
use crate::utils::{sha256_digest, Hash};
use serde::{Deserialize, Serialize};

/// Merkle tree over the record ids of a block body.
///
/// Levels are stored bottom-up; an odd node at any level is paired with
/// itself (Bitcoin behavior), and a single leaf is hashed with itself so the
/// root is never a bare record id.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    levels: Vec<Vec<Hash>>,
}

/// Inclusion proof for one page record in a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    /// Record id being proven
    pub leaf: Hash,
    /// Records root the proof resolves to
    pub root: Hash,
    /// Sibling hashes from the leaf upwards
    pub path: Vec<ProofElement>,
    /// Position of the record in the block body
    pub leaf_index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofElement {
    pub hash: Hash,
    /// true if the sibling is on the right
    pub is_right: bool,
}

impl MerkleTree {
    pub fn from_leaves(leaves: &[Hash]) -> Result<MerkleTree> {
        if leaves.is_empty() {
            return Err(LedgerError::Validation(crate::error::ChainValidationError {
                index: 0,
                kind: crate::error::ValidationErrorKind::EmptyBody,
            }));
        }

        let mut levels = vec![leaves.to_vec()];
        loop {
            let current = &levels[levels.len() - 1];
            if current.len() == 1 && levels.len() > 1 {
                break;
            }
            let parent: Vec<Hash> = current
                .chunks(2)
                .map(|pair| match pair {
                    [left, right] => Self::hash_pair(left, right),
                    [single] => Self::hash_pair(single, single),
                    _ => unreachable!("chunks(2) yields one or two elements"),
                })
                .collect();
            levels.push(parent);
        }

        Ok(MerkleTree { levels })
    }

    pub fn root(&self) -> Hash {
        self.levels[self.levels.len() - 1][0]
    }

    /// Root over a list of leaves; `Hash::ZERO` for an empty list.
    pub fn calculate_root(leaves: &[Hash]) -> Hash {
        match Self::from_leaves(leaves) {
            Ok(tree) => tree.root(),
            Err(_) => Hash::ZERO,
        }
    }

    pub fn generate_proof(&self, leaf_index: usize) -> Result<MerkleProof> {
        let leaves = &self.levels[0];
        if leaf_index >= leaves.len() {
            return Err(LedgerError::Validation(crate::error::ChainValidationError {
                index: leaf_index as u64,
                kind: crate::error::ValidationErrorKind::BadRecordsRoot,
            }));
        }

        let mut path = Vec::new();
        let mut position = leaf_index;
        for level in &self.levels[..self.levels.len() - 1] {
            let is_right = position % 2 == 0;
            let sibling_index = if is_right { position + 1 } else { position - 1 };
            let sibling = level.get(sibling_index).unwrap_or(&level[position]);
            path.push(ProofElement {
                hash: *sibling,
                is_right,
            });
            position /= 2;
        }

        Ok(MerkleProof {
            leaf: leaves[leaf_index],
            root: self.root(),
            path,
            leaf_index,
        })
    }

    fn hash_pair(left: &Hash, right: &Hash) -> Hash {
        let mut data = Vec::with_capacity(64);
        data.extend(left.as_bytes());
        data.extend(right.as_bytes());
        sha256_digest(&data)
    }
}

impl MerkleProof {
    pub fn verify(&self) -> bool {
        let computed = self.path.iter().fold(self.leaf, |current, element| {
            if element.is_right {
                MerkleTree::hash_pair(&current, &element.hash)
            } else {
                MerkleTree::hash_pair(&element.hash, &current)
            }
        });
        computed == self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(n: u8) -> Vec<Hash> {
        (0..n).map(|i| sha256_digest(&[i])).collect()
    }

    #[test]
    fn test_single_leaf_is_hashed_with_itself() {
        let leaf = sha256_digest(b"only");
        let tree = MerkleTree::from_leaves(&[leaf]).unwrap();
        assert_eq!(tree.root(), MerkleTree::hash_pair(&leaf, &leaf));
    }

    #[test]
    fn test_root_depends_on_order() {
        let mut items = leaves(4);
        let root = MerkleTree::calculate_root(&items);
        items.swap(1, 2);
        assert_ne!(root, MerkleTree::calculate_root(&items));
    }

    #[test]
    fn test_proofs_verify_for_every_leaf() {
        for n in 1..=7 {
            let items = leaves(n);
            let tree = MerkleTree::from_leaves(&items).unwrap();
            for i in 0..items.len() {
                let proof = tree.generate_proof(i).unwrap();
                assert!(proof.verify(), "proof for leaf {i} of {n} failed");
            }
        }
    }

    #[test]
    fn test_tampered_proof_fails() {
        let tree = MerkleTree::from_leaves(&leaves(5)).unwrap();
        let mut proof = tree.generate_proof(3).unwrap();
        proof.leaf = sha256_digest(b"forged");
        assert!(!proof.verify());
        assert!(tree.generate_proof(5).is_err());
    }

    #[test]
    fn test_empty_root_is_zero() {
        assert_eq!(MerkleTree::calculate_root(&[]), Hash::ZERO);
    }
}
