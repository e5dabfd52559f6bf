//! Merkle tree commitments
//!
//! Leaves are combined pairwise bottom-up with SHA256d; an odd leaf at the
//! end of a level is paired with itself. A single leaf is its own root and
//! an empty tree commits to the zero hash.

use serde::{Deserialize, Serialize};

use crate::constants::ZERO_HASH;
use crate::crypto::hash_pair;
use crate::types::Hash;

/// One step of an inclusion proof
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    #[serde(with = "hex")]
    pub hash: Hash,
    /// Sibling sits to the left of the running hash
    pub sibling_on_left: bool,
}

/// Inclusion proof for a single leaf
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub leaf_index: u64,
    pub siblings: Vec<ProofStep>,
}

/// MerkleRoot: ℍ* → ℍ
pub fn merkle_root(leaves: &[Hash]) -> Hash {
    if leaves.is_empty() {
        return ZERO_HASH;
    }

    let mut level = leaves.to_vec();
    while level.len() > 1 {
        level = next_level(&level);
    }
    level[0]
}

fn next_level(level: &[Hash]) -> Vec<Hash> {
    level
        .chunks(2)
        .map(|pair| {
            let left = &pair[0];
            let right = pair.get(1).unwrap_or(left);
            hash_pair(left, right)
        })
        .collect()
}

/// Build the inclusion proof of `leaves[index]`
pub fn merkle_proof(leaves: &[Hash], index: usize) -> Option<MerkleProof> {
    if index >= leaves.len() {
        return None;
    }

    let mut siblings = Vec::new();
    let mut level = leaves.to_vec();
    let mut position = index;

    while level.len() > 1 {
        let sibling = if position % 2 == 0 {
            level.get(position + 1).unwrap_or(&level[position])
        } else {
            &level[position - 1]
        };
        siblings.push(ProofStep {
            hash: *sibling,
            sibling_on_left: position % 2 == 1,
        });
        level = next_level(&level);
        position /= 2;
    }

    Some(MerkleProof {
        leaf_index: index as u64,
        siblings,
    })
}

/// Fold a proof from `leaf` and compare with `root`
pub fn verify_proof(leaf: &Hash, proof: &MerkleProof, root: &Hash) -> bool {
    let computed = proof.siblings.iter().fold(*leaf, |acc, step| {
        if step.sibling_on_left {
            hash_pair(&step.hash, &acc)
        } else {
            hash_pair(&acc, &step.hash)
        }
    });
    &computed == root
}
