//! Proof of work
//!
//! A block's work hash is SHA256d over the serialized header followed by the
//! ids of its transactions. Difficulty counts required leading zero bits, so
//! the target for difficulty d is (2²⁵⁶ − 1) >> d.

use bitcoin_hashes::{sha256d, Hash as BitcoinHash, HashEngine};
use std::cmp::Ordering;

use crate::error::{ConsensusError, Result};
use crate::types::{Block, BlockHeader, Hash, PowData};

/// BlockHash: ℋ × ℍ* → ℍ
pub fn block_hash(header: &BlockHeader, tx_ids: &[Hash]) -> Hash {
    let mut engine = sha256d::Hash::engine();
    engine.input(&header.serialize());
    for id in tx_ids {
        engine.input(id);
    }
    sha256d::Hash::from_engine(engine).into_inner()
}

/// Hash of a complete block, as referenced by its child's `previous_hash`
pub fn hash_block(block: &Block) -> Hash {
    let ids: Vec<Hash> = block.transactions.iter().map(|tx| tx.id).collect();
    block_hash(&block.header, &ids)
}

/// CheckProofOfWork: ℬ → {true, false}
///
/// 1. Recompute the block hash over header and transaction ids
/// 2. Interpret it as a big-endian 256-bit integer
/// 3. Accept iff hash ≤ target(difficulty)
pub fn check_proof_of_work(block: &Block) -> Result<bool> {
    let difficulty = block.header.difficulty;
    if difficulty > 255 {
        return Err(ConsensusError::InvalidProofOfWork(format!(
            "difficulty {} out of range",
            difficulty
        )));
    }
    let hash = U256::from_be_bytes(&hash_block(block));
    Ok(hash <= target_for_difficulty(difficulty))
}

pub fn target_for_difficulty(difficulty: u32) -> U256 {
    U256::MAX.shr(difficulty)
}

pub fn meets_difficulty(hash: &Hash, difficulty: u32) -> bool {
    difficulty <= 256 && U256::from_be_bytes(hash) <= target_for_difficulty(difficulty)
}

/// Work hash of a reward's PoW datum, bound to the paid address
pub fn reward_pow_hash(recipient: &str, pow: &PowData) -> Hash {
    let mut engine = sha256d::Hash::engine();
    engine.input(recipient.as_bytes());
    engine.input(&pow.nonce.to_le_bytes());
    engine.input(&pow.difficulty.to_le_bytes());
    engine.input(&pow.timestamp.to_le_bytes());
    sha256d::Hash::from_engine(engine).into_inner()
}

/// 256-bit unsigned integer, little-endian 64-bit limbs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct U256([u64; 4]);

impl U256 {
    pub const ZERO: U256 = U256([0; 4]);
    pub const MAX: U256 = U256([u64::MAX; 4]);

    pub fn from_u64(value: u64) -> Self {
        U256([value, 0, 0, 0])
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&x| x == 0)
    }

    pub fn shl(&self, shift: u32) -> Self {
        if shift >= 256 {
            return U256::ZERO;
        }

        let mut result = U256::ZERO;
        let word_shift = (shift / 64) as usize;
        let bit_shift = shift % 64;

        for i in 0..4 {
            if i + word_shift < 4 {
                result.0[i + word_shift] |= self.0[i] << bit_shift;
                if bit_shift > 0 && i + word_shift + 1 < 4 {
                    result.0[i + word_shift + 1] |= self.0[i] >> (64 - bit_shift);
                }
            }
        }

        result
    }

    pub fn shr(&self, shift: u32) -> Self {
        if shift >= 256 {
            return U256::ZERO;
        }

        let mut result = U256::ZERO;
        let word_shift = (shift / 64) as usize;
        let bit_shift = shift % 64;

        for i in word_shift..4 {
            result.0[i - word_shift] |= self.0[i] >> bit_shift;
            if bit_shift > 0 && i > word_shift {
                result.0[i - word_shift - 1] |= self.0[i] << (64 - bit_shift);
            }
        }

        result
    }

    pub fn from_be_bytes(bytes: &[u8; 32]) -> Self {
        let mut words = [0u64; 4];
        for (i, word) in words.iter_mut().enumerate() {
            // limb 0 holds the last eight bytes
            let start = 32 - (i + 1) * 8;
            let mut limb = [0u8; 8];
            limb.copy_from_slice(&bytes[start..start + 8]);
            *word = u64::from_be_bytes(limb);
        }
        U256(words)
    }

    pub fn to_be_bytes(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        for (i, word) in self.0.iter().enumerate() {
            let start = 32 - (i + 1) * 8;
            bytes[start..start + 8].copy_from_slice(&word.to_be_bytes());
        }
        bytes
    }
}

impl PartialOrd for U256 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for U256 {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.0.iter().rev().zip(other.0.iter().rev()) {
            match a.cmp(b) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        Ordering::Equal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::leading_zero_bits;

    #[test]
    fn test_u256_shifts() {
        let one = U256::from_u64(1);
        assert_eq!(one.shl(64), U256([0, 1, 0, 0]));
        assert_eq!(one.shl(255).shr(255), one);
        assert_eq!(U256::from_u64(0x8000_0000_0000_0000).shl(1), U256([0, 1, 0, 0]));
        assert_eq!(U256([0, 1, 0, 0]).shr(1), U256::from_u64(0x8000_0000_0000_0000));
        assert!(one.shl(256).is_zero());
        assert!(U256::MAX.shr(256).is_zero());
    }

    #[test]
    fn test_u256_big_endian_roundtrip() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0x80;
        bytes[31] = 0x01;
        let value = U256::from_be_bytes(&bytes);
        assert_eq!(value.0[3], 0x8000_0000_0000_0000);
        assert_eq!(value.0[0], 1);
        assert_eq!(value.to_be_bytes(), bytes);
    }

    #[test]
    fn test_u256_ordering() {
        assert!(U256::from_u64(5) < U256::from_u64(6));
        assert!(U256([0, 0, 0, 1]) > U256([u64::MAX, u64::MAX, u64::MAX, 0]));
        assert_eq!(U256::MAX.cmp(&U256::MAX), Ordering::Equal);
    }

    #[test]
    fn test_target_matches_leading_zero_bits() {
        let mut hash = [0xffu8; 32];
        hash[0] = 0x00;
        hash[1] = 0x0f;
        assert_eq!(leading_zero_bits(&hash), 12);
        assert!(meets_difficulty(&hash, 12));
        assert!(!meets_difficulty(&hash, 13));
        assert!(meets_difficulty(&hash, 0));
    }

    #[test]
    fn test_block_hash_commits_to_transactions() {
        let header = BlockHeader {
            version: 1,
            previous_hash: [0; 32],
            merkle_root: [0; 32],
            validator_merkle_root: [0; 32],
            timestamp: 0,
            difficulty: 0,
            nonce: 0,
            height: 0,
        };
        assert_ne!(block_hash(&header, &[[1; 32]]), block_hash(&header, &[[2; 32]]));
    }
}
