//! Block reward schedule and fee accounting

use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::{ConsensusError, Result};
use crate::types::{amount_serde, Amount, Height, Transaction};
use crate::utxo_set::UtxoView;

/// Halving reward schedule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardSchedule {
    #[serde(with = "amount_serde")]
    pub initial_reward: Amount,
    pub halving_interval: u64,
    pub max_halvings: u64,
    #[serde(with = "amount_serde")]
    pub min_reward: Amount,
}

impl Default for RewardSchedule {
    fn default() -> Self {
        Self {
            initial_reward: INITIAL_BLOCK_REWARD,
            halving_interval: HALVING_INTERVAL,
            max_halvings: MAX_HALVINGS,
            min_reward: MIN_BLOCK_REWARD,
        }
    }
}

impl RewardSchedule {
    /// BlockReward: ℕ → ℕ
    ///
    /// reward = max(R₀ >> ⌊h/H⌋, R_min), with the number of halvings capped
    /// at `max_halvings`.
    pub fn block_reward(&self, height: Height) -> Amount {
        let interval = self.halving_interval.max(1);
        let halvings = (height / interval).min(self.max_halvings);
        let reward = if halvings >= 128 {
            0
        } else {
            self.initial_reward >> halvings
        };
        reward.max(self.min_reward)
    }

    /// TotalSupply: ℕ → ℕ
    ///
    /// Sum of rewards for heights 0..=height, one halving period at a time.
    pub fn total_supply(&self, height: Height) -> Amount {
        let interval = self.halving_interval.max(1);
        let mut total: Amount = 0;
        let mut start: Height = 0;

        while start <= height {
            let period_end = start.saturating_add(interval - 1).min(height);
            let blocks = (period_end - start + 1) as Amount;
            total = total.saturating_add(self.block_reward(start).saturating_mul(blocks));
            if period_end == Height::MAX {
                break;
            }
            start = period_end + 1;
        }

        total
    }
}

/// Fee = Σ inputs − Σ outputs, input values taken from `view`
pub fn calculate_fee(tx: &Transaction, view: &dyn UtxoView) -> Result<Amount> {
    if tx.is_reward() {
        return Ok(0);
    }

    let mut total_input: Amount = 0;
    for input in &tx.inputs {
        let utxo = view
            .lookup(&input.prev_out)
            .ok_or(ConsensusError::UtxoNotFound(input.prev_out))?;
        total_input = total_input
            .checked_add(utxo.amount)
            .ok_or_else(|| ConsensusError::InvalidAmount("input sum overflow".to_string()))?;
    }

    let total_output = tx
        .output_value()
        .ok_or_else(|| ConsensusError::InvalidAmount("output sum overflow".to_string()))?;

    total_input
        .checked_sub(total_output)
        .ok_or(ConsensusError::InsufficientFunds {
            have: total_input,
            need: total_output,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_reward_genesis() {
        let schedule = RewardSchedule::default();
        assert_eq!(schedule.block_reward(0), INITIAL_BLOCK_REWARD);
    }

    #[test]
    fn test_block_reward_halvings() {
        let schedule = RewardSchedule::default();
        assert_eq!(schedule.block_reward(HALVING_INTERVAL - 1), INITIAL_BLOCK_REWARD);
        assert_eq!(schedule.block_reward(HALVING_INTERVAL), INITIAL_BLOCK_REWARD / 2);
        assert_eq!(schedule.block_reward(2 * HALVING_INTERVAL), INITIAL_BLOCK_REWARD / 4);
    }

    #[test]
    fn test_block_reward_floor() {
        let schedule = RewardSchedule::default();
        assert_eq!(schedule.block_reward(64 * HALVING_INTERVAL), MIN_BLOCK_REWARD);
        assert_eq!(schedule.block_reward(u64::MAX), MIN_BLOCK_REWARD);
    }

    #[test]
    fn test_block_reward_custom_schedule() {
        let schedule = RewardSchedule {
            initial_reward: 1000,
            halving_interval: 10,
            max_halvings: 2,
            min_reward: 1,
        };
        assert_eq!(schedule.block_reward(9), 1000);
        assert_eq!(schedule.block_reward(10), 500);
        // halvings capped at 2
        assert_eq!(schedule.block_reward(1000), 250);
    }

    #[test]
    fn test_total_supply() {
        let schedule = RewardSchedule {
            initial_reward: 100,
            halving_interval: 2,
            max_halvings: 10,
            min_reward: 0,
        };
        // 100 + 100 + 50 + 50 + 25
        assert_eq!(schedule.total_supply(4), 325);
        assert_eq!(schedule.total_supply(0), 100);
    }

    #[test]
    fn test_total_supply_bounded() {
        let schedule = RewardSchedule {
            min_reward: 0,
            ..RewardSchedule::default()
        };
        assert!(schedule.total_supply(64 * HALVING_INTERVAL) <= MAX_MONEY);
    }
}
