//! Proof-of-synergy: difficulty adjustment, block reward and the hash
//! eligibility check every proposed block must pass.

use crate::constants::{
    BLOCK_TIME_INTERVAL_SECS, DIFFICULTY_CHANGE, DIFFICULTY_MULTIPLIER, MAX_TOTAL_SUPPLY,
    REWARD_DIVISOR,
};
use crate::Hash;

/// Next difficulty given the previous one and the seconds since the
/// previous block. Fast blocks raise it, slow blocks lower it, never below 1.
pub fn adjust_difficulty(previous: u32, elapsed_secs: u64) -> u32 {
    if elapsed_secs < BLOCK_TIME_INTERVAL_SECS / 2 {
        previous.saturating_add(DIFFICULTY_CHANGE)
    } else if elapsed_secs > BLOCK_TIME_INTERVAL_SECS * 2 {
        previous.saturating_sub(DIFFICULTY_CHANGE).max(1)
    } else {
        previous
    }
}

/// Reward minted on top of `supply`, shrinking as the cap approaches.
pub fn reward_for_supply(supply: u64) -> u64 {
    MAX_TOTAL_SUPPLY.saturating_sub(supply) / REWARD_DIVISOR
}

/// Split of `reward` between operator and delegated account.
pub fn split_reward(reward: u64, operator_per_mille: u16) -> (u64, u64) {
    let operator = (reward as u128 * operator_per_mille.min(1000) as u128 / 1000) as u64;
    (operator, reward - operator)
}

/// Target a block hash must stay under at `difficulty`.
pub fn synergy_target(difficulty: u32) -> u32 {
    let per = u32::MAX / difficulty.max(1);
    per.saturating_mul(DIFFICULTY_MULTIPLIER)
}

pub fn check_proof_of_synergy(block_hash: &Hash, difficulty: u32) -> bool {
    let head = u32::from_be_bytes([block_hash[0], block_hash[1], block_hash[2], block_hash[3]]);
    head <= synergy_target(difficulty)
}
