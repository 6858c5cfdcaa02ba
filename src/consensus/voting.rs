//! Stake-weighted voting over the two encryption-scheme slots.
//!
//! Every delegated account piggybacks one proposed [`EncryptionConfig`] per
//! slot on its nonce transactions. A slot may be paused (or unpaused) with
//! more than a third of the network stake behind one value, and switched to
//! a different scheme with more than two thirds. Before checking unanimity
//! one dissenting vote is discarded when more than two votes are live.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::crypto::scheme::{EncryptionConfig, Slot};

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum VotingError {
    #[error("delegated account id 0 cannot vote")]
    InvalidAccount,
    #[error("vote at height {got} is older than recorded height {recorded}")]
    NonMonotonic { recorded: u64, got: u64 },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub values: Vec<u8>,
    pub height: u64,
    pub staked: u64,
}

/// Non-expired votes for one slot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VoteTally {
    pub votes: Vec<(u8, Vote)>,
}

impl VoteTally {
    pub fn values(&self) -> Vec<Vec<u8>> {
        self.votes.iter().map(|(_, v)| v.values.clone()).collect()
    }

    pub fn staked(&self) -> u64 {
        self.votes.iter().fold(0u64, |acc, (_, v)| acc.saturating_add(v.staked))
    }

    /// The single value left after discarding one outlier, with the stake
    /// still behind it. `None` when the remaining votes disagree.
    pub fn agreed(&self) -> Option<(Vec<u8>, u64)> {
        let mut votes: Vec<&Vote> = self.votes.iter().map(|(_, v)| v).collect();
        if votes.len() > 2 {
            votes = remove_one_different(votes, |v| v.values.as_slice());
        }
        let first = votes.first()?;
        if votes.iter().any(|v| v.values != first.values) {
            return None;
        }
        let staked = votes.iter().fold(0u64, |acc, v| acc.saturating_add(v.staked));
        Some((first.values.clone(), staked))
    }
}

/// Drop the first item that differs from the most common value, if any.
pub fn remove_one_different<T, F>(items: Vec<T>, key: F) -> Vec<T>
where
    F: Fn(&T) -> &[u8],
{
    if items.len() <= 1 {
        return items;
    }
    let mut counts: BTreeMap<&[u8], usize> = BTreeMap::new();
    let mut common: &[u8] = key(&items[0]);
    let mut max_count = 0;
    for item in &items {
        let count = counts.entry(key(item)).or_insert(0);
        *count += 1;
        if *count > max_count {
            max_count = *count;
            common = key(item);
        }
    }
    let common = common.to_vec();
    let mut removed = false;
    items
        .into_iter()
        .filter(|item| {
            if !removed && key(item) != common.as_slice() {
                removed = true;
                false
            } else {
                true
            }
        })
        .collect()
}

/// Strictly more than `numerator / 3` of `total`.
fn exceeds_thirds(staked: u64, total: u64, numerator: u128) -> bool {
    staked as u128 * 3 > total as u128 * numerator
}

pub struct EncryptionVoting {
    distance: u64,
    slots: Mutex<[BTreeMap<u8, Vote>; 2]>,
}

impl EncryptionVoting {
    pub fn new(distance: u64) -> Self {
        EncryptionVoting {
            distance,
            slots: Mutex::new([BTreeMap::new(), BTreeMap::new()]),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, [BTreeMap<u8, Vote>; 2]> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record `delegated_id`'s proposal for `slot`. An empty value is no
    /// vote. A vote older than the one on record is rejected.
    pub fn save_vote(
        &self,
        slot: Slot,
        delegated_id: u8,
        values: Vec<u8>,
        height: u64,
        staked: u64,
    ) -> Result<(), VotingError> {
        if values.is_empty() {
            return Ok(());
        }
        if delegated_id == 0 {
            return Err(VotingError::InvalidAccount);
        }
        let mut slots = self.lock();
        let votes = &mut slots[slot.index()];
        if let Some(existing) = votes.get(&delegated_id) {
            if existing.height > height {
                return Err(VotingError::NonMonotonic {
                    recorded: existing.height,
                    got: height,
                });
            }
        }
        votes.insert(
            delegated_id,
            Vote {
                values,
                height,
                staked,
            },
        );
        Ok(())
    }

    /// Live votes for `slot` at `height`; expired votes are pruned.
    pub fn generate_data(&self, slot: Slot, height: u64) -> VoteTally {
        let mut slots = self.lock();
        let distance = self.distance;
        let votes = &mut slots[slot.index()];
        votes.retain(|_, v| height <= v.height.saturating_add(distance) && !v.values.is_empty());
        VoteTally {
            votes: votes.iter().map(|(id, v)| (*id, v.clone())).collect(),
        }
    }

    /// Agreed value if it has pause quorum (> 1/3 of `total_staked`).
    pub fn verify_for_pausing(&self, slot: Slot, height: u64, total_staked: u64) -> Option<Vec<u8>> {
        let (value, staked) = self.generate_data(slot, height).agreed()?;
        exceeds_thirds(staked, total_staked, 1).then_some(value)
    }

    /// Agreed value if it has replace quorum (> 2/3 of `total_staked`).
    pub fn verify_for_replacing(&self, slot: Slot, height: u64, total_staked: u64) -> Option<Vec<u8>> {
        let (value, staked) = self.generate_data(slot, height).agreed()?;
        exceeds_thirds(staked, total_staked, 2).then_some(value)
    }

    /// The config `slot` should switch to at `height`, if the votes carry
    /// the quorum the change needs: toggling the paused flag of the current
    /// scheme needs pause quorum, a different scheme needs replace quorum.
    pub fn decide(
        &self,
        slot: Slot,
        height: u64,
        total_staked: u64,
        current: &EncryptionConfig,
    ) -> Option<EncryptionConfig> {
        let value = self.verify_for_pausing(slot, height, total_staked)?;
        let proposed = EncryptionConfig::from_bytes(&value).ok()?;
        if proposed == *current {
            return None;
        }
        if proposed.same_scheme(current) {
            return Some(proposed);
        }
        self.verify_for_replacing(slot, height, total_staked)
            .filter(|v| *v == value)
            .map(|_| proposed)
    }

    /// Clear every vote, starting a new round.
    pub fn reset(&self) {
        let mut slots = self.lock();
        for votes in slots.iter_mut() {
            votes.clear();
        }
        tracing::info!("Encryption votes reset");
    }

    pub fn vote_count(&self, slot: Slot) -> usize {
        self.lock()[slot.index()].len()
    }
}
