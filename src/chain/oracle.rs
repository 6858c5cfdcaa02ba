//! Price and randomness oracles fed by nonce transactions.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::constants::ORACLES_HEIGHT_DISTANCE;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum OracleError {
    #[error("sample for delegated account {id} at height {height} is older than the recorded one")]
    Stale { id: u8, height: u64 },
    #[error("no samples within {0} blocks")]
    NoSamples(u64),
}

/// Oracle capability consumed by the proposal round.
pub trait Oracle: Send + Sync {
    fn save_price(&self, delegated_id: u8, height: u64, value: i64, staked: u64) -> Result<(), OracleError>;
    fn save_rand(&self, delegated_id: u8, height: u64, value: i64, staked: u64) -> Result<(), OracleError>;
    /// Stake-weighted price for `height` from recent samples.
    fn price(&self, height: u64) -> Result<i64, OracleError>;
    /// Combination of recent random samples from staked accounts.
    fn rand(&self, height: u64) -> Result<i64, OracleError>;
}

#[derive(Clone, Copy, Debug)]
struct Sample {
    value: i64,
    height: u64,
    staked: u64,
}

#[derive(Default)]
struct Book {
    samples: BTreeMap<u8, Sample>,
}

impl Book {
    fn save(&mut self, id: u8, sample: Sample) -> Result<(), OracleError> {
        if let Some(existing) = self.samples.get(&id) {
            if existing.height > sample.height {
                return Err(OracleError::Stale {
                    id,
                    height: sample.height,
                });
            }
        }
        self.samples.insert(id, sample);
        Ok(())
    }

    fn recent(&mut self, height: u64) -> Vec<Sample> {
        self.samples
            .retain(|_, s| height <= s.height + ORACLES_HEIGHT_DISTANCE);
        self.samples.values().copied().collect()
    }
}

/// In-memory oracle keeping the latest sample per delegated account.
#[derive(Default)]
pub struct OracleBook {
    price: Mutex<Book>,
    rand: Mutex<Book>,
}

impl OracleBook {
    pub fn new() -> Self {
        Self::default()
    }
}

fn weighted_mean(samples: &[Sample]) -> Option<i64> {
    let total: u128 = samples.iter().map(|s| s.staked as u128).sum();
    if total == 0 {
        return None;
    }
    let sum: i128 = samples
        .iter()
        .map(|s| s.value as i128 * s.staked as i128)
        .sum();
    Some((sum / total as i128) as i64)
}

impl Oracle for OracleBook {
    fn save_price(&self, delegated_id: u8, height: u64, value: i64, staked: u64) -> Result<(), OracleError> {
        let mut book = self.price.lock().unwrap_or_else(|e| e.into_inner());
        book.save(delegated_id, Sample { value, height, staked })
    }

    fn save_rand(&self, delegated_id: u8, height: u64, value: i64, staked: u64) -> Result<(), OracleError> {
        let mut book = self.rand.lock().unwrap_or_else(|e| e.into_inner());
        book.save(delegated_id, Sample { value, height, staked })
    }

    fn price(&self, height: u64) -> Result<i64, OracleError> {
        let mut book = self.price.lock().unwrap_or_else(|e| e.into_inner());
        weighted_mean(&book.recent(height)).ok_or(OracleError::NoSamples(ORACLES_HEIGHT_DISTANCE))
    }

    fn rand(&self, height: u64) -> Result<i64, OracleError> {
        let mut book = self.rand.lock().unwrap_or_else(|e| e.into_inner());
        let samples = book.recent(height);
        if samples.iter().all(|s| s.staked == 0) {
            return Err(OracleError::NoSamples(ORACLES_HEIGHT_DISTANCE));
        }
        // Unweighted XOR over every staked contributor.
        Ok(samples.iter().filter(|s| s.staked > 0).fold(0i64, |acc, s| acc ^ s.value))
    }
}
