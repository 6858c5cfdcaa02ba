//! Post-commit chain statistics.

use std::sync::Mutex;

use serde::Serialize;

use crate::chain::block::Block;

/// Statistics capability notified after each committed block.
pub trait StatsSink: Send + Sync {
    fn update(&self, block: &Block, previous: &Block);
    fn current(&self) -> ChainStats;
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ChainStats {
    pub height: u64,
    pub transactions: usize,
    pub total_transactions: u64,
    pub block_time_secs: u64,
    pub tps: f64,
    pub supply: u64,
    pub difficulty: u32,
}

#[derive(Default)]
pub struct StatsManager {
    stats: Mutex<ChainStats>,
}

impl StatsManager {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StatsSink for StatsManager {
    fn update(&self, block: &Block, previous: &Block) {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        let elapsed = block.timestamp.saturating_sub(previous.timestamp);
        stats.height = block.height();
        stats.transactions = block.tx_hashes.len();
        stats.total_transactions += block.tx_hashes.len() as u64;
        stats.block_time_secs = elapsed;
        stats.tps = block.tx_hashes.len() as f64 / elapsed.max(1) as f64;
        stats.supply = block.supply;
        stats.difficulty = block.header.difficulty;
        match serde_json::to_string(&*stats) {
            Ok(json) => tracing::debug!(stats = %json, "Chain statistics"),
            Err(e) => tracing::warn!(error = %e, "Failed to encode statistics"),
        }
    }

    fn current(&self) -> ChainStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::block::tests::child;
    use crate::crypto::keys::{SchemeKind, SigningKeypair};

    #[test]
    fn update_tracks_latest_block() {
        let stats = StatsManager::new();
        let genesis = Block::genesis();
        let kp = SigningKeypair::generate(SchemeKind::Falcon512);
        let block = child(&genesis, &kp, vec![[1u8; 32]; 20]);
        stats.update(&block, &genesis);
        let current = stats.current();
        assert_eq!(current.height, 1);
        assert_eq!(current.transactions, 20);
        assert_eq!(current.block_time_secs, crate::constants::BLOCK_TIME_INTERVAL_SECS);
        assert!((current.tps - 2.0).abs() < f64::EPSILON);
        assert_eq!(current.supply, block.supply);
    }
}
