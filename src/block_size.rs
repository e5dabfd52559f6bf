//! Adaptive block size limit
//!
//! The byte ceiling moves with network conditions. Each connected block
//! produces a new limit from the previous one:
//!
//! ```text
//! raw      = limit × congestion × interval × propagation
//! smoothed = limit + α · (raw − limit)
//! next     = clamp(smoothed, limit · (1 ± max_change), [min, max])
//! ```
//!
//! - congestion: pending mempool bytes relative to the current limit
//! - interval: recent mean block interval relative to the target interval
//! - propagation: target latency relative to the observed latency percentile
//!
//! Every factor is clamped to its configured range.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::debug;

use crate::constants::TARGET_BLOCK_TIME_SECS;
use crate::error::{ConsensusError, Result};

/// Coefficients of the adaptive limit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockSizeParams {
    pub initial_block_size: u64,
    pub min_block_size: u64,
    pub max_block_size: u64,
    /// Largest relative change between consecutive limits
    pub max_change_pct: f64,
    /// Weight of the newly computed value, 0 < α ≤ 1
    pub smoothing: f64,
    pub congestion_range: (f64, f64),
    pub interval_range: (f64, f64),
    pub propagation_range: (f64, f64),
    pub target_block_interval_secs: u64,
    pub target_propagation_ms: u64,
    /// Latency percentile compared against the target, 0..=100
    pub latency_percentile: u8,
    /// Number of recent blocks and latency samples considered
    pub history_window: usize,
}

impl Default for BlockSizeParams {
    fn default() -> Self {
        Self {
            initial_block_size: 1_000_000,
            min_block_size: 250_000,
            max_block_size: 8_000_000,
            max_change_pct: 0.10,
            smoothing: 0.5,
            congestion_range: (0.9, 1.5),
            interval_range: (0.8, 1.2),
            propagation_range: (0.5, 1.1),
            target_block_interval_secs: TARGET_BLOCK_TIME_SECS,
            target_propagation_ms: 2_000,
            latency_percentile: 90,
            history_window: 100,
        }
    }
}

impl BlockSizeParams {
    pub fn validate(&self) -> Result<()> {
        if self.min_block_size == 0 || self.min_block_size > self.max_block_size {
            return Err(ConsensusError::Config(format!(
                "block size bounds {}..={} are invalid",
                self.min_block_size, self.max_block_size
            )));
        }
        if !(self.min_block_size..=self.max_block_size).contains(&self.initial_block_size) {
            return Err(ConsensusError::Config(
                "initial block size outside bounds".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.max_change_pct) {
            return Err(ConsensusError::Config("max_change_pct must be in [0, 1]".to_string()));
        }
        if !(self.smoothing > 0.0 && self.smoothing <= 1.0) {
            return Err(ConsensusError::Config("smoothing must be in (0, 1]".to_string()));
        }
        for (name, (lo, hi)) in [
            ("congestion", self.congestion_range),
            ("interval", self.interval_range),
            ("propagation", self.propagation_range),
        ] {
            if !(lo > 0.0 && lo <= hi) {
                return Err(ConsensusError::Config(format!("{} range is invalid", name)));
            }
        }
        if self.latency_percentile > 100 {
            return Err(ConsensusError::Config("latency percentile above 100".to_string()));
        }
        Ok(())
    }
}

/// Tracks recent blocks and latencies and holds the current limit
#[derive(Debug, Clone)]
pub struct AdaptiveBlockSize {
    params: BlockSizeParams,
    block_timestamps: VecDeque<u64>,
    latencies_ms: VecDeque<u64>,
    mempool_bytes: u64,
    current_limit: u64,
}

impl AdaptiveBlockSize {
    pub fn new(params: BlockSizeParams) -> Self {
        let current_limit = params.initial_block_size;
        Self {
            params,
            block_timestamps: VecDeque::new(),
            latencies_ms: VecDeque::new(),
            mempool_bytes: 0,
            current_limit,
        }
    }

    pub fn params(&self) -> &BlockSizeParams {
        &self.params
    }

    /// Limit applied to the next block
    pub fn current_limit(&self) -> u64 {
        self.current_limit
    }

    pub fn observe_mempool_bytes(&mut self, bytes: u64) {
        self.mempool_bytes = bytes;
    }

    pub fn record_propagation_latency(&mut self, latency_ms: u64) {
        self.latencies_ms.push_back(latency_ms);
        while self.latencies_ms.len() > self.params.history_window.max(1) {
            self.latencies_ms.pop_front();
        }
    }

    /// Feed a connected block and move the limit
    pub fn record_block(&mut self, timestamp: u64) -> u64 {
        self.block_timestamps.push_back(timestamp);
        while self.block_timestamps.len() > self.params.history_window.max(1) + 1 {
            self.block_timestamps.pop_front();
        }

        let next = self.next_limit();
        debug!(
            "block size limit {} -> {} (mempool {} bytes)",
            self.current_limit, next, self.mempool_bytes
        );
        self.current_limit = next;
        next
    }

    /// Limit that would follow the current one under present conditions
    pub fn next_limit(&self) -> u64 {
        let p = &self.params;
        let limit = self.current_limit as f64;

        let raw = limit
            * self.congestion_factor()
            * self.interval_factor()
            * self.propagation_factor();
        let smoothed = limit + p.smoothing * (raw - limit);

        let lower = limit * (1.0 - p.max_change_pct);
        let upper = limit * (1.0 + p.max_change_pct);
        let bounded = smoothed.clamp(lower, upper);

        (bounded.round() as u64).clamp(p.min_block_size, p.max_block_size)
    }

    fn congestion_factor(&self) -> f64 {
        let (lo, hi) = self.params.congestion_range;
        if self.current_limit == 0 {
            return 1.0;
        }
        (self.mempool_bytes as f64 / self.current_limit as f64).clamp(lo, hi)
    }

    /// Slower blocks than targeted allow more bytes per block
    fn interval_factor(&self) -> f64 {
        let (lo, hi) = self.params.interval_range;
        if self.block_timestamps.len() < 2 || self.params.target_block_interval_secs == 0 {
            return 1.0;
        }
        let first = self.block_timestamps.front().copied().unwrap_or_default();
        let last = self.block_timestamps.back().copied().unwrap_or_default();
        let intervals = (self.block_timestamps.len() - 1) as f64;
        let mean = last.saturating_sub(first) as f64 / intervals;
        (mean / self.params.target_block_interval_secs as f64).clamp(lo, hi)
    }

    /// Slow propagation shrinks blocks
    fn propagation_factor(&self) -> f64 {
        let (lo, hi) = self.params.propagation_range;
        match self.latency_percentile() {
            Some(0) | None => 1.0,
            Some(observed) => {
                (self.params.target_propagation_ms as f64 / observed as f64).clamp(lo, hi)
            }
        }
    }

    fn latency_percentile(&self) -> Option<u64> {
        if self.latencies_ms.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = self.latencies_ms.iter().copied().collect();
        sorted.sort_unstable();
        let rank = (self.params.latency_percentile as usize * (sorted.len() - 1)) / 100;
        sorted.get(rank).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn neutral_params() -> BlockSizeParams {
        BlockSizeParams {
            initial_block_size: 1_000,
            min_block_size: 500,
            max_block_size: 2_000,
            max_change_pct: 0.10,
            smoothing: 1.0,
            congestion_range: (0.5, 2.0),
            interval_range: (0.5, 2.0),
            propagation_range: (0.5, 2.0),
            target_block_interval_secs: 10,
            target_propagation_ms: 100,
            latency_percentile: 90,
            history_window: 10,
        }
    }

    #[test]
    fn test_change_is_bounded() {
        let mut size = AdaptiveBlockSize::new(neutral_params());
        size.observe_mempool_bytes(10_000);
        assert_eq!(size.record_block(0), 1_100);
        assert_eq!(size.record_block(10), 1_210);
    }

    #[test]
    fn test_shrinks_when_idle() {
        let mut size = AdaptiveBlockSize::new(neutral_params());
        size.observe_mempool_bytes(0);
        assert_eq!(size.record_block(0), 900);
    }

    #[test]
    fn test_clamped_to_bounds() {
        let mut size = AdaptiveBlockSize::new(neutral_params());
        size.observe_mempool_bytes(0);
        let mut ts = 0;
        for _ in 0..50 {
            ts += 10;
            size.record_block(ts);
        }
        assert_eq!(size.current_limit(), 500);
    }

    #[test]
    fn test_slow_propagation_shrinks() {
        let mut size = AdaptiveBlockSize::new(neutral_params());
        size.observe_mempool_bytes(1_000);
        for _ in 0..5 {
            size.record_propagation_latency(400);
        }
        assert!(size.next_limit() < 1_000);
    }

    #[test]
    fn test_smoothing_halves_the_step() {
        let mut params = neutral_params();
        params.smoothing = 0.5;
        params.max_change_pct = 1.0;
        let mut size = AdaptiveBlockSize::new(params);
        size.observe_mempool_bytes(1_500);
        // raw = 1500, smoothed = 1250
        assert_eq!(size.next_limit(), 1_250);
    }

    #[test]
    fn test_default_params_are_valid() {
        assert!(BlockSizeParams::default().validate().is_ok());
        let mut bad = BlockSizeParams::default();
        bad.min_block_size = bad.max_block_size + 1;
        assert!(bad.validate().is_err());
    }
}
