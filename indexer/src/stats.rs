//! Shared indexer statistics for health and status reporting.

use crate::metrics::{
    backfill_progress, head_lag, BACKFILL_PROGRESS, HEAD_LAG_BLOCKS, LAST_BLOCK_HEIGHT,
    STORAGE_KEYS_TOTAL,
};
use crate::storage::CheckpointData;
use alloy_primitives::B256;
use metrics::gauge;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// The most recent reorg repair, kept for the status endpoint.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RollbackInfo {
    pub detected_at: i64,
    pub rolled_back_count: u64,
    pub reason: String,
}

/// Live counters shared between the ingest pipeline and the API.
#[derive(Debug)]
pub struct IndexerStats {
    start_block: u64,
    end_block: Option<u64>,
    next_index: AtomicU64,
    last_block: AtomicU64,
    any_indexed: AtomicBool,
    head_seen: AtomicU64,
    rpc_errors: AtomicU64,
    reorgs_detected: AtomicU64,
    blocks_rolled_back: AtomicU64,
    last_block_hash: Mutex<Option<B256>>,
    last_rollback: Mutex<Option<RollbackInfo>>,
}

/// Point-in-time view rendered by `/v1/status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub total_indexed: u64,
    pub next_index: u64,
    pub last_block_number: u64,
    pub last_block_hash: Option<B256>,
    pub head_block: u64,
    pub head_lag: u64,
    pub backfill_progress: f64,
    pub rpc_errors: u64,
    pub reorgs_detected: u64,
    pub blocks_rolled_back: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_rollback: Option<RollbackInfo>,
}

impl IndexerStats {
    pub fn new(start_block: u64, end_block: Option<u64>) -> Self {
        Self {
            start_block,
            end_block,
            next_index: AtomicU64::new(0),
            last_block: AtomicU64::new(0),
            any_indexed: AtomicBool::new(false),
            head_seen: AtomicU64::new(0),
            rpc_errors: AtomicU64::new(0),
            reorgs_detected: AtomicU64::new(0),
            blocks_rolled_back: AtomicU64::new(0),
            last_block_hash: Mutex::new(None),
            last_rollback: Mutex::new(None),
        }
    }

    /// Seed the counters from a persisted checkpoint on startup.
    pub fn seed_from_checkpoint(&self, checkpoint: &CheckpointData) {
        self.record_cursor(
            Some(checkpoint.last_processed_block),
            Some(checkpoint.last_block_hash),
            checkpoint.next_index,
        );
    }

    /// Record a committed window or a rollback-adjusted cursor.
    pub fn record_cursor(&self, last_block: Option<u64>, last_hash: Option<B256>, next_index: u64) {
        self.next_index.store(next_index, Ordering::SeqCst);
        match last_block {
            Some(block) => {
                self.last_block.store(block, Ordering::SeqCst);
                self.any_indexed.store(true, Ordering::SeqCst);
                gauge!(LAST_BLOCK_HEIGHT).set(block as f64);
            }
            None => {
                self.last_block.store(0, Ordering::SeqCst);
                self.any_indexed.store(false, Ordering::SeqCst);
            }
        }
        *self.last_block_hash.lock() = last_hash;
        gauge!(STORAGE_KEYS_TOTAL).set(next_index as f64);
        self.refresh_gauges();
    }

    pub fn set_head_seen(&self, head: u64) {
        self.head_seen.store(head, Ordering::SeqCst);
        self.refresh_gauges();
    }

    pub fn record_rpc_error(&self) {
        self.rpc_errors.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_rollback(&self, info: RollbackInfo) {
        self.reorgs_detected.fetch_add(1, Ordering::SeqCst);
        self.blocks_rolled_back
            .fetch_add(info.rolled_back_count, Ordering::SeqCst);
        *self.last_rollback.lock() = Some(info);
    }

    pub fn last_processed(&self) -> Option<u64> {
        self.any_indexed
            .load(Ordering::SeqCst)
            .then(|| self.last_block.load(Ordering::SeqCst))
    }

    pub fn head_seen(&self) -> u64 {
        self.head_seen.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let next_index = self.next_index.load(Ordering::SeqCst);
        let last_processed = self.last_processed();
        let head = self.head_seen();
        StatsSnapshot {
            total_indexed: next_index,
            next_index,
            last_block_number: last_processed.unwrap_or(0),
            last_block_hash: *self.last_block_hash.lock(),
            head_block: head,
            head_lag: head_lag(head, last_processed),
            backfill_progress: backfill_progress(self.start_block, self.end_block, last_processed),
            rpc_errors: self.rpc_errors.load(Ordering::SeqCst),
            reorgs_detected: self.reorgs_detected.load(Ordering::SeqCst),
            blocks_rolled_back: self.blocks_rolled_back.load(Ordering::SeqCst),
            last_rollback: self.last_rollback.lock().clone(),
        }
    }

    fn refresh_gauges(&self) {
        let head = self.head_seen();
        let last_processed = self.last_processed();
        gauge!(HEAD_LAG_BLOCKS).set(head_lag(head, last_processed) as f64);
        gauge!(BACKFILL_PROGRESS).set(backfill_progress(
            self.start_block,
            self.end_block,
            last_processed,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_cursor_and_head() {
        let stats = IndexerStats::new(100, Some(200));
        assert_eq!(stats.last_processed(), None);

        stats.set_head_seen(180);
        stats.record_cursor(Some(150), Some(B256::repeat_byte(7)), 42);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_indexed, 42);
        assert_eq!(snapshot.last_block_number, 150);
        assert_eq!(snapshot.last_block_hash, Some(B256::repeat_byte(7)));
        assert_eq!(snapshot.head_lag, 30);
        assert!((snapshot.backfill_progress - 50.0).abs() < 1e-9);
    }

    #[test]
    fn rollback_accumulates_counters() {
        let stats = IndexerStats::new(0, None);
        stats.record_rollback(RollbackInfo {
            detected_at: 1,
            rolled_back_count: 2,
            reason: "parent hash divergence".to_string(),
        });
        stats.record_rollback(RollbackInfo {
            detected_at: 2,
            rolled_back_count: 3,
            reason: "parent hash divergence".to_string(),
        });

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.reorgs_detected, 2);
        assert_eq!(snapshot.blocks_rolled_back, 5);
        assert_eq!(snapshot.last_rollback.unwrap().rolled_back_count, 3);
    }
}
