//! Ordered commit path shared by backfill and the live tailer.

use crate::metrics::{CHECKPOINTS_SAVED_TOTAL, LOGS_INDEXED_TOTAL};
use crate::rpc::{EthRpc, HeaderInfo, RawLog};
use crate::stats::IndexerStats;
use crate::storage::{CheckpointData, LogRecord, Storage};
use alloy_primitives::B256;
use eyre::{eyre, Result};
use metrics::counter;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tracing::debug;

/// In-memory ingest cursor, always mirroring the persisted checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestCursor {
    pub last_processed: Option<u64>,
    pub last_hash: Option<B256>,
    pub next_index: u64,
}

impl IngestCursor {
    pub fn from_checkpoint(checkpoint: Option<&CheckpointData>) -> Self {
        match checkpoint {
            Some(checkpoint) => Self {
                last_processed: Some(checkpoint.last_processed_block),
                last_hash: Some(checkpoint.last_block_hash),
                next_index: checkpoint.next_index,
            },
            None => Self {
                last_processed: None,
                last_hash: None,
                next_index: 0,
            },
        }
    }

    /// First block the next commit span should cover.
    pub fn next_block(&self, start_block: u64) -> u64 {
        match self.last_processed {
            Some(last) => last.saturating_add(1).max(start_block),
            None => start_block,
        }
    }
}

/// The single writer. Owns index assignment and checkpoint advancement;
/// every committed transaction preserves the dense-index invariant.
pub struct Committer<R> {
    rpc: Arc<R>,
    storage: Arc<Storage>,
    stats: Arc<IndexerStats>,
    cursor: IngestCursor,
    live_tx: Option<broadcast::Sender<LogRecord>>,
}

impl<R: EthRpc> Committer<R> {
    pub fn new(
        rpc: Arc<R>,
        storage: Arc<Storage>,
        stats: Arc<IndexerStats>,
        cursor: IngestCursor,
    ) -> Self {
        Self {
            rpc,
            storage,
            stats,
            cursor,
            live_tx: None,
        }
    }

    pub fn cursor(&self) -> &IngestCursor {
        &self.cursor
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn stats(&self) -> &IndexerStats {
        &self.stats
    }

    /// Fan committed records out to websocket subscribers from here on.
    pub fn attach_live(&mut self, tx: broadcast::Sender<LogRecord>) {
        self.live_tx = Some(tx);
    }

    /// Rewind the cursor after a storage rollback.
    pub fn apply_rollback(&mut self, checkpoint: &CheckpointData) {
        self.cursor = IngestCursor {
            last_processed: Some(checkpoint.last_processed_block),
            last_hash: Some(checkpoint.last_block_hash),
            next_index: checkpoint.next_index,
        };
        self.stats.seed_from_checkpoint(checkpoint);
    }

    /// Commit one window: build records in provider order, anchor every
    /// touched block plus the window end, and advance the checkpoint. One
    /// atomic storage transaction.
    pub async fn commit_window(&mut self, from: u64, to: u64, logs: Vec<RawLog>) -> Result<u64> {
        verify_provider_order(from, to, &logs)?;

        let mut headers: HashMap<B256, HeaderInfo> = HashMap::new();
        let mut anchors: BTreeMap<u64, B256> = BTreeMap::new();
        let mut records = Vec::with_capacity(logs.len());
        let created_at = unix_seconds();

        for raw in logs {
            let header = match headers.get(&raw.block_hash) {
                Some(header) => *header,
                None => {
                    let header = self.rpc.header_by_number(raw.block_number).await?;
                    if header.hash != raw.block_hash {
                        return Err(eyre!(
                            "header hash for block {} disagrees with log block hash (reorg in flight?)",
                            raw.block_number
                        ));
                    }
                    headers.insert(header.hash, header);
                    header
                }
            };

            anchors.insert(raw.block_number, raw.block_hash);
            records.push(LogRecord {
                index: self.cursor.next_index + records.len() as u64,
                block_number: raw.block_number,
                block_hash: raw.block_hash,
                parent_hash: header.parent_hash,
                tx_hash: raw.tx_hash,
                log_index: raw.log_index,
                timestamp: header.timestamp,
                payload: raw.data,
                created_at,
            });
        }

        // Anchor the window end even when it emitted no logs; the reorg walk
        // needs a match at the exact cursor position.
        let end_hash = match anchors.get(&to) {
            Some(hash) => *hash,
            None => {
                let header = self.rpc.header_by_number(to).await?;
                anchors.insert(to, header.hash);
                header.hash
            }
        };

        let next_index = self.cursor.next_index + records.len() as u64;
        let checkpoint = CheckpointData {
            last_processed_block: to,
            next_index,
            last_block_hash: end_hash,
            timestamp: created_at as i64,
        };
        self.storage.store_batch(&records, &anchors, &checkpoint)?;

        self.cursor = IngestCursor {
            last_processed: Some(to),
            last_hash: Some(end_hash),
            next_index,
        };
        counter!(LOGS_INDEXED_TOTAL).increment(records.len() as u64);
        counter!(CHECKPOINTS_SAVED_TOTAL).increment(1);
        self.stats
            .record_cursor(Some(to), Some(end_hash), next_index);

        if let Some(live_tx) = &self.live_tx {
            for record in &records {
                // Receivers may lag or be absent; storage never waits on them.
                let _ = live_tx.send(record.clone());
            }
        }

        debug!(
            window_start = from,
            window_end = to,
            logs = records.len(),
            next_index,
            "committed window"
        );
        Ok(records.len() as u64)
    }

    /// Refresh the checkpoint timestamp while idle.
    pub fn touch_checkpoint(&self) -> Result<()> {
        let (Some(last), Some(hash)) = (self.cursor.last_processed, self.cursor.last_hash) else {
            return Ok(());
        };
        self.storage.save_checkpoint(&CheckpointData {
            last_processed_block: last,
            next_index: self.cursor.next_index,
            last_block_hash: hash,
            timestamp: unix_seconds() as i64,
        })?;
        counter!(CHECKPOINTS_SAVED_TOTAL).increment(1);
        Ok(())
    }
}

/// Filter results must be block-major, log-index-minor, and inside the
/// window; anything else means the provider is lying to us.
fn verify_provider_order(from: u64, to: u64, logs: &[RawLog]) -> Result<()> {
    let mut previous: Option<(u64, u64)> = None;
    for raw in logs {
        if raw.block_number < from || raw.block_number > to {
            return Err(eyre!(
                "provider returned log for block {} outside window {from}..={to}",
                raw.block_number
            ));
        }
        let position = (raw.block_number, raw.log_index);
        if previous.is_some_and(|prev| position <= prev) {
            return Err(eyre!(
                "provider returned out-of-order logs in window {from}..={to}"
            ));
        }
        previous = Some(position);
    }
    Ok(())
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{raw_log, temp_dir, test_stats, MockRpc};

    fn committer_with_chain(
        blocks: std::ops::RangeInclusive<u64>,
    ) -> (Committer<MockRpc>, Arc<MockRpc>, std::path::PathBuf) {
        let dir = temp_dir("committer");
        let storage = Arc::new(crate::test_utils::open_storage(&dir));
        let rpc = Arc::new(MockRpc::with_chain(blocks));
        let committer = Committer::new(
            Arc::clone(&rpc),
            storage,
            test_stats(),
            IngestCursor::from_checkpoint(None),
        );
        (committer, rpc, dir)
    }

    #[tokio::test]
    async fn commit_assigns_dense_indices_and_anchors_window_end() {
        let (mut committer, rpc, dir) = committer_with_chain(100..=104);
        let logs = vec![
            raw_log(&rpc, 100, 0),
            raw_log(&rpc, 100, 1),
            raw_log(&rpc, 102, 0),
        ];

        let committed = committer.commit_window(100, 103, logs).await.expect("commit");
        assert_eq!(committed, 3);

        let storage = committer.storage();
        assert_eq!(storage.total_count().unwrap(), 3);
        for index in 0..3u64 {
            assert_eq!(storage.get_log(index).unwrap().unwrap().index, index);
        }
        // Anchors: log blocks plus the window end.
        assert!(storage.block_hash(100).unwrap().is_some());
        assert!(storage.block_hash(102).unwrap().is_some());
        assert_eq!(storage.block_hash(103).unwrap(), Some(rpc.hash_of(103)));
        assert!(storage.block_hash(101).unwrap().is_none());

        let checkpoint = storage.load_checkpoint().unwrap().unwrap();
        assert_eq!(checkpoint.last_processed_block, 103);
        assert_eq!(checkpoint.next_index, 3);
        assert_eq!(checkpoint.last_block_hash, rpc.hash_of(103));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn empty_window_still_anchors_and_advances() {
        let (mut committer, rpc, dir) = committer_with_chain(10..=10);

        let committed = committer.commit_window(10, 10, Vec::new()).await.expect("commit");
        assert_eq!(committed, 0);

        let storage = committer.storage();
        assert_eq!(storage.total_count().unwrap(), 0);
        assert_eq!(storage.block_hash(10).unwrap(), Some(rpc.hash_of(10)));
        let checkpoint = storage.load_checkpoint().unwrap().unwrap();
        assert_eq!(checkpoint.last_processed_block, 10);
        assert_eq!(checkpoint.next_index, 0);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn commit_rejects_out_of_order_logs() {
        let (mut committer, rpc, dir) = committer_with_chain(100..=101);
        let logs = vec![raw_log(&rpc, 101, 0), raw_log(&rpc, 100, 0)];

        let err = committer.commit_window(100, 101, logs).await.unwrap_err();
        assert!(err.to_string().contains("out-of-order"));
        assert_eq!(committer.storage().total_count().unwrap(), 0);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn commit_rejects_mismatched_header_hash() {
        let (mut committer, rpc, dir) = committer_with_chain(100..=101);
        let mut log = raw_log(&rpc, 100, 0);
        log.block_hash = B256::repeat_byte(0xEE);

        let err = committer.commit_window(100, 101, vec![log]).await.unwrap_err();
        assert!(err.to_string().contains("disagrees"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn provider_order_accepts_block_major_log_minor() {
        let rpc = MockRpc::with_chain(1..=3);
        let logs = vec![raw_log(&rpc, 1, 0), raw_log(&rpc, 1, 1), raw_log(&rpc, 3, 0)];
        assert!(verify_provider_order(1, 3, &logs).is_ok());

        let duplicated = vec![raw_log(&rpc, 1, 0), raw_log(&rpc, 1, 0)];
        assert!(verify_provider_order(1, 3, &duplicated).is_err());

        let outside = vec![raw_log(&rpc, 3, 0)];
        assert!(verify_provider_order(1, 2, &outside).is_err());
    }
}
