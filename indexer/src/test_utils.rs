//! Shared helpers for unit tests: temp dirs, config builders, and a
//! scriptable mock chain behind the `EthRpc` trait.

use crate::cli::IndexerConfig;
use crate::rpc::{EthRpc, HeaderInfo, RawLog, RpcError};
use crate::stats::IndexerStats;
use crate::storage::{LogRecord, Storage};
use alloy_primitives::{Bytes, B256};
use async_trait::async_trait;
use clap::Parser;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

pub fn temp_dir(prefix: &str) -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time moves forward")
        .as_nanos();
    let suffix = COUNTER.fetch_add(1, Ordering::SeqCst);
    let mut path = std::env::temp_dir();
    path.push(format!(
        "event-indexer-{prefix}-test-{now}-{}-{suffix}",
        std::process::id()
    ));
    path
}

pub const TEST_CONTRACT: &str = "0x6992e2f8e29139cc16683228a4a4ca602e49e048";
pub const TEST_TOPIC: &str =
    "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

pub fn open_storage(dir: &std::path::Path) -> Storage {
    Storage::open(dir, TEST_CONTRACT, TEST_TOPIC).expect("open storage")
}

pub fn test_config() -> IndexerConfig {
    IndexerConfig::parse_from([
        "event-indexer",
        "--rpc",
        "http://localhost:8545",
        "--contract",
        TEST_CONTRACT,
        "--topic",
        TEST_TOPIC,
    ])
}

pub fn test_stats() -> Arc<IndexerStats> {
    Arc::new(IndexerStats::new(0, None))
}

/// Deterministic block hash: the number plus a fork generation tag.
pub fn block_hash(number: u64, fork: u8) -> B256 {
    let mut bytes = [0u8; 32];
    bytes[0] = fork;
    bytes[24..].copy_from_slice(&number.to_be_bytes());
    B256::new(bytes)
}

fn tx_hash(number: u64, log_index: u64, fork: u8) -> B256 {
    let mut bytes = [0u8; 32];
    bytes[0] = 0xF0 | fork;
    bytes[8..16].copy_from_slice(&number.to_be_bytes());
    bytes[24..].copy_from_slice(&log_index.to_be_bytes());
    B256::new(bytes)
}

/// Build a raw log consistent with the mock's current view of a block.
pub fn raw_log(rpc: &MockRpc, block_number: u64, log_index: u64) -> RawLog {
    RawLog {
        block_number,
        block_hash: rpc.hash_of(block_number),
        tx_hash: tx_hash(block_number, log_index, rpc.fork_of(block_number)),
        log_index,
        data: Bytes::from(block_number.to_be_bytes().to_vec()),
    }
}

/// Convenience for API tests: a fully-populated record.
pub fn record(index: u64, block_number: u64, log_index: u64) -> LogRecord {
    LogRecord {
        index,
        block_number,
        block_hash: block_hash(block_number, 0),
        parent_hash: block_hash(block_number.wrapping_sub(1), 0),
        tx_hash: tx_hash(block_number, log_index, 0),
        log_index,
        timestamp: 1_600_000_000 + block_number * 12,
        payload: Bytes::from(block_number.to_be_bytes().to_vec()),
        created_at: 1_700_000_000,
    }
}

#[derive(Debug, Default)]
struct MockChain {
    /// block number -> fork generation; hash derives from both.
    forks: BTreeMap<u64, u8>,
    logs: Vec<RawLog>,
}

/// In-memory chain with scriptable faults, fed to the ingest pipeline
/// through the same trait as the production adapter.
pub struct MockRpc {
    chain: Mutex<MockChain>,
    head: AtomicU64,
    provider_range_limit: AtomicU64,
    filter_calls: Mutex<Vec<(u64, u64)>>,
    filter_delays: Mutex<HashMap<u64, Duration>>,
    filter_failures: Mutex<HashMap<u64, u32>>,
    heads_rx: Mutex<Option<mpsc::Receiver<HeaderInfo>>>,
}

impl MockRpc {
    pub fn with_chain(blocks: RangeInclusive<u64>) -> Self {
        let mut forks = BTreeMap::new();
        for number in blocks.clone() {
            forks.insert(number, 0);
        }
        Self {
            chain: Mutex::new(MockChain {
                forks,
                logs: Vec::new(),
            }),
            head: AtomicU64::new(*blocks.end()),
            provider_range_limit: AtomicU64::new(u64::MAX),
            filter_calls: Mutex::new(Vec::new()),
            filter_delays: Mutex::new(HashMap::new()),
            filter_failures: Mutex::new(HashMap::new()),
            heads_rx: Mutex::new(None),
        }
    }

    pub fn hash_of(&self, number: u64) -> B256 {
        block_hash(number, self.fork_of(number))
    }

    pub fn fork_of(&self, number: u64) -> u8 {
        self.chain.lock().forks.get(&number).copied().unwrap_or(0)
    }

    pub fn header_info(&self, number: u64) -> HeaderInfo {
        let chain = self.chain.lock();
        let fork = chain.forks.get(&number).copied().unwrap_or(0);
        let parent_fork = chain
            .forks
            .get(&number.wrapping_sub(1))
            .copied()
            .unwrap_or(0);
        HeaderInfo {
            number,
            hash: block_hash(number, fork),
            parent_hash: block_hash(number.wrapping_sub(1), parent_fork),
            timestamp: 1_600_000_000 + number * 12,
        }
    }

    /// Register a log on the current chain view of `block_number`.
    pub fn push_log(&self, block_number: u64, log_index: u64) {
        let fork = self.fork_of(block_number);
        let mut chain = self.chain.lock();
        chain.logs.push(RawLog {
            block_number,
            block_hash: block_hash(block_number, fork),
            tx_hash: tx_hash(block_number, log_index, fork),
            log_index,
            data: Bytes::from(block_number.to_be_bytes().to_vec()),
        });
    }

    /// Replace the chain suffix from `from_block` up with a new fork,
    /// dropping any logs those blocks held.
    pub fn fork_from(&self, from_block: u64) {
        let mut chain = self.chain.lock();
        let keys: Vec<u64> = chain.forks.range(from_block..).map(|(k, _)| *k).collect();
        for key in keys {
            *chain.forks.get_mut(&key).expect("known block") += 1;
        }
        chain.logs.retain(|log| log.block_number < from_block);
    }

    pub fn extend_chain_to(&self, new_head: u64) {
        let mut chain = self.chain.lock();
        let current = chain.forks.keys().next_back().copied().unwrap_or(0);
        for number in (current + 1)..=new_head {
            chain.forks.insert(number, 0);
        }
        drop(chain);
        self.head.store(new_head, Ordering::SeqCst);
    }

    /// Simulate a provider that rejects spans wider than `limit`.
    pub fn set_provider_range_limit(&self, limit: u64) {
        self.provider_range_limit.store(limit, Ordering::SeqCst);
    }

    /// Delay filter calls whose `from` equals the given block.
    pub fn delay_filter(&self, from: u64, delay: Duration) {
        self.filter_delays.lock().insert(from, delay);
    }

    /// Fail the next `count` filter calls whose `from` equals the block.
    pub fn fail_filters_at(&self, from: u64, count: u32) {
        self.filter_failures.lock().insert(from, count);
    }

    pub fn filter_calls(&self) -> Vec<(u64, u64)> {
        self.filter_calls.lock().clone()
    }

    pub fn clear_filter_calls(&self) {
        self.filter_calls.lock().clear();
    }

    pub fn set_head_stream(&self, rx: mpsc::Receiver<HeaderInfo>) {
        *self.heads_rx.lock() = Some(rx);
    }
}

#[async_trait]
impl EthRpc for MockRpc {
    async fn head_number(&self) -> Result<u64, RpcError> {
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn header_by_number(&self, number: u64) -> Result<HeaderInfo, RpcError> {
        if !self.chain.lock().forks.contains_key(&number) {
            return Err(RpcError::MissingBlock(number));
        }
        Ok(self.header_info(number))
    }

    async fn filter_logs(&self, from: u64, to: u64) -> Result<Vec<RawLog>, RpcError> {
        self.filter_calls.lock().push((from, to));

        let delay = self.filter_delays.lock().get(&from).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        {
            let mut failures = self.filter_failures.lock();
            if let Some(remaining) = failures.get_mut(&from) {
                if *remaining > 0 {
                    *remaining = remaining.saturating_sub(1);
                    return Err(RpcError::Transport("scripted failure".into()));
                }
            }
        }

        let span = to.saturating_sub(from).saturating_add(1);
        let limit = self.provider_range_limit.load(Ordering::SeqCst);
        if span > limit {
            return Err(RpcError::RangeTooWide { span, max: limit });
        }

        let mut logs: Vec<RawLog> = self
            .chain
            .lock()
            .logs
            .iter()
            .filter(|log| log.block_number >= from && log.block_number <= to)
            .cloned()
            .collect();
        logs.sort_by_key(|log| (log.block_number, log.log_index));
        Ok(logs)
    }

    async fn subscribe_heads(&self) -> Result<Option<mpsc::Receiver<HeaderInfo>>, RpcError> {
        Ok(self.heads_rx.lock().take())
    }
}
