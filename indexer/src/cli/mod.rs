//! CLI and config handling.

use alloy_primitives::{Address, B256};
use clap::{ArgAction, Parser};
use eyre::{eyre, Result};
use std::{net::SocketAddr, path::PathBuf, time::Duration};
use url::Url;

pub const DEFAULT_MAX_BLOCK_RANGE: u64 = 500;
pub const DEFAULT_ROLLBACK_WINDOW: u64 = 128;
pub const DEFAULT_WORKERS: usize = 8;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 12;
pub const MAX_WORKERS: usize = 64;

/// Event indexer configuration.
#[derive(Parser, Debug, Clone)]
#[command(name = "event-indexer", about = "Single-contract Ethereum event log indexer")]
pub struct IndexerConfig {
    /// Ethereum JSON-RPC endpoint.
    #[arg(long, env = "RPC_URL")]
    pub rpc: Option<Url>,
    /// Per-call RPC timeout in seconds.
    #[arg(long, default_value_t = 30)]
    pub rpc_timeout_secs: u64,
    /// Max RPC attempts with exponential backoff.
    #[arg(long, default_value_t = 3, env = "RPC_MAX_RETRY")]
    pub rpc_max_retry: u32,
    /// Contract address to index.
    #[arg(long, env = "CONTRACT_ADDR")]
    pub contract: Option<Address>,
    /// Event topic hash to filter.
    #[arg(long, env = "EVENT_TOPIC")]
    pub topic: Option<B256>,
    /// Base directory for the MDBX store.
    #[arg(long = "db", default_value = "data/indexer", env = "DB_PATH")]
    pub db_path: PathBuf,
    /// Parallel fetch workers for backfill (1-64).
    #[arg(long, default_value_t = DEFAULT_WORKERS, env = "WORKERS")]
    pub workers: usize,
    /// First block to index.
    #[arg(long = "start", default_value_t = 0, env = "START_BLOCK")]
    pub start_block: u64,
    /// Last block to index (0 = open-ended, live tail forever).
    #[arg(long = "end", default_value_t = 0, env = "END_BLOCK")]
    pub end_block: u64,
    /// Max blocks per eth_getLogs filter.
    #[arg(long = "max-range", default_value_t = DEFAULT_MAX_BLOCK_RANGE, env = "MAX_BLOCK_RANGE")]
    pub max_block_range: u64,
    /// Max reorg depth repaired automatically.
    #[arg(long, default_value_t = DEFAULT_ROLLBACK_WINDOW, env = "ROLLBACK_WINDOW")]
    pub rollback_window: u64,
    /// Run historical backfill before tailing.
    #[arg(long, default_value_t = true, env = "BACKFILL", action = ArgAction::Set)]
    pub backfill: bool,
    /// Blocks to stay behind the head when backfilling.
    #[arg(long, default_value_t = 0)]
    pub safety_depth: u64,
    /// Head poll interval in seconds when no head subscription is available.
    #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL_SECS)]
    pub poll_interval_secs: u64,
    /// Idle checkpoint flush interval in seconds.
    #[arg(long, default_value_t = 30)]
    pub checkpoint_interval_secs: u64,
    /// HTTP API listen address.
    #[arg(long, default_value = "127.0.0.1:8080", env = "API_ADDR")]
    pub api_addr: SocketAddr,
    /// Prometheus listen address.
    #[arg(long, default_value = "127.0.0.1:9090", env = "METRICS_ADDR")]
    pub metrics_addr: SocketAddr,
    /// Log level: trace, debug, info, warn, error.
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    pub log_level: String,
    /// Graceful shutdown timeout in seconds.
    #[arg(long, default_value_t = 15)]
    pub shutdown_timeout_secs: u64,
}

impl IndexerConfig {
    /// Parse configuration from CLI args and environment.
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Validate required options before starting any component.
    pub fn validate(&self) -> Result<()> {
        if self.rpc.is_none() {
            return Err(eyre!("config: rpc: RPC endpoint is required"));
        }
        if self.contract.is_none() {
            return Err(eyre!("config: contract: contract address is required"));
        }
        if self.topic.is_none() {
            return Err(eyre!("config: topic: event topic is required"));
        }
        if self.workers == 0 || self.workers > MAX_WORKERS {
            return Err(eyre!(
                "config: workers: must be between 1 and {MAX_WORKERS}, got {}",
                self.workers
            ));
        }
        if self.max_block_range == 0 {
            return Err(eyre!("config: max-range: must be at least 1"));
        }
        if self.end_block > 0 && self.end_block < self.start_block {
            return Err(eyre!(
                "config: end: end block {} is below start block {}",
                self.end_block,
                self.start_block
            ));
        }
        Ok(())
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs.max(1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs.max(1))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs.max(1))
    }

    /// End block as an option; 0 means open-ended.
    pub fn end_block_opt(&self) -> Option<u64> {
        (self.end_block > 0).then_some(self.end_block)
    }
}
