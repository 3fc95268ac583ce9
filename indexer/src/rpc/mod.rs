//! Upstream JSON-RPC adapter.
//!
//! Everything the ingest pipeline needs from the chain goes through the
//! [`EthRpc`] trait: head height, headers by number, filtered logs, and an
//! optional new-head subscription. The production implementation wraps an
//! alloy HTTP provider with per-call timeouts and bounded exponential
//! backoff.

use crate::cli::IndexerConfig;
use crate::metrics::{RPC_ERRORS_TOTAL, RPC_LATENCY_SECONDS};
use crate::stats::IndexerStats;
use alloy_eips::BlockNumberOrTag;
use alloy_primitives::{Address, Bytes, B256};
use alloy_provider::{Provider, RootProvider};
use alloy_rpc_types_eth::Filter;
use async_trait::async_trait;
use eyre::eyre;
use metrics::{counter, histogram};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::warn;

/// Header fields the indexer cares about: hash, parent linkage, and time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderInfo {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
    pub timestamp: u64,
}

/// A raw filtered log as returned by the provider, payload untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    pub block_number: u64,
    pub block_hash: B256,
    pub tx_hash: B256,
    pub log_index: u64,
    pub data: Bytes,
}

#[derive(Debug, Error)]
pub enum RpcError {
    /// The filter span exceeds what this adapter or the provider accepts.
    /// Callers narrow the window instead of retrying.
    #[error("filter span {span} exceeds the block range limit ({max})")]
    RangeTooWide { span: u64, max: u64 },
    #[error("rpc call timed out after {0:?}")]
    Timeout(Duration),
    #[error("block {0} not found")]
    MissingBlock(u64),
    #[error("rpc transport error: {0}")]
    Transport(String),
}

impl RpcError {
    fn retryable(&self) -> bool {
        !matches!(self, Self::RangeTooWide { .. })
    }
}

/// Chain access seam between the ingest pipeline and the outside world.
#[async_trait]
pub trait EthRpc: Send + Sync {
    /// Current chain head height.
    async fn head_number(&self) -> Result<u64, RpcError>;

    /// Header for a block number.
    async fn header_by_number(&self, number: u64) -> Result<HeaderInfo, RpcError>;

    /// Logs matching the configured contract and topic over `from..=to`.
    ///
    /// The returned logs are in provider order: block-major, log-index-minor.
    async fn filter_logs(&self, from: u64, to: u64) -> Result<Vec<RawLog>, RpcError>;

    /// New-head stream, when the transport supports one.
    async fn subscribe_heads(&self) -> Result<Option<mpsc::Receiver<HeaderInfo>>, RpcError>;
}

/// HTTP JSON-RPC implementation backed by an alloy provider.
pub struct HttpRpc {
    provider: RootProvider,
    contract: Address,
    topic: B256,
    max_range: u64,
    call_timeout: Duration,
    max_retry: u32,
    stats: Arc<IndexerStats>,
}

impl HttpRpc {
    pub fn new(config: &IndexerConfig, stats: Arc<IndexerStats>) -> eyre::Result<Self> {
        let url = config
            .rpc
            .clone()
            .ok_or_else(|| eyre!("rpc endpoint not configured"))?;
        Ok(Self {
            provider: RootProvider::new_http(url),
            contract: config.contract.ok_or_else(|| eyre!("contract not configured"))?,
            topic: config.topic.ok_or_else(|| eyre!("topic not configured"))?,
            max_range: config.max_block_range,
            call_timeout: config.rpc_timeout(),
            max_retry: config.rpc_max_retry.max(1),
            stats,
        })
    }

    async fn with_retry<T, F, Fut>(&self, op_name: &'static str, op: F) -> Result<T, RpcError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let mut last_error = None;
        for attempt in 0..self.max_retry {
            let started = Instant::now();
            let outcome = match timeout(self.call_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(RpcError::Timeout(self.call_timeout)),
            };
            histogram!(RPC_LATENCY_SECONDS).record(started.elapsed().as_secs_f64());

            match outcome {
                Ok(value) => return Ok(value),
                Err(err) if !err.retryable() => return Err(err),
                Err(err) => {
                    counter!(RPC_ERRORS_TOTAL).increment(1);
                    self.stats.record_rpc_error();
                    if attempt + 1 < self.max_retry {
                        let delay = backoff_delay(attempt);
                        warn!(
                            op = op_name,
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "rpc call failed, retrying"
                        );
                        sleep(delay).await;
                    }
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| RpcError::Transport("retry budget exhausted".into())))
    }
}

#[async_trait]
impl EthRpc for HttpRpc {
    async fn head_number(&self) -> Result<u64, RpcError> {
        self.with_retry("eth_blockNumber", || async {
            self.provider
                .get_block_number()
                .await
                .map_err(into_transport)
        })
        .await
    }

    async fn header_by_number(&self, number: u64) -> Result<HeaderInfo, RpcError> {
        self.with_retry("eth_getBlockByNumber", || async {
            let block = self
                .provider
                .get_block_by_number(BlockNumberOrTag::Number(number))
                .await
                .map_err(into_transport)?
                .ok_or(RpcError::MissingBlock(number))?;
            Ok(HeaderInfo {
                number: block.header.number,
                hash: block.header.hash,
                parent_hash: block.header.parent_hash,
                timestamp: block.header.timestamp,
            })
        })
        .await
    }

    async fn filter_logs(&self, from: u64, to: u64) -> Result<Vec<RawLog>, RpcError> {
        let span = to.saturating_sub(from).saturating_add(1);
        if to < from || span > self.max_range {
            return Err(RpcError::RangeTooWide {
                span,
                max: self.max_range,
            });
        }

        let filter = Filter::new()
            .address(self.contract)
            .event_signature(self.topic)
            .from_block(from)
            .to_block(to);

        let logs = self
            .with_retry("eth_getLogs", || async {
                let raw = self.provider.get_logs(&filter).await;
                match raw {
                    Ok(logs) => Ok(logs),
                    Err(err) if is_range_violation(&err.to_string()) => {
                        Err(RpcError::RangeTooWide {
                            span,
                            max: self.max_range,
                        })
                    }
                    Err(err) => Err(into_transport(err)),
                }
            })
            .await?;

        logs.into_iter()
            .map(|log| {
                let data = log.inner.data.data.clone();
                Ok(RawLog {
                    block_number: log
                        .block_number
                        .ok_or_else(|| pending_log_error("blockNumber"))?,
                    block_hash: log
                        .block_hash
                        .ok_or_else(|| pending_log_error("blockHash"))?,
                    tx_hash: log
                        .transaction_hash
                        .ok_or_else(|| pending_log_error("transactionHash"))?,
                    log_index: log.log_index.ok_or_else(|| pending_log_error("logIndex"))?,
                    data,
                })
            })
            .collect()
    }

    async fn subscribe_heads(&self) -> Result<Option<mpsc::Receiver<HeaderInfo>>, RpcError> {
        // Plain HTTP transports have no pubsub; the tailer polls instead.
        Ok(None)
    }
}

fn into_transport<E: std::fmt::Display>(err: E) -> RpcError {
    RpcError::Transport(err.to_string())
}

fn pending_log_error(field: &str) -> RpcError {
    RpcError::Transport(format!("log missing {field}; refusing pending logs"))
}

/// Providers phrase block-range rejections inconsistently; match the common
/// shapes so the fetcher can narrow instead of failing the window.
fn is_range_violation(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("block range")
        || message.contains("range is too large")
        || message.contains("exceed maximum block range")
        || (message.contains("query") && message.contains("returned more than"))
}

fn backoff_delay(attempt: u32) -> Duration {
    let base_ms = 500u64.saturating_mul(1 << attempt.min(6));
    let jitter_span = base_ms / 2 + 1;
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0);
    Duration::from_millis(base_ms + nanos % jitter_span)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_violation_matches_common_provider_phrasings() {
        assert!(is_range_violation("block range is too wide"));
        assert!(is_range_violation("query returned more than 10000 results"));
        assert!(is_range_violation(
            "requested range exceed maximum block range of 500"
        ));
        assert!(!is_range_violation("connection reset by peer"));
    }

    #[test]
    fn backoff_grows_with_attempts() {
        let first = backoff_delay(0);
        let third = backoff_delay(2);
        assert!(first >= Duration::from_millis(500));
        assert!(first < Duration::from_millis(1000));
        assert!(third >= Duration::from_millis(2000));
        assert!(third < Duration::from_millis(4000));
    }

    #[test]
    fn range_too_wide_is_not_retryable() {
        assert!(!RpcError::RangeTooWide { span: 10, max: 5 }.retryable());
        assert!(RpcError::Timeout(Duration::from_secs(1)).retryable());
    }
}
