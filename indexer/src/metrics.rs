//! Prometheus metric names and derived-gauge math.

use eyre::{Result, WrapErr};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

pub const LOGS_INDEXED_TOTAL: &str = "eth_indexer_logs_indexed_total";
pub const RPC_ERRORS_TOTAL: &str = "eth_indexer_rpc_errors_total";
pub const RPC_LATENCY_SECONDS: &str = "eth_indexer_rpc_latency_seconds";
pub const HEAD_LAG_BLOCKS: &str = "eth_indexer_head_lag_blocks";
pub const BACKFILL_PROGRESS: &str = "eth_indexer_backfill_progress";
pub const LAST_BLOCK_HEIGHT: &str = "eth_indexer_last_block_height";
pub const STORAGE_KEYS_TOTAL: &str = "eth_indexer_storage_keys_total";
pub const REORGS_DETECTED_TOTAL: &str = "eth_indexer_reorgs_detected_total";
pub const BLOCKS_ROLLED_BACK_TOTAL: &str = "eth_indexer_blocks_rolled_back_total";
pub const CHECKPOINTS_SAVED_TOTAL: &str = "eth_indexer_checkpoints_saved_total";
pub const WS_DROPPED_FRAMES_TOTAL: &str = "eth_indexer_ws_dropped_frames_total";

const RPC_LATENCY_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 2.0, 5.0, 10.0];

/// Install the global Prometheus recorder and return the render handle.
pub fn install_recorder() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(RPC_LATENCY_SECONDS.to_string()),
            RPC_LATENCY_BUCKETS,
        )
        .wrap_err("invalid rpc latency buckets")?
        .install_recorder()
        .wrap_err("failed to install prometheus recorder")?;
    describe();
    Ok(handle)
}

fn describe() {
    describe_counter!(LOGS_INDEXED_TOTAL, "Total number of log events indexed");
    describe_counter!(RPC_ERRORS_TOTAL, "Total number of RPC errors encountered");
    describe_histogram!(RPC_LATENCY_SECONDS, "RPC call latency in seconds");
    describe_gauge!(HEAD_LAG_BLOCKS, "Number of blocks behind the current head");
    describe_gauge!(BACKFILL_PROGRESS, "Backfill progress as a percentage (0-100)");
    describe_gauge!(LAST_BLOCK_HEIGHT, "Height of the last indexed block");
    describe_gauge!(STORAGE_KEYS_TOTAL, "Total number of log keys in storage");
    describe_counter!(REORGS_DETECTED_TOTAL, "Total number of chain reorgs detected");
    describe_counter!(
        BLOCKS_ROLLED_BACK_TOTAL,
        "Total number of blocks rolled back due to reorgs"
    );
    describe_counter!(CHECKPOINTS_SAVED_TOTAL, "Total number of checkpoints saved");
    describe_counter!(
        WS_DROPPED_FRAMES_TOTAL,
        "Live frames dropped on slow websocket consumers"
    );
}

/// Blocks between the observed head and the last processed block.
pub fn head_lag(head_seen: u64, last_processed: Option<u64>) -> u64 {
    match last_processed {
        Some(last) => head_seen.saturating_sub(last),
        None => head_seen,
    }
}

/// Backfill progress over a closed range, as a 0-100 percentage.
///
/// Undefined for open-ended runs (`end_block` unset); reported as 0.
pub fn backfill_progress(start_block: u64, end_block: Option<u64>, last_processed: Option<u64>) -> f64 {
    let (Some(end), Some(last)) = (end_block, last_processed) else {
        return 0.0;
    };
    if last <= start_block {
        return 0.0;
    }
    let span = end.saturating_sub(start_block).max(1);
    let done = last.saturating_sub(start_block).min(span);
    100.0 * done as f64 / span as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_lag_handles_missing_cursor() {
        assert_eq!(head_lag(10, None), 10);
        assert_eq!(head_lag(10, Some(7)), 3);
        assert_eq!(head_lag(7, Some(10)), 0);
    }

    #[test]
    fn backfill_progress_is_zero_when_open_ended() {
        assert_eq!(backfill_progress(0, None, Some(50)), 0.0);
        assert_eq!(backfill_progress(0, Some(100), None), 0.0);
    }

    #[test]
    fn backfill_progress_tracks_closed_range() {
        let progress = backfill_progress(100, Some(200), Some(150));
        assert!((progress - 50.0).abs() < 1e-9);
        assert_eq!(backfill_progress(100, Some(200), Some(200)), 100.0);
        // Clamped when the tail has moved past the configured end.
        assert_eq!(backfill_progress(100, Some(200), Some(250)), 100.0);
    }
}
