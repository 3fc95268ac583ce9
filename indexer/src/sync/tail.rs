//! Live tail loop.
//!
//! Follows the chain head and feeds new spans through the same commit path
//! as backfill. Push mode consumes a head subscription when the transport
//! offers one; otherwise the head is polled. Every commit span is preceded
//! by a reorg check against the persisted cursor.

use crate::cli::IndexerConfig;
use crate::rpc::{EthRpc, HeaderInfo};
use crate::storage::Storage;
use crate::sync::{reorg, Committer, WindowPlanner};
use eyre::{eyre, Result};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Consecutive failed ticks tolerated before the supervisor is signaled.
const MAX_CONSECUTIVE_FAILURES: u32 = 10;

enum HeadSignal {
    Head(u64),
    Stopped,
}

/// Follow the chain head until shutdown, the configured end block, or a
/// fatal error.
pub async fn run_tail<R: EthRpc>(
    rpc: Arc<R>,
    storage: Arc<Storage>,
    committer: &mut Committer<R>,
    config: &IndexerConfig,
    mut stop_rx: watch::Receiver<bool>,
) -> Result<()> {
    let mut heads_rx = rpc.subscribe_heads().await?;
    match &heads_rx {
        Some(_) => info!("live tail in push mode (head subscription)"),
        None => info!(
            poll_interval_secs = config.poll_interval_secs,
            "live tail in poll mode"
        ),
    }

    let mut consecutive_failures = 0u32;
    let mut last_checkpoint_touch = Instant::now();

    loop {
        let signal = match heads_rx.as_mut() {
            Some(rx) => next_pushed_head(rx, &mut stop_rx).await,
            None => next_polled_head(rpc.as_ref(), config, &mut stop_rx).await,
        };
        let head = match signal {
            HeadSignal::Head(head) => head,
            HeadSignal::Stopped => return Ok(()),
        };
        committer.stats().set_head_seen(head);

        match process_up_to(rpc.as_ref(), &storage, committer, config, head).await {
            Ok(committed) => {
                consecutive_failures = 0;
                if committed > 0 {
                    last_checkpoint_touch = Instant::now();
                } else if last_checkpoint_touch.elapsed() >= config.checkpoint_interval() {
                    committer.touch_checkpoint()?;
                    last_checkpoint_touch = Instant::now();
                }
            }
            Err(err) if is_unrecoverable(&err) => return Err(err),
            Err(err) => {
                // Transient trouble (integrity mismatch mid-reorg, RPC
                // flake): the next tick re-runs the reorg check first.
                consecutive_failures += 1;
                warn!(
                    error = %err,
                    consecutive_failures,
                    "tail tick failed; will re-check for reorg and retry"
                );
                if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    return Err(eyre!(
                        "live tail failed {MAX_CONSECUTIVE_FAILURES} ticks in a row: {err}"
                    ));
                }
            }
        }

        if let Some(end) = config.end_block_opt() {
            if committer
                .cursor()
                .last_processed
                .is_some_and(|last| last >= end)
            {
                info!(end_block = end, "reached configured end block, tail done");
                return Ok(());
            }
        }
    }
}

/// Reorg-check, then commit `(last_processed, head]` in maxRange windows.
async fn process_up_to<R: EthRpc>(
    rpc: &R,
    storage: &Storage,
    committer: &mut Committer<R>,
    config: &IndexerConfig,
    head: u64,
) -> Result<u64> {
    reorg::check_and_repair(
        rpc,
        storage,
        committer,
        config.rollback_window,
        config.start_block,
    )
    .await?;

    let start = committer.cursor().next_block(config.start_block);
    let mut target = head.saturating_sub(config.safety_depth);
    if let Some(end) = config.end_block_opt() {
        target = target.min(end);
    }
    if start > target {
        return Ok(0);
    }

    let mut committed = 0u64;
    let mut planner = WindowPlanner::new(start, target, config.max_block_range);
    while let Some(window) = planner.next_window() {
        let logs = rpc.filter_logs(window.start, window.end).await?;
        committed += committer.commit_window(window.start, window.end, logs).await?;
    }
    debug!(start, target, logs = committed, "tail span committed");
    Ok(committed)
}

async fn next_pushed_head(
    heads_rx: &mut mpsc::Receiver<HeaderInfo>,
    stop_rx: &mut watch::Receiver<bool>,
) -> HeadSignal {
    loop {
        tokio::select! {
            header = heads_rx.recv() => {
                return match header {
                    Some(header) => HeadSignal::Head(header.number),
                    // Subscription ended; treat as shutdown and let the
                    // supervisor decide whether to restart.
                    None => HeadSignal::Stopped,
                };
            }
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    return HeadSignal::Stopped;
                }
            }
        }
    }
}

async fn next_polled_head<R: EthRpc>(
    rpc: &R,
    config: &IndexerConfig,
    stop_rx: &mut watch::Receiver<bool>,
) -> HeadSignal {
    loop {
        match rpc.head_number().await {
            Ok(head) => return HeadSignal::Head(head),
            Err(err) => {
                warn!(error = %err, "head poll failed");
            }
        }
        tokio::select! {
            _ = sleep(config.poll_interval()) => {}
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    return HeadSignal::Stopped;
                }
            }
        }
    }
}

fn is_unrecoverable(err: &eyre::Report) -> bool {
    err.to_string().contains("unrecoverable reorg")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LogRecord;
    use crate::sync::IngestCursor;
    use crate::test_utils::{open_storage, temp_dir, test_config, test_stats, MockRpc};
    use tokio::sync::broadcast;

    async fn tick<R: EthRpc>(
        rpc: &R,
        storage: &Storage,
        committer: &mut Committer<R>,
        config: &IndexerConfig,
        head: u64,
    ) -> u64 {
        committer.stats().set_head_seen(head);
        process_up_to(rpc, storage, committer, config, head)
            .await
            .expect("tail tick")
    }

    #[tokio::test]
    async fn polling_commits_incrementally_with_reorg_checks() {
        let dir = temp_dir("tail-poll");
        let storage = Arc::new(open_storage(&dir));
        let rpc = Arc::new(MockRpc::with_chain(0..=200));
        rpc.push_log(200, 0);

        let mut config = test_config();
        config.start_block = 200;
        let mut committer = Committer::new(
            Arc::clone(&rpc),
            Arc::clone(&storage),
            test_stats(),
            IngestCursor::from_checkpoint(None),
        );
        let (live_tx, mut live_rx) = broadcast::channel::<LogRecord>(64);
        committer.attach_live(live_tx);

        // Head advances 200 -> 201 -> 202 across three polls; each tick
        // commits exactly the new span.
        assert_eq!(tick(rpc.as_ref(), &storage, &mut committer, &config, 200).await, 1);
        rpc.extend_chain_to(201);
        rpc.push_log(201, 0);
        assert_eq!(tick(rpc.as_ref(), &storage, &mut committer, &config, 201).await, 1);
        rpc.extend_chain_to(202);
        rpc.push_log(202, 0);
        assert_eq!(tick(rpc.as_ref(), &storage, &mut committer, &config, 202).await, 1);

        assert_eq!(storage.total_count().unwrap(), 3);
        for expected_block in [200u64, 201, 202] {
            let frame = live_rx.try_recv().expect("live frame");
            assert_eq!(frame.block_number, expected_block);
        }

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn tick_repairs_reorg_before_committing() {
        let dir = temp_dir("tail-reorg");
        let storage = Arc::new(open_storage(&dir));
        let rpc = Arc::new(MockRpc::with_chain(0..=100));
        rpc.push_log(99, 0);
        rpc.push_log(100, 0);

        let config = test_config();
        let mut committer = Committer::new(
            Arc::clone(&rpc),
            Arc::clone(&storage),
            test_stats(),
            IngestCursor::from_checkpoint(None),
        );
        assert_eq!(tick(rpc.as_ref(), &storage, &mut committer, &config, 100).await, 2);

        // The chain replaces block 100 and extends to 101.
        rpc.fork_from(100);
        rpc.extend_chain_to(101);
        rpc.push_log(100, 0);
        rpc.push_log(101, 0);

        let committed = tick(rpc.as_ref(), &storage, &mut committer, &config, 101).await;
        assert_eq!(committed, 2);

        // The pre-fork record for block 100 was replaced, not duplicated.
        let records = storage.range_logs(0, None, 0).unwrap();
        let blocks: Vec<u64> = records.iter().map(|r| r.block_number).collect();
        assert_eq!(blocks, vec![99, 100, 101]);
        assert_eq!(records[1].block_hash, rpc.hash_of(100));

        let snapshot = committer.stats().snapshot();
        assert_eq!(snapshot.reorgs_detected, 1);
        assert_eq!(snapshot.blocks_rolled_back, 1);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn push_mode_consumes_subscription() {
        let dir = temp_dir("tail-push");
        let storage = Arc::new(open_storage(&dir));
        let rpc = Arc::new(MockRpc::with_chain(0..=5));
        rpc.push_log(3, 0);

        let (heads_tx, heads_rx) = mpsc::channel(8);
        rpc.set_head_stream(heads_rx);
        for number in [4u64, 5] {
            heads_tx
                .send(rpc.header_info(number))
                .await
                .expect("push head");
        }
        drop(heads_tx);

        let mut config = test_config();
        config.end_block = 5;
        let mut committer = Committer::new(
            Arc::clone(&rpc),
            Arc::clone(&storage),
            test_stats(),
            IngestCursor::from_checkpoint(None),
        );

        let (_stop_tx, stop_rx) = watch::channel(false);
        run_tail(Arc::clone(&rpc), Arc::clone(&storage), &mut committer, &config, stop_rx)
            .await
            .expect("tail");

        assert_eq!(storage.total_count().unwrap(), 1);
        assert_eq!(committer.cursor().last_processed, Some(5));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
