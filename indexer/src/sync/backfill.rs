//! Parallel historical backfill.
//!
//! A fixed pool of fetchers pulls windows from a shared queue and filters
//! logs for them; fetchers complete out of order. A single committer
//! consumes the results in strict window-id order, buffering early arrivals
//! in a reorder buffer bounded by the results channel. Commit order equals
//! window order equals block order, so the dense-index invariant needs no
//! reservation protocol.

use crate::cli::IndexerConfig;
use crate::rpc::{EthRpc, RawLog, RpcError};
use crate::sync::{Committer, ProgressReporter, Window, WindowPlanner};
use eyre::{eyre, Result};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Window-level attempts on top of the adapter's internal retry budget.
const WINDOW_RETRY_BUDGET: u32 = 3;

struct FetchOutcome {
    window: Window,
    result: Result<Vec<RawLog>, RpcError>,
}

/// Backfill `[from, to]` and return the number of records committed.
pub async fn run_backfill<R: EthRpc + 'static>(
    rpc: Arc<R>,
    committer: &mut Committer<R>,
    from: u64,
    to: u64,
    config: &IndexerConfig,
    progress: Option<&dyn ProgressReporter>,
    external_stop: watch::Receiver<bool>,
) -> Result<u64> {
    let mut planner = WindowPlanner::new(from, to, config.max_block_range);
    let total_windows = planner.window_count();
    if total_windows == 0 {
        return Ok(0);
    }
    let workers = config.workers.max(1);
    if let Some(progress) = progress {
        progress.set_length(to - from + 1);
    }
    debug!(
        from,
        to,
        windows = total_windows,
        workers,
        max_range = config.max_block_range,
        "starting backfill"
    );

    // Internal stop fans the external signal out to the feeder and workers
    // and also fires when the commit loop bails early.
    let (stop_tx, stop_rx) = watch::channel(false);
    let (windows_tx, windows_rx) = mpsc::channel::<Window>(workers * 2);
    let (results_tx, mut results_rx) = mpsc::channel::<FetchOutcome>(workers * 2);
    let windows_rx = Arc::new(Mutex::new(windows_rx));

    let feeder = {
        let mut stop_rx = stop_rx.clone();
        tokio::spawn(async move {
            while let Some(window) = planner.next_window() {
                tokio::select! {
                    result = windows_tx.send(window) => {
                        if result.is_err() {
                            break;
                        }
                    }
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    };

    let mut fetch_handles: Vec<JoinHandle<()>> = Vec::with_capacity(workers);
    for _ in 0..workers {
        let rpc = Arc::clone(&rpc);
        let windows_rx = Arc::clone(&windows_rx);
        let results_tx = results_tx.clone();
        let mut stop_rx = stop_rx.clone();
        fetch_handles.push(tokio::spawn(async move {
            loop {
                let next = {
                    let mut guard = windows_rx.lock().await;
                    tokio::select! {
                        window = guard.recv() => window,
                        _ = stop_rx.changed() => {
                            if *stop_rx.borrow() {
                                return;
                            }
                            continue;
                        }
                    }
                };
                let Some(window) = next else {
                    return;
                };
                let result = fetch_window_with_budget(rpc.as_ref(), &window).await;
                if results_tx.send(FetchOutcome { window, result }).await.is_err() {
                    return;
                }
            }
        }));
    }
    drop(results_tx);

    // Serialized commit in window-id order. The reorder buffer holds early
    // completions; it is bounded by the channel capacity plus in-flight
    // fetches.
    let mut reorder: BTreeMap<u64, FetchOutcome> = BTreeMap::new();
    let mut expected_id = 0u64;
    let mut committed_logs = 0u64;
    let mut external_stop = external_stop;
    let commit_result: Result<()> = 'commit: loop {
        if expected_id >= total_windows {
            break Ok(());
        }
        let outcome = tokio::select! {
            outcome = results_rx.recv() => outcome,
            _ = external_stop.changed() => {
                if *external_stop.borrow() {
                    debug!(committed_windows = expected_id, "backfill interrupted by shutdown");
                    break Ok(());
                }
                continue;
            }
        };
        let Some(outcome) = outcome else {
            break Err(eyre!("fetch workers exited before completing the plan"));
        };
        reorder.insert(outcome.window.id, outcome);

        while let Some(outcome) = reorder.remove(&expected_id) {
            let window = outcome.window;
            let logs = match outcome.result {
                Ok(logs) => logs,
                Err(err) => {
                    break 'commit Err(eyre!(
                        "window {}..={} failed after {WINDOW_RETRY_BUDGET} attempts: {err}",
                        window.start,
                        window.end
                    ));
                }
            };
            match committer.commit_window(window.start, window.end, logs).await {
                Ok(count) => committed_logs += count,
                Err(err) => break 'commit Err(err),
            }
            if let Some(progress) = progress {
                progress.inc(window.blocks());
            }
            expected_id += 1;
        }
    };

    let _ = stop_tx.send(true);
    drop(results_rx);
    let _ = feeder.await;
    for handle in fetch_handles {
        let _ = handle.await;
    }
    if let Some(progress) = progress {
        progress.finish();
    }

    commit_result?;
    Ok(committed_logs)
}

/// Fetch a window, retrying transient failures and narrowing on range
/// violations. Narrowed segments are fetched front-to-back so log order is
/// preserved.
async fn fetch_window_with_budget<R: EthRpc>(
    rpc: &R,
    window: &Window,
) -> Result<Vec<RawLog>, RpcError> {
    let mut last_error = None;
    for attempt in 0..WINDOW_RETRY_BUDGET {
        match fetch_window(rpc, window).await {
            Ok(logs) => return Ok(logs),
            Err(err) => {
                warn!(
                    window_start = window.start,
                    window_end = window.end,
                    attempt = attempt + 1,
                    error = %err,
                    "window fetch failed"
                );
                last_error = Some(err);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| RpcError::Transport("window retry budget exhausted".into())))
}

async fn fetch_window<R: EthRpc>(rpc: &R, window: &Window) -> Result<Vec<RawLog>, RpcError> {
    let mut segments = VecDeque::from([(window.start, window.end)]);
    let mut logs = Vec::new();
    while let Some((start, end)) = segments.pop_front() {
        match rpc.filter_logs(start, end).await {
            Ok(batch) => logs.extend(batch),
            Err(RpcError::RangeTooWide { .. }) if end > start => {
                let mid = start + (end - start) / 2;
                segments.push_front((mid + 1, end));
                segments.push_front((start, mid));
            }
            Err(err) => return Err(err),
        }
    }
    Ok(logs)
}
