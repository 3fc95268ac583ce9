//! Ingest orchestration: planning, parallel fetch, ordered commit, tailing.

mod backfill;
mod committer;
mod reorg;
mod tail;

use crate::cli::IndexerConfig;
use crate::rpc::EthRpc;
use crate::stats::IndexerStats;
use crate::storage::{LogRecord, Storage};
use eyre::Result;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::info;

pub use backfill::run_backfill;
pub use committer::{Committer, IngestCursor};
pub use reorg::{check_and_repair, ReorgCheck};
pub use tail::run_tail;

/// A contiguous fetch unit. Windows are committed in `id` order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub id: u64,
    pub start: u64,
    pub end: u64,
}

impl Window {
    pub fn blocks(&self) -> u64 {
        self.end.saturating_sub(self.start).saturating_add(1)
    }
}

/// Slices `[from, to]` into contiguous windows of at most `max_range` blocks.
///
/// Indices are not reserved here; the committer assigns them densely in
/// window order at commit time.
#[derive(Debug, Clone)]
pub struct WindowPlanner {
    next: u64,
    end: u64,
    max_range: u64,
    next_id: u64,
    done: bool,
}

impl WindowPlanner {
    pub fn new(from: u64, to: u64, max_range: u64) -> Self {
        Self {
            next: from,
            end: to,
            max_range: max_range.max(1),
            next_id: 0,
            done: to < from,
        }
    }

    /// Returns the next window, or `None` when the range is exhausted.
    pub fn next_window(&mut self) -> Option<Window> {
        if self.done {
            return None;
        }
        let start = self.next;
        let end = start
            .saturating_add(self.max_range - 1)
            .min(self.end);
        let window = Window {
            id: self.next_id,
            start,
            end,
        };
        self.next_id += 1;
        if end >= self.end {
            self.done = true;
        } else {
            self.next = end + 1;
        }
        Some(window)
    }

    /// Number of windows the full plan will produce.
    pub fn window_count(&self) -> u64 {
        if self.end < self.next {
            return 0;
        }
        let blocks = self.end - self.next + 1;
        blocks.div_ceil(self.max_range)
    }
}

/// Reporting hook for backfill progress display.
pub trait ProgressReporter: Send + Sync {
    fn set_length(&self, len: u64);
    fn inc(&self, delta: u64);
    fn finish(&self);
}

/// Drive the full ingest lifecycle: resume, backfill, then live tail.
///
/// Returns `Ok(())` when a closed range completes; open-ended runs only
/// return on shutdown or a fatal error.
pub async fn run_ingest<R: EthRpc + 'static>(
    rpc: Arc<R>,
    storage: Arc<Storage>,
    stats: Arc<IndexerStats>,
    live_tx: broadcast::Sender<LogRecord>,
    config: IndexerConfig,
    progress: Option<Arc<dyn ProgressReporter>>,
    stop_rx: watch::Receiver<bool>,
) -> Result<()> {
    let checkpoint = storage.load_checkpoint()?;
    if let Some(checkpoint) = &checkpoint {
        stats.seed_from_checkpoint(checkpoint);
        info!(
            last_processed = checkpoint.last_processed_block,
            next_index = checkpoint.next_index,
            "resuming from checkpoint"
        );
    } else {
        info!(start_block = config.start_block, "no checkpoint, starting fresh");
    }

    let cursor = IngestCursor::from_checkpoint(checkpoint.as_ref());
    let mut committer = Committer::new(
        Arc::clone(&rpc),
        Arc::clone(&storage),
        Arc::clone(&stats),
        cursor,
    );

    // A checkpointed cursor may point at a block the chain has since
    // replaced; repair before fetching anything new.
    if checkpoint.is_some() {
        reorg::check_and_repair(
            rpc.as_ref(),
            storage.as_ref(),
            &mut committer,
            config.rollback_window,
            config.start_block,
        )
        .await?;
    }

    if config.backfill {
        let head = rpc.head_number().await?;
        stats.set_head_seen(head);
        let mut target = head.saturating_sub(config.safety_depth);
        if let Some(end) = config.end_block_opt() {
            target = target.min(end);
        }
        let from = committer.cursor().next_block(config.start_block);
        if from <= target {
            let committed = backfill::run_backfill(
                Arc::clone(&rpc),
                &mut committer,
                from,
                target,
                &config,
                progress.as_deref(),
                stop_rx.clone(),
            )
            .await?;
            info!(
                from,
                to = target,
                logs = committed,
                "historical backfill complete"
            );
        }
    }

    if *stop_rx.borrow() {
        return Ok(());
    }

    if let Some(end) = config.end_block_opt() {
        if committer
            .cursor()
            .last_processed
            .is_some_and(|last| last >= end)
        {
            info!(end_block = end, "closed range fully indexed, ingest done");
            return Ok(());
        }
    }

    committer.attach_live(live_tx);
    tail::run_tail(rpc, storage, &mut committer, &config, stop_rx).await
}
