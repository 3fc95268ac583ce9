//! Reorg detection and rollback.
//!
//! Runs before every live commit span and whenever ingest resumes from a
//! checkpoint: compare the stored hash at the cursor against the live chain,
//! and if they diverge walk back through the persisted anchors to the
//! highest block that still matches, then roll storage back to it.

use crate::metrics::{BLOCKS_ROLLED_BACK_TOTAL, REORGS_DETECTED_TOTAL};
use crate::rpc::EthRpc;
use crate::stats::RollbackInfo;
use crate::storage::Storage;
use crate::sync::Committer;
use eyre::{eyre, Result};
use metrics::counter;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReorgCheck {
    NoReorg,
    /// Storage was rolled back to `ancestor`; `depth` blocks were discarded
    /// from the cursor position.
    Rolled { ancestor: u64, depth: u64 },
}

/// Detect a divergence at the cursor and repair it within the rollback
/// window. Fails when no common ancestor can be found inside the window.
pub async fn check_and_repair<R: EthRpc>(
    rpc: &R,
    storage: &Storage,
    committer: &mut Committer<R>,
    rollback_window: u64,
    start_block: u64,
) -> Result<ReorgCheck> {
    let cursor = *committer.cursor();
    let (Some(last), Some(last_hash)) = (cursor.last_processed, cursor.last_hash) else {
        return Ok(ReorgCheck::NoReorg);
    };

    let live = rpc.header_by_number(last).await?;
    if live.hash == last_hash {
        return Ok(ReorgCheck::NoReorg);
    }

    let low = last.saturating_sub(rollback_window).max(start_block);
    warn!(
        last_processed = last,
        stored_hash = %last_hash,
        live_hash = %live.hash,
        search_low = low,
        "chain diverged at cursor; searching for common ancestor"
    );

    let ancestor = find_common_ancestor(rpc, storage, low, last).await?;
    let Some(ancestor) = ancestor else {
        return Err(eyre!(
            "unrecoverable reorg: no common ancestor within rollback window \
             (last_processed={last}, searched down to {low})"
        ));
    };

    let depth = last - ancestor;
    let outcome = storage.rollback(ancestor)?;
    committer.apply_rollback(&outcome.checkpoint);

    counter!(REORGS_DETECTED_TOTAL).increment(1);
    counter!(BLOCKS_ROLLED_BACK_TOTAL).increment(depth);
    committer.stats().record_rollback(RollbackInfo {
        detected_at: unix_seconds(),
        rolled_back_count: depth,
        reason: format!("hash divergence at block {last}"),
    });

    info!(
        ancestor,
        depth,
        removed_records = outcome.removed_records,
        "rolled back to common ancestor"
    );
    Ok(ReorgCheck::Rolled { ancestor, depth })
}

/// Walk back from `high - 1`, comparing live headers against stored anchors.
/// Returns the largest matching block, or `None` when the window is
/// exhausted.
async fn find_common_ancestor<R: EthRpc>(
    rpc: &R,
    storage: &Storage,
    low: u64,
    high: u64,
) -> Result<Option<u64>> {
    if high == 0 || low >= high {
        return Ok(None);
    }
    for number in (low..high).rev() {
        // Blocks without an anchor (no logs, not a window end) cannot match.
        let Some(stored) = storage.block_hash(number)? else {
            continue;
        };
        let live = rpc.header_by_number(number).await?;
        if live.hash == stored {
            return Ok(Some(number));
        }
    }
    Ok(None)
}

fn unix_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
