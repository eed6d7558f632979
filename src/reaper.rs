use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::observability::REAPER_SWEPT_TOTAL;

/// What one sweep did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Sweep {
    pub completed: usize,
    pub expired_checkouts: usize,
    pub compacted: bool,
}

/// Background task: persist elapsed completions, drop stale checkouts and
/// compact the WAL once enough appends have piled up.
pub async fn run_reaper(engine: Arc<Engine>, period: Duration, compact_threshold: u64) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        let sweep = sweep_once(&engine, compact_threshold).await;
        if sweep != Sweep::default() {
            info!(
                completed = sweep.completed,
                expired_checkouts = sweep.expired_checkouts,
                compacted = sweep.compacted,
                "reaper sweep"
            );
        }
    }
}

pub async fn sweep_once(engine: &Engine, compact_threshold: u64) -> Sweep {
    let mut sweep = Sweep::default();

    match engine.complete_elapsed().await {
        Ok(n) => sweep.completed = n,
        // A busy room is retried next tick.
        Err(e) => debug!("reaper skip completion: {e}"),
    }
    sweep.expired_checkouts = engine.expire_checkouts();

    metrics::counter!(REAPER_SWEPT_TOTAL, "kind" => "completed").increment(sweep.completed as u64);
    metrics::counter!(REAPER_SWEPT_TOTAL, "kind" => "checkout_expired").increment(sweep.expired_checkouts as u64);

    if compact_threshold > 0 && engine.wal_appends_since_compact().await >= compact_threshold {
        match engine.compact_wal().await {
            Ok(()) => sweep.compacted = true,
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
    sweep
}
