use crate::config::BackfillConfig;
use crate::db::{ConversationStore, StoreResult};
use crate::media::MediaStabilizer;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// A message whose media failed this many times is left alone by the sweep.
pub const MEDIA_BACKFILL_MAX_ATTEMPTS: i64 = 20;
const MEDIA_BACKFILL_CONCURRENCY: usize = 4;

pub fn compute_backoff(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exponent = (attempt.max(1) - 1).min(16);
    base.saturating_mul(2_u32.pow(exponent)).min(cap)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub scanned: usize,
    pub stabilized: usize,
    pub failed: usize,
}

/// One sweep over media that is still pending or failed. `grace` keeps the sweep away
/// from messages whose first stabilization task may still be running.
pub async fn run_media_backfill(
    store: &Arc<dyn ConversationStore>,
    stabilizer: &MediaStabilizer,
    batch: i64,
    grace: Duration,
) -> StoreResult<BackfillReport> {
    let cutoff = Utc::now() - chrono::Duration::from_std(grace).unwrap_or_else(|_| chrono::Duration::zero());
    let rows = store
        .list_unstabilized_media(cutoff, MEDIA_BACKFILL_MAX_ATTEMPTS, batch)
        .await?;
    let scanned = rows.len();

    let results: Vec<bool> = stream::iter(rows)
        .map(|message| async move {
            match stabilizer.stabilize(&message).await {
                Ok(_) => true,
                Err(err) => {
                    // Terminal errors take the message out of future sweeps.
                    let attempts = if err.is_retryable() {
                        1
                    } else {
                        MEDIA_BACKFILL_MAX_ATTEMPTS
                    };
                    debug!(message_id = %message.id, "backfill attempt failed: {err}");
                    if let Err(store_err) = store
                        .record_media_failure(&message.id, attempts, &err.to_string())
                        .await
                    {
                        warn!(message_id = %message.id, "could not record media failure: {store_err}");
                    }
                    false
                }
            }
        })
        .buffer_unordered(MEDIA_BACKFILL_CONCURRENCY)
        .collect()
        .await;

    let stabilized = results.iter().filter(|ok| **ok).count();
    Ok(BackfillReport {
        scanned,
        stabilized,
        failed: scanned - stabilized,
    })
}

pub async fn start_backfill_worker(
    store: Arc<dyn ConversationStore>,
    stabilizer: Arc<MediaStabilizer>,
    cfg: BackfillConfig,
) {
    if !cfg.enabled {
        return;
    }

    let grace = stabilizer.settings().deadline;
    let poll = Duration::from_secs(cfg.poll_interval_secs.max(1));
    loop {
        match run_media_backfill(&store, &stabilizer, cfg.batch, grace).await {
            Ok(report) if report.scanned > 0 => {
                info!(
                    scanned = report.scanned,
                    stabilized = report.stabilized,
                    failed = report.failed,
                    "media backfill sweep"
                );
            }
            Ok(_) => {}
            Err(err) => warn!("media backfill sweep failed: {err}"),
        }
        sleep(poll).await;
    }
}
