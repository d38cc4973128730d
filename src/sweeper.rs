//! Retention: artifact references older than the window are dropped from
//! orders that were never handed to the print partner.
use crate::db::{self, Pool};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tracing::{info, instrument};

pub const DEFAULT_RETENTION_DAYS: i64 = 14;

/// Sweep relative to `now`; returns how many orders were cleaned.
#[instrument(skip_all)]
pub async fn sweep_at(pool: &Pool, window: Duration, now: DateTime<Utc>) -> Result<u64> {
    let cutoff = now - window;
    let cleaned = db::sweep_expired_artifacts(pool, cutoff).await?;
    if cleaned > 0 {
        info!(cleaned, %cutoff, "expired artifacts cleared");
    }
    Ok(cleaned)
}

pub async fn sweep(pool: &Pool, window: Duration) -> Result<u64> {
    sweep_at(pool, window, Utc::now()).await
}
