//! Order state machine.
//!
//! ```text
//! Pending -> Paid -> Processing -> Completed
//!                        |    ^
//!                        v    |  (retry)
//!                        Failed
//! ```
//!
//! Every transition is a single guarded update in `db::repo`; when the guard
//! does not match, the row is re-read to report why.
use crate::db::{self, Pool};
use crate::error::PipelineError;
use crate::model::{GenerationResult, Order, OrderStatus};
use tracing::{info, instrument, warn};

async fn load(pool: &Pool, order_id: i64) -> Result<Order, PipelineError> {
    db::fetch_order(pool, order_id)
        .await?
        .ok_or(PipelineError::OrderNotFound(order_id))
}

/// paid|failed -> processing. Returns the order as it looks after the
/// transition, which is what the pipeline runs against.
#[instrument(skip_all, fields(order_id = order_id))]
pub async fn start_generation(pool: &Pool, order_id: i64) -> Result<Order, PipelineError> {
    let order = load(pool, order_id).await?;
    if !order.status.can_start_generation() || !db::begin_processing(pool, order_id).await? {
        // Re-read so a lost race reports the winner's state.
        let current = load(pool, order_id).await?;
        return Err(PipelineError::InvalidState {
            order_id,
            operation: "start_generation",
            actual: current.status,
            expected: "paid or failed",
        });
    }
    info!(order_id, from = %order.status, "generation started");
    load(pool, order_id).await
}

/// processing -> completed. A repeated call carrying the same artifact is a
/// no-op success.
#[instrument(skip_all, fields(order_id = order_id))]
pub async fn complete_generation(
    pool: &Pool,
    order_id: i64,
    result: &GenerationResult,
) -> Result<(), PipelineError> {
    if db::complete_processing(pool, order_id, result).await? {
        info!(
            order_id,
            artifact_url = %result.artifact_url,
            bytes = result.artifact_bytes,
            "generation completed"
        );
        return Ok(());
    }
    let current = load(pool, order_id).await?;
    let same_artifact = current.artifact_url.as_deref() == Some(result.artifact_url.as_str())
        && current.artifact_bytes == Some(result.artifact_bytes as i64);
    if current.status == OrderStatus::Completed && same_artifact {
        return Ok(());
    }
    Err(PipelineError::InvalidState {
        order_id,
        operation: "complete_generation",
        actual: current.status,
        expected: "processing",
    })
}

/// processing -> failed. The reason is kept for operators only.
#[instrument(skip_all, fields(order_id = order_id))]
pub async fn fail_generation(pool: &Pool, order_id: i64, reason: &str) -> Result<(), PipelineError> {
    if db::fail_processing(pool, order_id, reason).await? {
        info!(order_id, reason, "generation failed");
        return Ok(());
    }
    let current = load(pool, order_id).await?;
    Err(PipelineError::InvalidState {
        order_id,
        operation: "fail_generation",
        actual: current.status,
        expected: "processing",
    })
}

/// Administrative override to completed, from any state.
#[instrument(skip_all, fields(order_id = order_id))]
pub async fn force_complete(pool: &Pool, order_id: i64, artifact_url: &str) -> Result<(), PipelineError> {
    let artifact_url = artifact_url.trim();
    if artifact_url.is_empty() {
        return Err(PipelineError::Validation(
            "force-complete needs an artifact URL".into(),
        ));
    }
    let before = load(pool, order_id).await?;
    if !db::force_complete(pool, order_id, artifact_url).await? {
        return Err(PipelineError::OrderNotFound(order_id));
    }
    warn!(order_id, from = %before.status, artifact_url, "order force-completed by operator");
    Ok(())
}

/// Administrative override to failed, from any state.
#[instrument(skip_all, fields(order_id = order_id))]
pub async fn force_fail(pool: &Pool, order_id: i64, reason: &str) -> Result<(), PipelineError> {
    let before = load(pool, order_id).await?;
    if !db::force_fail(pool, order_id, reason, false).await? {
        return Err(PipelineError::OrderNotFound(order_id));
    }
    warn!(order_id, from = %before.status, reason, "order force-failed by operator");
    Ok(())
}

/// Like [`force_fail`], but an order already handed to the print partner is
/// left alone.
#[instrument(skip_all, fields(order_id = order_id))]
pub async fn mark_failed(pool: &Pool, order_id: i64, reason: &str) -> Result<(), PipelineError> {
    if db::force_fail(pool, order_id, reason, true).await? {
        warn!(order_id, reason, "order marked failed by operator");
        return Ok(());
    }
    let current = load(pool, order_id).await?;
    Err(PipelineError::InvalidState {
        order_id,
        operation: "mark_failed",
        actual: current.status,
        expected: "an order not yet dispatched",
    })
}
