use crate::db::{self, Pool};
use crate::dispatch::DispatchCoordinator;
use crate::model::OutboxKind;
use anyhow::Result;
use tracing::{info, instrument, warn};

/// Run the oldest due outbox task, if any. Returns whether one was found.
#[instrument(skip_all)]
pub async fn process_next_task(
    pool: &Pool,
    dispatcher: &DispatchCoordinator,
    max_backoff_secs: i64,
) -> Result<bool> {
    let Some(task) = db::next_due_outbox(pool).await? else {
        return Ok(false);
    };
    let (id, ref_id, attempt) = (task.id, task.ref_id, task.attempt);
    let kind = task.raw_kind.as_str();

    match task.kind {
        Some(OutboxKind::DispatchOrder) => match dispatcher.dispatch(ref_id).await {
            Ok(record) => {
                db::delete_outbox(pool, id).await?;
                info!(id, kind, ref_id, correlation_id = %record.correlation_id, "outbox task succeeded");
            }
            Err(err) if err.is_not_eligible() => {
                db::delete_outbox(pool, id).await?;
                info!(id, kind, ref_id, error = %err, "outbox task dropped; order no longer eligible");
            }
            Err(err) => {
                warn!(?err, id, kind, ref_id, attempt, "outbox task failed; backoff");
                db::backoff_outbox_with_cap(pool, id, attempt, max_backoff_secs).await?;
            }
        },
        None => {
            warn!(id, kind, ref_id, "unknown outbox task kind; dropping");
            db::delete_outbox(pool, id).await?;
        }
    }
    Ok(true)
}
