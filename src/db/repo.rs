use super::model::OutboxTask;
use crate::model::{
    Customization, DispatchRecord, GenerationResult, ModelCategory, NewOrder, Order, OrderStatus,
    OutboxKind, SegmentationMethod,
};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::instrument;

pub type Pool = SqlitePool;

const ORDER_COLUMNS: &str = "id, status, photo_url, category, customer_email, customer_name, \
     customization, artifact_url, artifact_bytes, artifact_created_at, segmentation_method, \
     vertex_count, face_count, watertight, elapsed_ms, failure_reason, dispatched, \
     created_at, updated_at";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let mut options = SqlitePoolOptions::new();
    // Every connection to `sqlite::memory:` is a separate database.
    if normalized.starts_with("sqlite::memory") {
        options = options.max_connections(1);
    }
    let pool = options.connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/`, ensure the parent
/// directory exists and ask SQLite to create the file. Leaves in-memory URLs
/// untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    match query_part {
        Some(q) if q.contains("mode=") => {
            rebuilt.push('?');
            rebuilt.push_str(q);
        }
        Some(q) => {
            rebuilt.push('?');
            rebuilt.push_str(q);
            rebuilt.push_str("&mode=rwc");
        }
        None => rebuilt.push_str("?mode=rwc"),
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn order_from_row(row: &SqliteRow) -> Result<Order> {
    let id: i64 = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    let status = OrderStatus::parse_status(&status)
        .ok_or_else(|| anyhow!("order {} has unknown status {}", id, status))?;
    let category: String = row.try_get("category")?;
    let category = ModelCategory::parse_category(&category)
        .ok_or_else(|| anyhow!("order {} has unknown category {}", id, category))?;
    let customization = row
        .try_get::<Option<String>, _>("customization")?
        .filter(|s| !s.trim().is_empty())
        .map(|s| serde_json::from_str::<Customization>(&s))
        .transpose()
        .with_context(|| format!("order {} has malformed customization", id))?;
    let segmentation_method = row
        .try_get::<Option<String>, _>("segmentation_method")?
        .and_then(|s| SegmentationMethod::parse_method(&s));

    Ok(Order {
        id,
        status,
        photo_url: row.try_get("photo_url")?,
        category,
        customer_email: row.try_get("customer_email")?,
        customer_name: row.try_get("customer_name")?,
        customization,
        artifact_url: row.try_get("artifact_url")?,
        artifact_bytes: row.try_get("artifact_bytes")?,
        artifact_created_at: row.try_get("artifact_created_at")?,
        segmentation_method,
        vertex_count: row.try_get("vertex_count")?,
        face_count: row.try_get("face_count")?,
        watertight: row.try_get("watertight")?,
        elapsed_ms: row.try_get("elapsed_ms")?,
        failure_reason: row.try_get("failure_reason")?,
        dispatched: row.try_get("dispatched")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Checkout-side insert; orders start out pending.
#[instrument(skip_all)]
pub async fn insert_order(pool: &Pool, new: &NewOrder) -> Result<i64> {
    let customization = new
        .customization
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let now = Utc::now();
    let id: i64 = sqlx::query(
        "INSERT INTO orders (status, photo_url, category, customer_email, customer_name, customization, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(OrderStatus::Pending.as_str())
    .bind(&new.photo_url)
    .bind(new.category.as_str())
    .bind(&new.customer_email)
    .bind(&new.customer_name)
    .bind(customization)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await?
    .get("id");
    Ok(id)
}

/// Payment confirmation: pending → paid.
#[instrument(skip_all)]
pub async fn mark_paid(pool: &Pool, order_id: i64) -> Result<bool> {
    let res = sqlx::query("UPDATE orders SET status = 'paid', updated_at = ? WHERE id = ? AND status = 'pending'")
        .bind(Utc::now())
        .bind(order_id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn fetch_order(pool: &Pool, order_id: i64) -> Result<Option<Order>> {
    let sql = format!("SELECT {} FROM orders WHERE id = ?", ORDER_COLUMNS);
    let row = sqlx::query(&sql).bind(order_id).fetch_optional(pool).await?;
    row.as_ref().map(order_from_row).transpose()
}

/// paid|failed → processing, dropping any previous result.
#[instrument(skip_all)]
pub async fn begin_processing(pool: &Pool, order_id: i64) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE orders SET status = 'processing', artifact_url = NULL, artifact_bytes = NULL, \
         artifact_created_at = NULL, segmentation_method = NULL, vertex_count = NULL, face_count = NULL, \
         watertight = NULL, elapsed_ms = NULL, failure_reason = NULL, updated_at = ? \
         WHERE id = ? AND status IN ('paid', 'failed')",
    )
    .bind(Utc::now())
    .bind(order_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// processing → completed, storing the artifact metadata in the same write.
#[instrument(skip_all)]
pub async fn complete_processing(pool: &Pool, order_id: i64, result: &GenerationResult) -> Result<bool> {
    let now = Utc::now();
    let res = sqlx::query(
        "UPDATE orders SET status = 'completed', artifact_url = ?, artifact_bytes = ?, artifact_created_at = ?, \
         segmentation_method = ?, vertex_count = ?, face_count = ?, watertight = ?, elapsed_ms = ?, \
         failure_reason = NULL, updated_at = ? \
         WHERE id = ? AND status = 'processing'",
    )
    .bind(&result.artifact_url)
    .bind(result.artifact_bytes as i64)
    .bind(now)
    .bind(result.segmentation_method.as_str())
    .bind(result.vertex_count as i64)
    .bind(result.face_count as i64)
    .bind(result.watertight)
    .bind(result.elapsed_ms as i64)
    .bind(now)
    .bind(order_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// processing → failed.
#[instrument(skip_all)]
pub async fn fail_processing(pool: &Pool, order_id: i64, reason: &str) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE orders SET status = 'failed', artifact_url = NULL, artifact_bytes = NULL, artifact_created_at = NULL, \
         failure_reason = ?, updated_at = ? WHERE id = ? AND status = 'processing'",
    )
    .bind(reason)
    .bind(Utc::now())
    .bind(order_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Administrative: any state → completed with the given artifact.
#[instrument(skip_all)]
pub async fn force_complete(pool: &Pool, order_id: i64, artifact_url: &str) -> Result<bool> {
    let now = Utc::now();
    let res = sqlx::query(
        "UPDATE orders SET status = 'completed', artifact_url = ?, artifact_created_at = ?, \
         failure_reason = NULL, updated_at = ? WHERE id = ?",
    )
    .bind(artifact_url)
    .bind(now)
    .bind(now)
    .bind(order_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Administrative: any state → failed. With `spare_dispatched`, orders already
/// handed to the partner are left alone.
#[instrument(skip_all)]
pub async fn force_fail(pool: &Pool, order_id: i64, reason: &str, spare_dispatched: bool) -> Result<bool> {
    let sql = if spare_dispatched {
        "UPDATE orders SET status = 'failed', artifact_url = NULL, artifact_bytes = NULL, artifact_created_at = NULL, \
         failure_reason = ?, updated_at = ? WHERE id = ? AND dispatched = 0"
    } else {
        "UPDATE orders SET status = 'failed', artifact_url = NULL, artifact_bytes = NULL, artifact_created_at = NULL, \
         failure_reason = ?, updated_at = ? WHERE id = ?"
    };
    let res = sqlx::query(sql)
        .bind(reason)
        .bind(Utc::now())
        .bind(order_id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() == 1)
}

/// Compare-and-swap on the dispatch claim. Succeeds for exactly one caller
/// while the order is completed, has an artifact, is not yet dispatched and
/// has no live claim (claims older than `stale_before` are considered dead).
#[instrument(skip_all)]
pub async fn claim_dispatch(
    pool: &Pool,
    order_id: i64,
    token: &str,
    now: DateTime<Utc>,
    stale_before: DateTime<Utc>,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE orders SET dispatch_claim = ?, dispatch_claimed_at = ?, updated_at = ? \
         WHERE id = ? AND status = 'completed' AND artifact_url IS NOT NULL AND dispatched = 0 \
         AND (dispatch_claim IS NULL OR julianday(dispatch_claimed_at) < julianday(?))",
    )
    .bind(token)
    .bind(now)
    .bind(now)
    .bind(order_id)
    .bind(stale_before)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Extend a live claim. Returns false when `token` no longer holds it.
#[instrument(skip_all)]
pub async fn renew_dispatch(pool: &Pool, order_id: i64, token: &str, now: DateTime<Utc>) -> Result<bool> {
    let res = sqlx::query("UPDATE orders SET dispatch_claimed_at = ? WHERE id = ? AND dispatch_claim = ?")
        .bind(now)
        .bind(order_id)
        .bind(token)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn release_dispatch(pool: &Pool, order_id: i64, token: &str) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE orders SET dispatch_claim = NULL, dispatch_claimed_at = NULL WHERE id = ? AND dispatch_claim = ?",
    )
    .bind(order_id)
    .bind(token)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Flip `dispatched` for the claim holder and record the partner response in
/// one transaction. Returns false if the claim was lost in the meantime.
#[instrument(skip_all)]
pub async fn finalize_dispatch(pool: &Pool, record: &DispatchRecord, token: &str) -> Result<bool> {
    let mut tx = pool.begin().await?;
    let res = sqlx::query(
        "UPDATE orders SET dispatched = 1, dispatch_claim = NULL, dispatch_claimed_at = NULL, updated_at = ? \
         WHERE id = ? AND dispatch_claim = ? AND dispatched = 0 AND status = 'completed' AND artifact_url IS NOT NULL",
    )
    .bind(record.dispatched_at)
    .bind(record.order_id)
    .bind(token)
    .execute(&mut *tx)
    .await?;
    if res.rows_affected() != 1 {
        tx.rollback().await?;
        return Ok(false);
    }
    sqlx::query(
        "INSERT INTO dispatch_records (order_id, correlation_id, destination, response_status, dispatched_at) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(record.order_id)
    .bind(&record.correlation_id)
    .bind(&record.destination)
    .bind(record.response_status as i64)
    .bind(record.dispatched_at)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(true)
}

pub async fn fetch_dispatch_record(pool: &Pool, order_id: i64) -> Result<Option<DispatchRecord>> {
    let row = sqlx::query(
        "SELECT order_id, correlation_id, destination, response_status, dispatched_at \
         FROM dispatch_records WHERE order_id = ?",
    )
    .bind(order_id)
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let status: i64 = row.try_get("response_status")?;
    Ok(Some(DispatchRecord {
        order_id: row.try_get("order_id")?,
        correlation_id: row.try_get("correlation_id")?,
        destination: row.try_get("destination")?,
        response_status: u16::try_from(status).context("response status out of range")?,
        dispatched_at: row.try_get("dispatched_at")?,
    }))
}

/// Drop artifact references older than `cutoff` on orders that were never
/// handed to the partner. A swept completed order becomes failed so the
/// artifact/status invariant keeps holding.
#[instrument(skip_all)]
pub async fn sweep_expired_artifacts(pool: &Pool, cutoff: DateTime<Utc>) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE orders SET artifact_url = NULL, artifact_bytes = NULL, artifact_created_at = NULL, \
         failure_reason = CASE WHEN status = 'completed' THEN 'artifact expired' ELSE failure_reason END, \
         status = CASE WHEN status = 'completed' THEN 'failed' ELSE status END, \
         updated_at = ? \
         WHERE artifact_url IS NOT NULL AND artifact_created_at IS NOT NULL \
         AND julianday(artifact_created_at) < julianday(?) \
         AND (status = 'failed' OR dispatched = 0) \
         AND (dispatch_claim IS NULL OR julianday(dispatch_claimed_at) < julianday(?))",
    )
    .bind(Utc::now())
    .bind(cutoff)
    .bind(cutoff)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

#[instrument(skip_all)]
pub async fn enqueue_outbox(pool: &Pool, kind: OutboxKind, ref_id: i64, due_at: DateTime<Utc>) -> Result<i64> {
    let rec = sqlx::query("INSERT INTO outbox (kind, ref_id, attempt, due_at) VALUES (?, ?, 0, ?) RETURNING id")
        .bind(kind.as_str())
        .bind(ref_id)
        .bind(due_at)
        .fetch_one(pool)
        .await?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn next_due_outbox(pool: &Pool) -> Result<Option<OutboxTask>> {
    let row = sqlx::query(
        "SELECT id, kind, ref_id, attempt FROM outbox WHERE datetime(due_at) <= datetime('now') \
         ORDER BY datetime(due_at) ASC, id ASC LIMIT 1",
    )
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let raw_kind: String = row.get("kind");
    Ok(Some(OutboxTask {
        id: row.get("id"),
        kind: OutboxKind::parse_kind(&raw_kind),
        raw_kind,
        ref_id: row.get("ref_id"),
        attempt: row.get("attempt"),
    }))
}

#[instrument(skip_all)]
pub async fn delete_outbox(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM outbox WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Exponential backoff: 5s * 2^attempt, capped at `max_cap_secs` (no cap when <= 0).
#[instrument(skip_all)]
pub async fn backoff_outbox_with_cap(pool: &Pool, id: i64, attempt: i32, max_cap_secs: i64) -> Result<()> {
    let secs = 5_i64 * (1_i64 << attempt.clamp(0, 10));
    let secs = if max_cap_secs <= 0 {
        secs
    } else {
        secs.min(max_cap_secs)
    };
    sqlx::query("UPDATE outbox SET attempt = ?, due_at = datetime('now', ? || ' seconds') WHERE id = ?")
        .bind(attempt + 1)
        .bind(secs)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn count_outbox(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox")
        .fetch_one(pool)
        .await?;
    Ok(count)
}
