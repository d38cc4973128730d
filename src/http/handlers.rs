use super::types::{
    ApiError, AppState, AutoDispatchBody, AutoDispatchChanged, CleanupResponse, ForceCompleteRequest,
    ForceFailRequest, GenerateQuery, MarkFailedRequest, OrderView,
};
use crate::db;
use crate::error::PipelineError;
use crate::fetch::content_path;
use crate::lifecycle;
use crate::model::DispatchRecord;
use crate::sweeper;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tokio::io::AsyncReadExt;
use tracing::{info, warn};

const STREAM_CHUNK: usize = 64 * 1024;

type ApiResult<T> = Result<T, ApiError>;

async fn order_view(state: &AppState, order_id: i64) -> ApiResult<OrderView> {
    let order = db::fetch_order(&state.pool, order_id)
        .await?
        .ok_or(PipelineError::OrderNotFound(order_id))?;
    Ok(order.into())
}

pub async fn health(State(state): State<AppState>) -> Response {
    match sqlx::query("SELECT 1").execute(&state.pool).await {
        Ok(_) => Json(json!({ "status": "ok" })).into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unhealthy", "error": e.to_string() })),
        )
            .into_response(),
    }
}

pub async fn get_order(State(state): State<AppState>, Path(order_id): Path<i64>) -> ApiResult<Json<OrderView>> {
    Ok(Json(order_view(&state, order_id).await?))
}

/// Starts generation. Answers 202 once the order is processing; with
/// `?wait=true` the whole pipeline runs inside the request.
pub async fn generate(
    State(state): State<AppState>,
    Path(order_id): Path<i64>,
    Query(query): Query<GenerateQuery>,
) -> ApiResult<Response> {
    if query.wait {
        let result = state.pipeline.generate(order_id).await?;
        return Ok(Json(result).into_response());
    }
    let (order, _background) = state.pipeline.trigger(order_id).await?;
    info!(order_id, "generation accepted");
    Ok((StatusCode::ACCEPTED, Json(OrderView::from(order))).into_response())
}

pub async fn dispatch(State(state): State<AppState>, Path(order_id): Path<i64>) -> ApiResult<Json<DispatchRecord>> {
    Ok(Json(state.dispatcher.dispatch(order_id).await?))
}

pub async fn force_complete(
    State(state): State<AppState>,
    Path(order_id): Path<i64>,
    Json(body): Json<ForceCompleteRequest>,
) -> ApiResult<Json<OrderView>> {
    lifecycle::force_complete(&state.pool, order_id, &body.artifact_url).await?;
    // a manual completion counts as a completion for auto-dispatch too
    state.dispatcher.dispatch_if_enabled(order_id).await;
    Ok(Json(order_view(&state, order_id).await?))
}

pub async fn force_fail(
    State(state): State<AppState>,
    Path(order_id): Path<i64>,
    Json(body): Json<ForceFailRequest>,
) -> ApiResult<Json<OrderView>> {
    if body.reason.trim().is_empty() {
        return Err(ApiError::bad_request("reason must be non-empty"));
    }
    lifecycle::force_fail(&state.pool, order_id, body.reason.trim()).await?;
    Ok(Json(order_view(&state, order_id).await?))
}

pub async fn mark_failed(
    State(state): State<AppState>,
    Path(order_id): Path<i64>,
    body: Option<Json<MarkFailedRequest>>,
) -> ApiResult<Json<OrderView>> {
    let reason = body
        .and_then(|Json(b)| b.reason)
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| "marked failed by operator".to_string());
    lifecycle::mark_failed(&state.pool, order_id, &reason).await?;
    Ok(Json(order_view(&state, order_id).await?))
}

pub async fn cleanup(State(state): State<AppState>) -> ApiResult<Json<CleanupResponse>> {
    let cleaned = sweeper::sweep(&state.pool, state.retention_window).await?;
    Ok(Json(CleanupResponse { cleaned }))
}

pub async fn get_auto_dispatch(State(state): State<AppState>) -> Json<AutoDispatchBody> {
    Json(AutoDispatchBody {
        enabled: state.dispatcher.auto_dispatch().enabled(),
    })
}

pub async fn set_auto_dispatch(
    State(state): State<AppState>,
    Json(body): Json<AutoDispatchBody>,
) -> Json<AutoDispatchChanged> {
    let previous = state.dispatcher.auto_dispatch().set(body.enabled);
    warn!(enabled = body.enabled, previous, "auto-dispatch toggled by operator");
    Json(AutoDispatchChanged {
        enabled: body.enabled,
        previous,
    })
}

fn valid_artifact_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Streams a generated STL back as a download.
pub async fn artifact(State(state): State<AppState>, Path(file_name): Path<String>) -> ApiResult<Response> {
    if !valid_artifact_name(&file_name) {
        return Err(ApiError::not_found("no such artifact"));
    }
    let path = content_path(&state.content_dir, &format!("models/{}", file_name))
        .ok_or_else(|| ApiError::not_found("no such artifact"))?;
    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ApiError::not_found("no such artifact"));
        }
        Err(e) => return Err(anyhow::Error::from(e).into()),
    };
    let len = file.metadata().await.map_err(anyhow::Error::from)?.len();

    let stream = futures::stream::try_unfold(file, |mut file| async move {
        let mut buf = vec![0u8; STREAM_CHUNK];
        let n = file.read(&mut buf).await?;
        if n == 0 {
            return Ok::<_, std::io::Error>(None);
        }
        buf.truncate(n);
        Ok(Some((buf, file)))
    });

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "model/stl")
        .header(header::CONTENT_LENGTH, len)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", file_name),
        )
        .body(Body::from_stream(stream))
        .map_err(anyhow::Error::from)?;
    Ok(response)
}
