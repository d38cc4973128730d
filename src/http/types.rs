use crate::db::Pool;
use crate::dispatch::DispatchCoordinator;
use crate::error::{DispatchError, PipelineError};
use crate::model::{Customization, ModelCategory, Order, OrderStatus, SegmentationMethod};
use crate::pipeline::Pipeline;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::error;

#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub pipeline: Arc<Pipeline>,
    pub dispatcher: DispatchCoordinator,
    pub content_dir: PathBuf,
    pub retention_window: chrono::Duration,
}

#[derive(Debug, Default, Deserialize)]
pub struct GenerateQuery {
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Deserialize)]
pub struct ForceCompleteRequest {
    pub artifact_url: String,
}

#[derive(Debug, Deserialize)]
pub struct ForceFailRequest {
    pub reason: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct MarkFailedRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AutoDispatchBody {
    pub enabled: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AutoDispatchChanged {
    pub enabled: bool,
    pub previous: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CleanupResponse {
    pub cleaned: u64,
}

/// Order as exposed over HTTP. Failure reasons stay in the logs.
#[derive(Debug, Serialize, Deserialize)]
pub struct OrderView {
    pub id: i64,
    pub status: OrderStatus,
    pub status_label: String,
    pub category: ModelCategory,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customization: Option<Customization>,
    pub artifact_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_bytes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segmentation_method: Option<SegmentationMethod>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vertex_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub face_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watertight: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<i64>,
    pub dispatched: bool,
    pub updated_at: DateTime<Utc>,
}

impl From<Order> for OrderView {
    fn from(order: Order) -> Self {
        Self {
            id: order.id,
            status: order.status,
            status_label: order.status.customer_label().to_string(),
            category: order.category,
            customization: order.customization,
            artifact_url: order.artifact_url,
            artifact_bytes: order.artifact_bytes,
            segmentation_method: order.segmentation_method,
            vertex_count: order.vertex_count,
            face_count: order.face_count,
            watertight: order.watertight,
            elapsed_ms: order.elapsed_ms,
            dispatched: order.dispatched,
            updated_at: order.updated_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

/// Error half of every handler.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub kind: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation", message)
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        let status = match &err {
            PipelineError::OrderNotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::InvalidState { .. } => StatusCode::CONFLICT,
            PipelineError::Validation(_) => StatusCode::BAD_REQUEST,
            PipelineError::Photo(_)
            | PipelineError::Segmentation { .. }
            | PipelineError::Reconstruction(_)
            | PipelineError::Mesh(_)
            | PipelineError::Quality { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            PipelineError::Io(_) | PipelineError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.kind().as_str(), err.to_string())
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        let status = match &err {
            DispatchError::NotEligible { .. } => StatusCode::CONFLICT,
            DispatchError::PartnerRejected { .. } | DispatchError::Partner { .. } => StatusCode::BAD_GATEWAY,
            DispatchError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let kind = match &err {
            DispatchError::NotEligible { .. } => "not_eligible",
            DispatchError::PartnerRejected { .. } | DispatchError::Partner { .. } => "dispatch",
            DispatchError::Storage(_) => "internal",
        };
        Self::new(status, kind, err.to_string())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", format!("{:#}", err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = self.status.as_u16(), kind = self.kind, message = %self.message, "request failed");
        }
        (
            self.status,
            Json(ErrorBody {
                error: self.kind.to_string(),
                message: self.message,
            }),
        )
            .into_response()
    }
}
