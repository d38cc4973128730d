//! Error taxonomy shared by the pipeline stages, the state machine and the
//! dispatch coordinator.
use crate::model::OrderStatus;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Operator-facing classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Authentication,
    Quota,
    Network,
    NotFound,
    Validation,
    Quality,
    InvalidState,
    Dispatch,
    Segmentation,
    Mesh,
    Protocol,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Authentication => "authentication",
            ErrorKind::Quota => "quota",
            ErrorKind::Network => "network",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Validation => "validation",
            ErrorKind::Quality => "quality",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::Dispatch => "dispatch",
            ErrorKind::Segmentation => "segmentation",
            ErrorKind::Mesh => "mesh",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure talking to an external service, already classified.
#[derive(Debug, Clone, Error)]
#[error("{service} {kind} failure: {detail}")]
pub struct ServiceError {
    pub service: &'static str,
    pub kind: ErrorKind,
    pub detail: String,
}

impl ServiceError {
    pub fn new(service: &'static str, kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            service,
            kind,
            detail: detail.into(),
        }
    }

    /// Response arrived but its shape or size is unusable.
    pub fn protocol(service: &'static str, detail: impl Into<String>) -> Self {
        Self::new(service, ErrorKind::Protocol, detail)
    }

    /// Classify a non-success HTTP status. The body is inspected when the
    /// status alone is ambiguous (some providers report quota as 400).
    pub fn from_status(service: &'static str, status: u16, body: &str) -> Self {
        let kind = match status {
            401 | 403 => ErrorKind::Authentication,
            402 | 429 => ErrorKind::Quota,
            404 | 410 => ErrorKind::NotFound,
            408 | 500..=599 => ErrorKind::Network,
            400 | 422 => classify_message(body).unwrap_or(ErrorKind::Validation),
            _ => classify_message(body).unwrap_or(ErrorKind::Protocol),
        };
        let snippet: String = body.chars().take(300).collect();
        Self::new(service, kind, format!("HTTP {}: {}", status, snippet))
    }

    pub fn from_transport(service: &'static str, err: &reqwest::Error) -> Self {
        let kind = if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            ErrorKind::Network
        } else if let Some(status) = err.status() {
            return Self::from_status(service, status.as_u16(), &err.to_string());
        } else {
            classify_message(&err.to_string()).unwrap_or(ErrorKind::Network)
        };
        Self::new(service, kind, err.to_string())
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == ErrorKind::Network
    }
}

static AUTH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)unauthori[sz]ed|forbidden|invalid (api )?(token|key)|authentication").unwrap()
});
static QUOTA_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)quota|rate.?limit|too many requests|insufficient (credit|balance)|billing").unwrap()
});
static NETWORK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)timed? ?out|connection (reset|refused|closed)|dns|temporarily unavailable|bad gateway").unwrap()
});
static NOT_FOUND_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)not found|no such model|does not exist").unwrap());

/// Best-effort classification from free-form diagnostic text.
pub fn classify_message(message: &str) -> Option<ErrorKind> {
    if AUTH_RE.is_match(message) {
        Some(ErrorKind::Authentication)
    } else if QUOTA_RE.is_match(message) {
        Some(ErrorKind::Quota)
    } else if NETWORK_RE.is_match(message) {
        Some(ErrorKind::Network)
    } else if NOT_FOUND_RE.is_match(message) {
        Some(ErrorKind::NotFound)
    } else {
        None
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("order {0} not found")]
    OrderNotFound(i64),

    #[error("order {order_id} is {actual}, {operation} requires {expected}")]
    InvalidState {
        order_id: i64,
        operation: &'static str,
        actual: OrderStatus,
        expected: &'static str,
    },

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("photo unavailable: {0}")]
    Photo(#[source] ServiceError),

    #[error("segmentation failed: every strategy failed ({})", .attempts.join("; "))]
    Segmentation { attempts: Vec<String> },

    #[error("reconstruction failed: {0}")]
    Reconstruction(#[source] ServiceError),

    #[error("mesh normalization failed: {0}")]
    Mesh(String),

    #[error("quality gate rejected artifact: {reason}")]
    Quality { size: u64, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::OrderNotFound(_) => ErrorKind::NotFound,
            PipelineError::InvalidState { .. } => ErrorKind::InvalidState,
            PipelineError::Validation(_) => ErrorKind::Validation,
            PipelineError::Photo(e) | PipelineError::Reconstruction(e) => e.kind,
            PipelineError::Segmentation { .. } => ErrorKind::Segmentation,
            PipelineError::Mesh(_) => ErrorKind::Mesh,
            PipelineError::Quality { .. } => ErrorKind::Quality,
            PipelineError::Io(_) | PipelineError::Storage(_) => ErrorKind::Internal,
        }
    }

    /// Pipeline stage the error is attributed to in logs.
    pub fn stage(&self) -> &'static str {
        match self {
            PipelineError::OrderNotFound(_) | PipelineError::InvalidState { .. } => "lifecycle",
            PipelineError::Validation(_) | PipelineError::Photo(_) => "intake",
            PipelineError::Segmentation { .. } => "segmentation",
            PipelineError::Reconstruction(_) => "reconstruction",
            PipelineError::Mesh(_) => "normalization",
            PipelineError::Quality { .. } => "quality_gate",
            PipelineError::Io(_) | PipelineError::Storage(_) => "persistence",
        }
    }
}

/// Why an order cannot be dispatched right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Ineligible {
    NotFound,
    WrongState(OrderStatus),
    MissingArtifact,
    AlreadyDispatched,
    InFlight,
}

impl fmt::Display for Ineligible {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ineligible::NotFound => f.write_str("order not found"),
            Ineligible::WrongState(s) => write!(f, "order is {}, not completed", s),
            Ineligible::MissingArtifact => f.write_str("order has no artifact"),
            Ineligible::AlreadyDispatched => f.write_str("order already dispatched"),
            Ineligible::InFlight => f.write_str("dispatch already in flight"),
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("order {order_id} not eligible for dispatch: {reason}")]
    NotEligible { order_id: i64, reason: Ineligible },

    #[error("print partner rejected order {order_id} with HTTP {status}: {body}")]
    PartnerRejected {
        order_id: i64,
        status: u16,
        body: String,
    },

    #[error("print partner unreachable for order {order_id}: {source}")]
    Partner {
        order_id: i64,
        #[source]
        source: ServiceError,
    },

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl DispatchError {
    pub fn is_not_eligible(&self) -> bool {
        matches!(self, DispatchError::NotEligible { .. })
    }
}
