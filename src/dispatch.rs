//! Hands completed orders to the print partner, exactly once.
//!
//! Exclusivity comes from the dispatch claim in `db::claim_dispatch`: only the
//! caller whose conditional update matched talks to the partner, and it keeps
//! renewing the claim until the partner answers. The
//! `dispatched` flag is set together with the dispatch record once the
//! partner has accepted the job.
use crate::db::{self, Pool};
use crate::error::{DispatchError, Ineligible, ServiceError};
use crate::model::{
    Customization, DispatchRecord, ModelCategory, Order, OrderStatus, OutboxKind,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Serialize;
use std::sync::{Arc, RwLock};
use tracing::{error, info, instrument, warn};

/// Process-wide auto-dispatch switch. Starts from config, changed only by
/// the admin endpoint, never persisted.
#[derive(Debug, Clone, Default)]
pub struct AutoDispatch(Arc<RwLock<bool>>);

impl AutoDispatch {
    pub fn new(enabled: bool) -> Self {
        Self(Arc::new(RwLock::new(enabled)))
    }

    pub fn enabled(&self) -> bool {
        match self.0.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Returns the previous value.
    pub fn set(&self, enabled: bool) -> bool {
        let mut guard = match self.0.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::replace(&mut *guard, enabled)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CustomerContact {
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Body posted to the print partner.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PartnerJob {
    pub order_id: i64,
    pub correlation_id: String,
    pub category: ModelCategory,
    pub material: &'static str,
    pub max_dimension_mm: f64,
    pub artifact_url: String,
    pub customer: CustomerContact,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customization: Option<Customization>,
}

impl PartnerJob {
    fn for_order(order: &Order, artifact_url: String, correlation_id: String) -> Self {
        Self {
            order_id: order.id,
            correlation_id,
            category: order.category,
            material: order.category.material(),
            max_dimension_mm: order.category.max_dimension_mm(),
            artifact_url,
            customer: CustomerContact {
                email: order.customer_email.clone(),
                name: order.customer_name.clone(),
            },
            customization: order.customization.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartnerReceipt {
    pub status: u16,
}

#[async_trait]
pub trait PrintPartner: Send + Sync {
    /// Where jobs go, recorded on the dispatch record.
    fn destination(&self) -> &str;

    async fn submit(&self, job: &PartnerJob) -> Result<PartnerReceipt, DispatchError>;
}

pub struct HttpPrintPartner {
    http: Client,
    endpoint: String,
    token: String,
}

impl HttpPrintPartner {
    pub fn new(http: Client, endpoint: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            token: token.into(),
        }
    }

    pub fn from_config(http: Client, cfg: &crate::config::Config) -> Self {
        Self::new(http, cfg.dispatch.endpoint.clone(), cfg.dispatch.token.clone())
    }
}

#[async_trait]
impl PrintPartner for HttpPrintPartner {
    fn destination(&self) -> &str {
        &self.endpoint
    }

    async fn submit(&self, job: &PartnerJob) -> Result<PartnerReceipt, DispatchError> {
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .header("X-Correlation-Id", &job.correlation_id)
            .json(job)
            .send()
            .await
            .map_err(|e| DispatchError::Partner {
                order_id: job.order_id,
                source: ServiceError::from_transport("print_partner", &e),
            })?;
        let status = response.status();
        if status.is_success() {
            return Ok(PartnerReceipt {
                status: status.as_u16(),
            });
        }
        let body = response.text().await.unwrap_or_default();
        Err(DispatchError::PartnerRejected {
            order_id: job.order_id,
            status: status.as_u16(),
            body: body.chars().take(500).collect(),
        })
    }
}

/// "Your model is ready" message for the customer.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ReadyNotice {
    pub order_id: i64,
    pub recipient: String,
    pub recipient_name: Option<String>,
    pub artifact_url: String,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn artifact_ready(&self, notice: &ReadyNotice) -> Result<()>;
}

/// Posts notices to an email relay webhook.
pub struct HttpNotifier {
    http: Client,
    endpoint: String,
    sender: Option<String>,
}

impl HttpNotifier {
    pub fn new(http: Client, endpoint: impl Into<String>, sender: Option<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            sender,
        }
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn artifact_ready(&self, notice: &ReadyNotice) -> Result<()> {
        let body = serde_json::json!({
            "to": notice.recipient,
            "from": self.sender,
            "subject": format!("Your order #{} is ready", notice.order_id),
            "order_id": notice.order_id,
            "name": notice.recipient_name,
            "artifact_url": notice.artifact_url,
        });
        self.http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Used when no relay is configured.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn artifact_ready(&self, notice: &ReadyNotice) -> Result<()> {
        info!(
            order_id = notice.order_id,
            recipient = %notice.recipient,
            artifact_url = %notice.artifact_url,
            "artifact ready (no notification relay configured)"
        );
        Ok(())
    }
}

pub fn notifier_from_config(http: Client, cfg: &crate::config::Config) -> Arc<dyn Notifier> {
    match &cfg.notification.endpoint {
        Some(endpoint) => Arc::new(HttpNotifier::new(
            http,
            endpoint.clone(),
            cfg.notification.sender.clone(),
        )),
        None => Arc::new(LogNotifier),
    }
}

#[derive(Clone)]
pub struct DispatchCoordinator {
    pool: Pool,
    partner: Arc<dyn PrintPartner>,
    notifier: Arc<dyn Notifier>,
    auto: AutoDispatch,
    lease: chrono::Duration,
}

impl DispatchCoordinator {
    pub fn new(
        pool: Pool,
        partner: Arc<dyn PrintPartner>,
        notifier: Arc<dyn Notifier>,
        auto: AutoDispatch,
        lease: chrono::Duration,
    ) -> Self {
        Self {
            pool,
            partner,
            notifier,
            auto,
            lease,
        }
    }

    pub fn auto_dispatch(&self) -> &AutoDispatch {
        &self.auto
    }

    async fn ineligible(&self, order_id: i64) -> Result<DispatchError, DispatchError> {
        let reason = match db::fetch_order(&self.pool, order_id).await? {
            None => Ineligible::NotFound,
            Some(order) if order.dispatched => Ineligible::AlreadyDispatched,
            Some(order) if order.status != OrderStatus::Completed => Ineligible::WrongState(order.status),
            Some(order) if order.artifact_url.is_none() => Ineligible::MissingArtifact,
            // Someone else holds the claim, or held it a moment ago.
            Some(_) => Ineligible::InFlight,
        };
        Ok(DispatchError::NotEligible { order_id, reason })
    }

    /// Submit a completed order to the print partner. Concurrent callers for
    /// the same order result in a single submission; the others get
    /// `NotEligible`.
    #[instrument(skip_all, fields(order_id = order_id))]
    pub async fn dispatch(&self, order_id: i64) -> Result<DispatchRecord, DispatchError> {
        let token = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        if !db::claim_dispatch(&self.pool, order_id, &token, now, now - self.lease).await? {
            return Err(self.ineligible(order_id).await?);
        }

        let order = match db::fetch_order(&self.pool, order_id).await {
            Ok(Some(order)) => order,
            Ok(None) => {
                self.release(order_id, &token).await;
                return Err(DispatchError::NotEligible {
                    order_id,
                    reason: Ineligible::NotFound,
                });
            }
            Err(err) => {
                self.release(order_id, &token).await;
                return Err(err.into());
            }
        };
        let Some(artifact_url) = order.artifact_url.clone() else {
            self.release(order_id, &token).await;
            return Err(DispatchError::NotEligible {
                order_id,
                reason: Ineligible::MissingArtifact,
            });
        };

        let job = PartnerJob::for_order(&order, artifact_url.clone(), token.clone());
        let receipt = match self.submit_holding_claim(&job, &token).await {
            Ok(receipt) => receipt,
            Err(err) => {
                warn!(order_id, error = %err, "print partner submission failed; claim released");
                self.release(order_id, &token).await;
                return Err(err);
            }
        };

        let record = DispatchRecord {
            order_id,
            correlation_id: token.clone(),
            destination: self.partner.destination().to_string(),
            response_status: receipt.status,
            dispatched_at: Utc::now(),
        };
        if !db::finalize_dispatch(&self.pool, &record, &token).await? {
            error!(
                order_id,
                correlation_id = %token,
                "partner accepted the job but the dispatch claim was lost"
            );
            return Err(DispatchError::NotEligible {
                order_id,
                reason: Ineligible::InFlight,
            });
        }
        info!(
            order_id,
            correlation_id = %record.correlation_id,
            status = record.response_status,
            "order dispatched to print partner"
        );

        let notifier = self.notifier.clone();
        let notice = ReadyNotice {
            order_id,
            recipient: order.customer_email.clone(),
            recipient_name: order.customer_name.clone(),
            artifact_url,
        };
        tokio::spawn(async move {
            if let Err(err) = notifier.artifact_ready(&notice).await {
                warn!(order_id = notice.order_id, ?err, "customer notification failed");
            }
        });

        Ok(record)
    }

    /// Runs the partner call while renewing the claim, so a slow partner
    /// never lets the lease lapse under an in-flight submission.
    async fn submit_holding_claim(&self, job: &PartnerJob, token: &str) -> Result<PartnerReceipt, DispatchError> {
        let period = self
            .lease
            .to_std()
            .unwrap_or(std::time::Duration::from_secs(1))
            / 3;
        let period = period.max(std::time::Duration::from_millis(10));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let submit = self.partner.submit(job);
        tokio::pin!(submit);
        loop {
            tokio::select! {
                outcome = &mut submit => return outcome,
                _ = heartbeat.tick() => {
                    match db::renew_dispatch(&self.pool, job.order_id, token, Utc::now()).await {
                        Ok(true) => {}
                        Ok(false) => warn!(order_id = job.order_id, "dispatch claim lost while the partner call was running"),
                        Err(err) => warn!(order_id = job.order_id, ?err, "failed to renew dispatch claim"),
                    }
                }
            }
        }
    }

    async fn release(&self, order_id: i64, token: &str) {
        if let Err(err) = db::release_dispatch(&self.pool, order_id, token).await {
            error!(order_id, ?err, "failed to release dispatch claim");
        }
    }

    /// Called after a generation completes. Does nothing unless the toggle is
    /// on; a failed attempt is queued on the outbox for retry.
    #[instrument(skip_all, fields(order_id = order_id))]
    pub async fn dispatch_if_enabled(&self, order_id: i64) -> Option<DispatchRecord> {
        if !self.auto.enabled() {
            return None;
        }
        match self.dispatch(order_id).await {
            Ok(record) => Some(record),
            Err(err) if err.is_not_eligible() => {
                info!(order_id, error = %err, "auto-dispatch skipped");
                None
            }
            Err(err) => {
                warn!(order_id, error = %err, "auto-dispatch failed; queued for retry");
                if let Err(e) = db::enqueue_outbox(&self.pool, OutboxKind::DispatchOrder, order_id, Utc::now()).await {
                    error!(order_id, ?e, "failed to queue dispatch retry");
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_dispatch_toggle_is_shared() {
        let toggle = AutoDispatch::new(false);
        let view = toggle.clone();
        assert!(!view.enabled());
        assert!(!toggle.set(true));
        assert!(view.enabled());
        assert!(view.set(false));
        assert!(!toggle.enabled());
    }

    #[test]
    fn partner_job_carries_catalog_details() {
        let now = Utc::now();
        let order = Order {
            id: 5,
            status: OrderStatus::Completed,
            photo_url: "/uploads/x.jpg".into(),
            category: ModelCategory::HuntingTrophy,
            customer_email: "a@b.c".into(),
            customer_name: None,
            customization: None,
            artifact_url: Some("http://x/5.stl".into()),
            artifact_bytes: Some(20_000),
            artifact_created_at: Some(now),
            segmentation_method: None,
            vertex_count: None,
            face_count: None,
            watertight: None,
            elapsed_ms: None,
            failure_reason: None,
            dispatched: false,
            created_at: now,
            updated_at: now,
        };
        let job = PartnerJob::for_order(&order, "http://x/5.stl".into(), "corr".into());
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["category"], "hunting_trophy");
        assert_eq!(value["material"], "pla_matte");
        assert_eq!(value["max_dimension_mm"], 100.0);
        assert_eq!(value["customer"]["email"], "a@b.c");
        assert!(value["customer"].get("name").is_none());
        assert!(value.get("customization").is_none());
    }
}
