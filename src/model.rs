use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Paid,
    Processing,
    Completed,
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Paid => "paid",
            OrderStatus::Processing => "processing",
            OrderStatus::Completed => "completed",
            OrderStatus::Failed => "failed",
        }
    }

    pub fn parse_status(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(OrderStatus::Pending),
            "paid" => Some(OrderStatus::Paid),
            "processing" => Some(OrderStatus::Processing),
            "completed" => Some(OrderStatus::Completed),
            "failed" => Some(OrderStatus::Failed),
            _ => None,
        }
    }

    /// The only states a generation run may start from.
    pub fn can_start_generation(&self) -> bool {
        matches!(self, OrderStatus::Paid | OrderStatus::Failed)
    }

    /// Customer-facing wording. Operators get the full error taxonomy instead.
    pub fn customer_label(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "awaiting payment",
            OrderStatus::Paid => "paid",
            OrderStatus::Processing => "processing",
            OrderStatus::Completed => "ready",
            OrderStatus::Failed => "failed, retry available",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed product catalog. Each entry carries the size the printed piece is
/// normalized to and the material the partner prints it in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ModelCategory {
    HuntingTrophy,
    PetFigurine,
    Bust,
    Keepsake,
    Keychain,
}

impl ModelCategory {
    pub const ALL: [ModelCategory; 5] = [
        ModelCategory::HuntingTrophy,
        ModelCategory::PetFigurine,
        ModelCategory::Bust,
        ModelCategory::Keepsake,
        ModelCategory::Keychain,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelCategory::HuntingTrophy => "hunting_trophy",
            ModelCategory::PetFigurine => "pet_figurine",
            ModelCategory::Bust => "bust",
            ModelCategory::Keepsake => "keepsake",
            ModelCategory::Keychain => "keychain",
        }
    }

    pub fn parse_category(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == value)
    }

    pub fn max_dimension_mm(&self) -> f64 {
        match self {
            ModelCategory::HuntingTrophy => 100.0,
            ModelCategory::PetFigurine => 80.0,
            ModelCategory::Bust => 120.0,
            ModelCategory::Keepsake => 60.0,
            ModelCategory::Keychain => 40.0,
        }
    }

    pub fn material(&self) -> &'static str {
        match self {
            ModelCategory::HuntingTrophy => "pla_matte",
            ModelCategory::PetFigurine => "pla_silk",
            ModelCategory::Bust | ModelCategory::Keepsake => "resin",
            ModelCategory::Keychain => "petg",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    #[default]
    Standard,
    Premium,
    Ultra,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Customization {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engraving_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default)]
    pub quality_tier: QualityTier,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    pub status: OrderStatus,
    pub photo_url: String,
    pub category: ModelCategory,
    pub customer_email: String,
    pub customer_name: Option<String>,
    pub customization: Option<Customization>,
    pub artifact_url: Option<String>,
    pub artifact_bytes: Option<i64>,
    pub artifact_created_at: Option<DateTime<Utc>>,
    pub segmentation_method: Option<SegmentationMethod>,
    pub vertex_count: Option<i64>,
    pub face_count: Option<i64>,
    pub watertight: Option<bool>,
    pub elapsed_ms: Option<i64>,
    pub failure_reason: Option<String>,
    pub dispatched: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields checkout supplies when it creates an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOrder {
    pub photo_url: String,
    pub category: ModelCategory,
    pub customer_email: String,
    pub customer_name: Option<String>,
    pub customization: Option<Customization>,
}

/// Inputs for one pipeline run. Never persisted.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub order_id: i64,
    pub photo_url: String,
    pub category: ModelCategory,
    pub customization: Option<Customization>,
}

impl From<&Order> for GenerationRequest {
    fn from(order: &Order) -> Self {
        Self {
            order_id: order.id,
            photo_url: order.photo_url.clone(),
            category: order.category,
            customization: order.customization.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationResult {
    pub artifact_url: String,
    pub artifact_bytes: u64,
    pub elapsed_ms: u64,
    pub segmentation_method: SegmentationMethod,
    pub vertex_count: usize,
    pub face_count: usize,
    pub watertight: bool,
    pub customization: Option<Customization>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SegmentationMethod {
    External,
    Local,
    None,
}

impl SegmentationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentationMethod::External => "external",
            SegmentationMethod::Local => "local",
            SegmentationMethod::None => "none",
        }
    }

    pub fn parse_method(value: &str) -> Option<Self> {
        match value {
            "external" => Some(SegmentationMethod::External),
            "local" => Some(SegmentationMethod::Local),
            "none" => Some(SegmentationMethod::None),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentationOutcome {
    pub method: SegmentationMethod,
    pub path: PathBuf,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DispatchRecord {
    pub order_id: i64,
    pub correlation_id: String,
    pub destination: String,
    pub response_status: u16,
    pub dispatched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OutboxKind {
    DispatchOrder,
}

impl OutboxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxKind::DispatchOrder => "dispatch_order",
        }
    }

    pub fn parse_kind(value: &str) -> Option<Self> {
        match value {
            "dispatch_order" => Some(OutboxKind::DispatchOrder),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            OrderStatus::Pending,
            OrderStatus::Paid,
            OrderStatus::Processing,
            OrderStatus::Completed,
            OrderStatus::Failed,
        ] {
            assert_eq!(OrderStatus::parse_status(status.as_str()), Some(status));
        }
        assert_eq!(OrderStatus::parse_status("shipped"), None);
    }

    #[test]
    fn only_paid_and_failed_can_start() {
        assert!(OrderStatus::Paid.can_start_generation());
        assert!(OrderStatus::Failed.can_start_generation());
        assert!(!OrderStatus::Pending.can_start_generation());
        assert!(!OrderStatus::Processing.can_start_generation());
        assert!(!OrderStatus::Completed.can_start_generation());
    }

    #[test]
    fn catalog_lookup_by_wire_name() {
        let cat = ModelCategory::parse_category("hunting_trophy").unwrap();
        assert_eq!(cat, ModelCategory::HuntingTrophy);
        assert_eq!(cat.max_dimension_mm(), 100.0);
        assert!(ModelCategory::parse_category("spaceship").is_none());
        let json = serde_json::to_string(&ModelCategory::PetFigurine).unwrap();
        assert_eq!(json, "\"pet_figurine\"");
    }

    #[test]
    fn customization_defaults_to_standard_tier() {
        let c: Customization = serde_json::from_str(r#"{"engraving_text":"Buck 2024"}"#).unwrap();
        assert_eq!(c.quality_tier, QualityTier::Standard);
        assert_eq!(c.engraving_text.as_deref(), Some("Buck 2024"));
        assert!(c.font.is_none());
    }
}
