use super::{SegmentationStrategy, SourceImage};
use crate::error::ServiceError;
use crate::fetch;
use crate::model::{SegmentationMethod, SegmentationOutcome};
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::Client;
use serde_json::json;
use std::path::Path;
use tracing::debug;

const SERVICE: &str = "cutout";

/// Hosted background-removal service.
pub struct RemoteCutout {
    http: Client,
    endpoint: String,
    token: String,
    min_output_bytes: u64,
}

impl RemoteCutout {
    pub fn new(http: Client, endpoint: impl Into<String>, token: impl Into<String>, min_output_bytes: u64) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            token: token.into(),
            min_output_bytes,
        }
    }

    pub fn from_config(http: Client, cfg: &crate::config::Config) -> Self {
        Self::new(
            http,
            cfg.segmentation.endpoint.clone(),
            cfg.segmentation.token.clone(),
            cfg.segmentation.min_output_bytes,
        )
    }

    async fn request(&self, source: &SourceImage) -> Result<Vec<u8>, ServiceError> {
        let body = json!({
            "image": format!("data:application/octet-stream;base64,{}", STANDARD.encode(&source.bytes)),
            "output_format": "png",
        });
        let mut req = self.http.post(&self.endpoint).json(&body);
        if !self.token.is_empty() {
            req = req.bearer_auth(&self.token);
        }
        let response = req
            .send()
            .await
            .map_err(|e| ServiceError::from_transport(SERVICE, &e))?;
        let bytes = fetch::materialize(&self.http, SERVICE, response).await?;
        if (bytes.len() as u64) < self.min_output_bytes {
            return Err(ServiceError::protocol(
                SERVICE,
                format!(
                    "cutout is {} bytes, expected at least {}",
                    bytes.len(),
                    self.min_output_bytes
                ),
            ));
        }
        Ok(bytes)
    }
}

#[async_trait]
impl SegmentationStrategy for RemoteCutout {
    fn name(&self) -> &'static str {
        "remote_cutout"
    }

    fn method(&self) -> SegmentationMethod {
        SegmentationMethod::External
    }

    async fn segment(&self, source: &SourceImage, out_dir: &Path) -> Result<SegmentationOutcome> {
        let bytes = self.request(source).await?;
        let path = out_dir.join(format!("{}-{}.png", source.order_id, uuid::Uuid::new_v4()));
        tokio::fs::write(&path, &bytes)
            .await
            .with_context(|| format!("failed to write cutout {}", path.display()))?;
        debug!(path = %path.display(), bytes = bytes.len(), "stored remote cutout");
        Ok(SegmentationOutcome {
            method: self.method(),
            path,
            bytes: bytes.len() as u64,
        })
    }
}
