//! Client for the external image-to-3D service.
use crate::error::ServiceError;
use crate::fetch;
use crate::model::GenerationRequest;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::Client;
use serde_json::json;
use tracing::{debug, instrument};

const SERVICE: &str = "reconstruction";

#[async_trait]
pub trait ReconstructionService: Send + Sync {
    /// Turn a cleaned photo into a raw mesh buffer. One attempt, no retry.
    async fn reconstruct(&self, image: &[u8], request: &GenerationRequest) -> Result<Vec<u8>, ServiceError>;
}

pub struct HttpReconstruction {
    http: Client,
    endpoint: String,
    token: String,
    min_output_bytes: u64,
}

impl HttpReconstruction {
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
            cfg.reconstruction.endpoint.clone(),
            cfg.reconstruction.token.clone(),
            cfg.reconstruction.min_output_bytes,
        )
    }
}

#[async_trait]
impl ReconstructionService for HttpReconstruction {
    #[instrument(skip_all, fields(order_id = request.order_id))]
    async fn reconstruct(&self, image: &[u8], request: &GenerationRequest) -> Result<Vec<u8>, ServiceError> {
        let tier = request
            .customization
            .as_ref()
            .map(|c| c.quality_tier)
            .unwrap_or_default();
        let body = json!({
            "image": format!("data:image/png;base64,{}", STANDARD.encode(image)),
            "category": request.category.as_str(),
            "quality_tier": tier,
            "output_format": "glb",
        });
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| ServiceError::from_transport(SERVICE, &e))?;
        let mesh = fetch::materialize(&self.http, SERVICE, response).await?;
        if (mesh.len() as u64) < self.min_output_bytes {
            return Err(ServiceError::protocol(
                SERVICE,
                format!(
                    "mesh buffer is {} bytes, expected at least {}",
                    mesh.len(),
                    self.min_output_bytes
                ),
            ));
        }
        debug!(bytes = mesh.len(), "reconstruction returned mesh");
        Ok(mesh)
    }
}
