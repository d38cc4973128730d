//! Photo to print-ready STL, one order at a time.
//!
//! Stages run in sequence: resolve photo, segmentation chain, reconstruction
//! (retried on network failures only), normalization and STL export,
//! quality gate. Any stage error drives the order to failed.
use crate::config::Config;
use crate::db::Pool;
use crate::dispatch::DispatchCoordinator;
use crate::error::{PipelineError, ServiceError};
use crate::fetch;
use crate::lifecycle;
use crate::mesh::{self, stl};
use crate::model::{GenerationRequest, GenerationResult, Order};
use crate::quality::QualityGate;
use crate::reconstruction::ReconstructionService;
use crate::segmentation::{SegmentationChain, SourceImage};
use reqwest::Client;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub content_dir: PathBuf,
    pub public_base_url: String,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub quality: QualityGate,
}

impl PipelineSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            content_dir: cfg.content_dir(),
            public_base_url: cfg.app.public_base_url.clone(),
            max_attempts: cfg.reconstruction.max_attempts.max(1),
            backoff_base: Duration::from_millis(cfg.reconstruction.backoff_base_ms),
            quality: QualityGate::new(cfg.quality.min_file_bytes, cfg.mesh.require_watertight),
        }
    }

    pub fn clean_dir(&self) -> PathBuf {
        self.content_dir.join("clean")
    }

    pub fn models_dir(&self) -> PathBuf {
        self.content_dir.join("models")
    }

    pub fn artifact_url(&self, file_name: &str) -> String {
        format!("{}/{}", self.public_base_url.trim_end_matches('/'), file_name)
    }
}

/// What the CPU-bound part of the pipeline hands back.
struct Normalized {
    stl: Vec<u8>,
    vertex_count: usize,
    face_count: usize,
    watertight: bool,
}

pub struct Pipeline {
    pool: Pool,
    http: Client,
    segmentation: SegmentationChain,
    reconstruction: Arc<dyn ReconstructionService>,
    settings: PipelineSettings,
    dispatcher: Option<DispatchCoordinator>,
}

impl Pipeline {
    pub fn new(
        pool: Pool,
        http: Client,
        segmentation: SegmentationChain,
        reconstruction: Arc<dyn ReconstructionService>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            pool,
            http,
            segmentation,
            reconstruction,
            settings,
            dispatcher: None,
        }
    }

    /// Offer every completed order to the coordinator's auto-dispatch.
    pub fn with_dispatcher(mut self, dispatcher: DispatchCoordinator) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Start and run to completion.
    pub async fn generate(&self, order_id: i64) -> Result<GenerationResult, PipelineError> {
        let order = lifecycle::start_generation(&self.pool, order_id).await?;
        self.run(&order).await
    }

    /// Move to processing and run the stages in the background.
    pub async fn trigger(
        self: &Arc<Self>,
        order_id: i64,
    ) -> Result<(Order, tokio::task::JoinHandle<Result<GenerationResult, PipelineError>>), PipelineError> {
        let order = lifecycle::start_generation(&self.pool, order_id).await?;
        let pipeline = Arc::clone(self);
        let background = order.clone();
        let handle = tokio::spawn(async move { pipeline.run(&background).await });
        Ok((order, handle))
    }

    /// Run the stages for an order already in processing and record the
    /// outcome on it.
    #[instrument(skip_all, fields(order_id = order.id))]
    pub async fn run(&self, order: &Order) -> Result<GenerationResult, PipelineError> {
        let request = GenerationRequest::from(order);
        let started = Instant::now();
        match self.execute(&request, started).await {
            Ok(result) => {
                if let Err(err) = lifecycle::complete_generation(&self.pool, order.id, &result).await {
                    // An operator override landed while we were running.
                    warn!(order_id = order.id, error = %err, "late completion discarded");
                    return Err(err);
                }
                if let Some(dispatcher) = &self.dispatcher {
                    dispatcher.dispatch_if_enabled(order.id).await;
                }
                Ok(result)
            }
            Err(err) => {
                error!(
                    order_id = order.id,
                    stage = err.stage(),
                    kind = %err.kind(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    error = %err,
                    "generation failed"
                );
                let reason = format!("{}: {}", err.stage(), err);
                if let Err(e) = lifecycle::fail_generation(&self.pool, order.id, &reason).await {
                    warn!(order_id = order.id, error = %e, "could not record failure");
                }
                Err(err)
            }
        }
    }

    async fn execute(&self, request: &GenerationRequest, started: Instant) -> Result<GenerationResult, PipelineError> {
        let order_id = request.order_id;
        let photo = fetch::load_photo(&self.http, &self.settings.content_dir, &request.photo_url).await?;

        let clean_dir = self.settings.clean_dir();
        tokio::fs::create_dir_all(&clean_dir).await?;
        let source = SourceImage {
            order_id,
            bytes: photo,
        };
        let cutout = self.segmentation.run(&source, &clean_dir).await?;
        let clean = tokio::fs::read(&cutout.path).await?;

        let raw_mesh = self.reconstruct_with_retry(&clean, request).await?;
        info!(order_id, stage = "reconstruction", bytes = raw_mesh.len(), "mesh received");

        let target = request.category.max_dimension_mm();
        let gate = self.settings.quality;
        let normalized = tokio::task::spawn_blocking(move || normalize_and_check(&raw_mesh, target, gate))
            .await
            .map_err(|e| PipelineError::Storage(e.into()))??;

        let models_dir = self.settings.models_dir();
        tokio::fs::create_dir_all(&models_dir).await?;
        let file_name = format!("{}-{}.stl", order_id, uuid::Uuid::new_v4());
        tokio::fs::write(models_dir.join(&file_name), &normalized.stl).await?;

        let result = GenerationResult {
            artifact_url: self.settings.artifact_url(&file_name),
            artifact_bytes: normalized.stl.len() as u64,
            elapsed_ms: started.elapsed().as_millis() as u64,
            segmentation_method: cutout.method,
            vertex_count: normalized.vertex_count,
            face_count: normalized.face_count,
            watertight: normalized.watertight,
            customization: request.customization.clone(),
        };
        info!(
            order_id,
            method = cutout.method.as_str(),
            bytes = result.artifact_bytes,
            faces = result.face_count,
            elapsed_ms = result.elapsed_ms,
            "artifact ready"
        );
        Ok(result)
    }

    async fn reconstruct_with_retry(
        &self,
        image: &[u8],
        request: &GenerationRequest,
    ) -> Result<Vec<u8>, PipelineError> {
        let max_attempts = self.settings.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let started = Instant::now();
            let err: ServiceError = match self.reconstruction.reconstruct(image, request).await {
                Ok(mesh) => return Ok(mesh),
                Err(err) => err,
            };
            if !err.is_retryable() || attempt >= max_attempts {
                return Err(PipelineError::Reconstruction(err));
            }
            let delay = self.settings.backoff_base * 2u32.saturating_pow(attempt - 1);
            warn!(
                order_id = request.order_id,
                attempt,
                elapsed_ms = started.elapsed().as_millis() as u64,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "reconstruction attempt failed; retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

fn normalize_and_check(raw: &[u8], target_mm: f64, gate: QualityGate) -> Result<Normalized, PipelineError> {
    let (mut mesh, format) = mesh::decode_mesh(raw).map_err(|e| PipelineError::Mesh(e.to_string()))?;
    let report = mesh::normalize(&mut mesh, target_mm).map_err(|e| PipelineError::Mesh(e.to_string()))?;
    info!(
        format = ?format,
        vertices = report.vertex_count,
        faces = report.face_count,
        scale = report.scale_factor,
        watertight = report.watertight,
        "mesh normalized"
    );
    let stl = stl::write_binary_stl(&mesh);
    let verdict = gate.check(&stl, report.watertight);
    if !verdict.passed {
        return Err(PipelineError::Quality {
            size: verdict.size,
            reason: verdict.reason.unwrap_or_else(|| "rejected".into()),
        });
    }
    Ok(Normalized {
        stl,
        vertex_count: report.vertex_count,
        face_count: report.face_count,
        watertight: report.watertight,
    })
}
