#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use printforge::db::{self, Pool};
use printforge::dispatch::{
    AutoDispatch, DispatchCoordinator, Notifier, PartnerJob, PartnerReceipt, PrintPartner, ReadyNotice,
};
use printforge::error::{DispatchError, ServiceError};
use printforge::mesh::stl::write_binary_stl;
use printforge::mesh::IndexedMesh;
use printforge::model::{
    GenerationRequest, ModelCategory, NewOrder, SegmentationMethod, SegmentationOutcome,
};
use printforge::pipeline::{Pipeline, PipelineSettings};
use printforge::quality::QualityGate;
use printforge::reconstruction::ReconstructionService;
use printforge::segmentation::{SegmentationChain, SegmentationStrategy, SourceImage};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Duration;

pub const PHOTO_REF: &str = "/uploads/photo.jpg";

pub async fn setup_pool() -> Pool {
    let pool = db::init_pool("sqlite::memory:").await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    pool
}

pub async fn paid_order(pool: &Pool, category: ModelCategory) -> i64 {
    let id = db::insert_order(
        pool,
        &NewOrder {
            photo_url: PHOTO_REF.into(),
            category,
            customer_email: "customer@example.com".into(),
            customer_name: Some("Casey".into()),
            customization: None,
        },
    )
    .await
    .unwrap();
    assert!(db::mark_paid(pool, id).await.unwrap());
    id
}

/// Content directory with the reference photo in place.
pub async fn content_dir() -> tempfile::TempDir {
    let td = tempfile::tempdir().unwrap();
    tokio::fs::create_dir_all(td.path().join("uploads")).await.unwrap();
    tokio::fs::write(td.path().join("uploads/photo.jpg"), vec![0xFF; 4096])
        .await
        .unwrap();
    td
}

pub fn settings(content: &Path) -> PipelineSettings {
    PipelineSettings {
        content_dir: content.to_path_buf(),
        public_base_url: "http://localhost:8080/artifacts/".into(),
        max_attempts: 3,
        backoff_base: Duration::from_millis(5),
        quality: QualityGate::default(),
    }
}

/// Closed cube split into `n` x `n` quads per side, as binary STL.
pub fn cube_stl(size: f64, n: u32) -> Vec<u8> {
    let mut mesh = IndexedMesh::new();
    let step = size / n as f64;
    let sides = [
        (0usize, 0.0, 1usize, 2usize, true),
        (0, size, 1, 2, false),
        (1, 0.0, 2, 0, true),
        (1, size, 2, 0, false),
        (2, 0.0, 0, 1, true),
        (2, size, 0, 1, false),
    ];
    for (axis, value, u, v, flip) in sides {
        let base = mesh.vertices.len() as u32;
        for i in 0..=n {
            for j in 0..=n {
                let mut p = [0.0; 3];
                p[axis] = value;
                p[u] = step * i as f64;
                p[v] = step * j as f64;
                mesh.vertices.push(p);
            }
        }
        let idx = |i: u32, j: u32| base + i * (n + 1) + j;
        for i in 0..n {
            for j in 0..n {
                let (a, b, c, d) = (idx(i, j), idx(i + 1, j), idx(i + 1, j + 1), idx(i, j + 1));
                if flip {
                    mesh.faces.push([a, c, b]);
                    mesh.faces.push([a, d, c]);
                } else {
                    mesh.faces.push([a, b, c]);
                    mesh.faces.push([a, c, d]);
                }
            }
        }
    }
    write_binary_stl(&mesh)
}

/// Segmentation strategy that either writes a fixed cutout or fails.
pub struct ScriptedSegmentation {
    pub name: &'static str,
    pub method: SegmentationMethod,
    pub succeed: bool,
    pub calls: Arc<Mutex<usize>>,
}

impl ScriptedSegmentation {
    pub fn new(name: &'static str, method: SegmentationMethod, succeed: bool) -> Arc<Self> {
        Arc::new(Self {
            name,
            method,
            succeed,
            calls: Arc::new(Mutex::new(0)),
        })
    }

    pub async fn calls(&self) -> usize {
        *self.calls.lock().await
    }
}

#[async_trait]
impl SegmentationStrategy for ScriptedSegmentation {
    fn name(&self) -> &'static str {
        self.name
    }

    fn method(&self) -> SegmentationMethod {
        self.method
    }

    async fn segment(&self, source: &SourceImage, out_dir: &Path) -> Result<SegmentationOutcome> {
        *self.calls.lock().await += 1;
        if !self.succeed {
            return Err(anyhow!("{} is down", self.name));
        }
        let path = out_dir.join(format!("{}-{}.png", source.order_id, self.name));
        let bytes = vec![0x89; 2048];
        tokio::fs::write(&path, &bytes).await?;
        Ok(SegmentationOutcome {
            method: self.method,
            path,
            bytes: bytes.len() as u64,
        })
    }
}

pub fn chain(strategies: Vec<Arc<ScriptedSegmentation>>) -> SegmentationChain {
    let mut chain = SegmentationChain::default();
    for s in strategies {
        chain.push(s);
    }
    chain
}

/// Reconstruction fake answering from a queue; the last answer repeats.
#[derive(Clone, Default)]
pub struct QueuedReconstruction {
    responses: Arc<Mutex<VecDeque<Result<Vec<u8>, ServiceError>>>>,
    calls: Arc<Mutex<Vec<i64>>>,
}

impl QueuedReconstruction {
    pub fn with_responses(responses: Vec<Result<Vec<u8>, ServiceError>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            ..Default::default()
        })
    }

    pub async fn calls(&self) -> usize {
        self.calls.lock().await.len()
    }
}

#[async_trait]
impl ReconstructionService for QueuedReconstruction {
    async fn reconstruct(&self, _image: &[u8], request: &GenerationRequest) -> Result<Vec<u8>, ServiceError> {
        self.calls.lock().await.push(request.order_id);
        let mut guard = self.responses.lock().await;
        if guard.len() > 1 {
            return guard.pop_front().unwrap();
        }
        guard
            .front()
            .cloned()
            .unwrap_or_else(|| Err(ServiceError::protocol("reconstruction", "no scripted response")))
    }
}

/// Print partner that records every job and answers from a queue
/// (accepting with 201 once the queue is drained).
#[derive(Clone, Default)]
pub struct RecordingPartner {
    responses: Arc<Mutex<VecDeque<Result<u16, u16>>>>,
    jobs: Arc<Mutex<Vec<PartnerJob>>>,
    delay: Duration,
}

impl RecordingPartner {
    pub fn accepting() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Default::default()
        })
    }

    /// `Ok(status)` accepts, `Err(status)` rejects.
    pub fn with_responses(responses: Vec<Result<u16, u16>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            ..Default::default()
        })
    }

    pub async fn jobs(&self) -> Vec<PartnerJob> {
        self.jobs.lock().await.clone()
    }
}

#[async_trait]
impl PrintPartner for RecordingPartner {
    fn destination(&self) -> &str {
        "http://partner.test/jobs"
    }

    async fn submit(&self, job: &PartnerJob) -> Result<PartnerReceipt, DispatchError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.jobs.lock().await.push(job.clone());
        match self.responses.lock().await.pop_front().unwrap_or(Ok(201)) {
            Ok(status) => Ok(PartnerReceipt { status }),
            Err(status) => Err(DispatchError::PartnerRejected {
                order_id: job.order_id,
                status,
                body: "partner unavailable".into(),
            }),
        }
    }
}

#[derive(Clone, Default)]
pub struct RecordingNotifier {
    notices: Arc<Mutex<Vec<ReadyNotice>>>,
}

impl RecordingNotifier {
    pub async fn notices(&self) -> Vec<ReadyNotice> {
        self.notices.lock().await.clone()
    }

    /// Notifications are fire-and-forget; give the spawned task a moment.
    pub async fn wait_for(&self, count: usize) -> Vec<ReadyNotice> {
        for _ in 0..50 {
            let notices = self.notices().await;
            if notices.len() >= count {
                return notices;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.notices().await
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn artifact_ready(&self, notice: &ReadyNotice) -> Result<()> {
        self.notices.lock().await.push(notice.clone());
        Ok(())
    }
}

pub fn coordinator(
    pool: &Pool,
    partner: Arc<RecordingPartner>,
    notifier: Arc<RecordingNotifier>,
    auto: bool,
) -> DispatchCoordinator {
    DispatchCoordinator::new(
        pool.clone(),
        partner,
        notifier,
        AutoDispatch::new(auto),
        chrono::Duration::minutes(5),
    )
}

pub fn pipeline(
    pool: &Pool,
    content: &Path,
    segmentation: SegmentationChain,
    reconstruction: Arc<dyn ReconstructionService>,
) -> Pipeline {
    let http = printforge::fetch::build_http_client(Duration::from_secs(5)).unwrap();
    Pipeline::new(pool.clone(), http, segmentation, reconstruction, settings(content))
}
