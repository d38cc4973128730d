//! Background removal as an ordered chain of strategies. The first strategy
//! that produces a usable cutout wins; the unsegmented original is never
//! passed on.
use crate::error::PipelineError;
use crate::model::{SegmentationMethod, SegmentationOutcome};
use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};

pub mod local;
pub mod remote;

pub use local::LocalHeuristic;
pub use remote::RemoteCutout;

/// A customer photo already resolved into memory.
#[derive(Debug, Clone)]
pub struct SourceImage {
    pub order_id: i64,
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait SegmentationStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn method(&self) -> SegmentationMethod;

    /// Write a cutout of `source` into `out_dir` and describe it.
    async fn segment(&self, source: &SourceImage, out_dir: &Path) -> Result<SegmentationOutcome>;
}

#[derive(Clone, Default)]
pub struct SegmentationChain {
    strategies: Vec<Arc<dyn SegmentationStrategy>>,
}

impl SegmentationChain {
    pub fn new(strategies: Vec<Arc<dyn SegmentationStrategy>>) -> Self {
        Self { strategies }
    }

    pub fn push(&mut self, strategy: Arc<dyn SegmentationStrategy>) {
        self.strategies.push(strategy);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    #[instrument(skip_all, fields(order_id = source.order_id))]
    pub async fn run(&self, source: &SourceImage, out_dir: &Path) -> Result<SegmentationOutcome, PipelineError> {
        let mut attempts = Vec::with_capacity(self.strategies.len());
        for strategy in &self.strategies {
            let started = Instant::now();
            match strategy.segment(source, out_dir).await {
                Ok(outcome) => {
                    info!(
                        order_id = source.order_id,
                        method = strategy.name(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        bytes = outcome.bytes,
                        "segmentation succeeded"
                    );
                    return Ok(outcome);
                }
                Err(err) => {
                    warn!(
                        order_id = source.order_id,
                        method = strategy.name(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        error = %err,
                        "segmentation attempt failed"
                    );
                    attempts.push(format!("{}: {:#}", strategy.name(), err));
                }
            }
        }
        if attempts.is_empty() {
            attempts.push("no strategies configured".into());
        }
        Err(PipelineError::Segmentation { attempts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        name: &'static str,
        succeed: bool,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(name: &'static str, succeed: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                succeed,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl SegmentationStrategy for Scripted {
        fn name(&self) -> &'static str {
            self.name
        }

        fn method(&self) -> SegmentationMethod {
            SegmentationMethod::Local
        }

        async fn segment(&self, _source: &SourceImage, out_dir: &Path) -> Result<SegmentationOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.succeed {
                Ok(SegmentationOutcome {
                    method: self.method(),
                    path: out_dir.join(format!("{}.png", self.name)),
                    bytes: 2048,
                })
            } else {
                Err(anyhow!("{} unavailable", self.name))
            }
        }
    }

    fn source() -> SourceImage {
        SourceImage {
            order_id: 3,
            bytes: vec![1, 2, 3],
        }
    }

    #[tokio::test]
    async fn falls_through_to_first_success() {
        let first = Scripted::new("first", false);
        let second = Scripted::new("second", true);
        let third = Scripted::new("third", true);
        let strategies: Vec<Arc<dyn SegmentationStrategy>> = vec![first.clone(), second.clone(), third.clone()];
        let chain = SegmentationChain::new(strategies);

        let outcome = chain.run(&source(), Path::new("/tmp")).await.unwrap();
        assert_eq!(outcome.path, PathBuf::from("/tmp/second.png"));
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);
        assert_eq!(third.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn all_failures_are_reported() {
        let mut chain = SegmentationChain::default();
        chain.push(Scripted::new("a", false));
        chain.push(Scripted::new("b", false));
        assert_eq!(chain.names(), vec!["a", "b"]);
        match chain.run(&source(), Path::new("/tmp")).await {
            Err(PipelineError::Segmentation { attempts }) => {
                assert_eq!(attempts.len(), 2);
                assert!(attempts[0].starts_with("a: a unavailable"));
            }
            other => panic!("unexpected {:?}", other.map(|o| o.path)),
        }

        let empty = SegmentationChain::default();
        assert!(matches!(
            empty.run(&source(), Path::new("/tmp")).await,
            Err(PipelineError::Segmentation { .. })
        ));
    }
}
