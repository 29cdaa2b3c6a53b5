//! Embedder gateway: owns the embedding model for the process lifetime.
//!
//! The model is loaded lazily and at most once through a [`ModelLoader`].
//! While loading, `embed` reports [`EmbedError::NotReady`]; a failed load is
//! sticky until [`EmbedderGateway::retry_load`] is called. Inference runs on
//! the blocking pool so a slow model never stalls the runtime.

pub mod pooled;
pub mod preprocess;

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::frame::Frame;
use crate::metrics::{metric_names, MetricsRegistry};
use crate::similarity::Embedding;
use preprocess::ModelInput;

pub use pooled::{PooledColorLoader, PooledColorModel};

/// Anything that can turn a frame into an embedding.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// True once a model is loaded and `embed` can succeed.
    fn is_ready(&self) -> bool;

    async fn embed(&self, frame: &Frame) -> Result<Embedding, EmbedError>;
}

/// A loaded model. `infer` is synchronous and may be slow; callers run it off
/// the async executor.
pub trait EmbeddingModel: Send + Sync {
    /// Square input resolution the model expects.
    fn input_size(&self) -> u32;

    /// Length of every embedding this model produces.
    fn dimension(&self) -> usize;

    fn infer(&self, input: &ModelInput) -> Result<Vec<f32>, EmbedError>;
}

/// Fetches and initializes a model (weights download, graph build, ...).
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(&self) -> Result<Arc<dyn EmbeddingModel>, ModelLoadError>;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EmbedError {
    #[error("embedding model not ready")]
    NotReady,
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("inference task failed: {0}")]
    TaskFailed(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ModelLoadError {
    #[error("model load failed: {0}")]
    Load(String),
    #[error("model unavailable after failed load: {0}")]
    PreviouslyFailed(String),
}

/// Lifecycle of the gateway's model handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum ModelStatus {
    NotLoaded,
    Loading,
    Ready,
    Failed(String),
}

impl ModelStatus {
    pub fn is_loading(&self) -> bool {
        matches!(self, ModelStatus::Loading)
    }
}

pub struct EmbedderGateway {
    loader: Arc<dyn ModelLoader>,
    model: RwLock<Option<Arc<dyn EmbeddingModel>>>,
    /// Serializes load attempts so concurrent callers share one.
    load_lock: tokio::sync::Mutex<()>,
    status_tx: watch::Sender<ModelStatus>,
    metrics: Arc<MetricsRegistry>,
}

impl EmbedderGateway {
    pub fn new(loader: Arc<dyn ModelLoader>, metrics: Arc<MetricsRegistry>) -> Self {
        let (status_tx, _) = watch::channel(ModelStatus::NotLoaded);
        Self {
            loader,
            model: RwLock::new(None),
            load_lock: tokio::sync::Mutex::new(()),
            status_tx,
            metrics,
        }
    }

    pub fn status(&self) -> ModelStatus {
        self.status_tx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ModelStatus> {
        self.status_tx.subscribe()
    }

    /// Load the model if it has not been loaded yet. Returns immediately when
    /// already ready; returns the earlier failure without retrying.
    pub async fn load(&self) -> Result<(), ModelLoadError> {
        let _serial = self.load_lock.lock().await;
        match self.status() {
            ModelStatus::Ready => return Ok(()),
            ModelStatus::Failed(reason) => return Err(ModelLoadError::PreviouslyFailed(reason)),
            ModelStatus::NotLoaded | ModelStatus::Loading => {}
        }

        self.status_tx.send_replace(ModelStatus::Loading);
        info!("loading embedding model");
        let span = self.metrics.span(metric_names::MODEL_LOAD);

        match self.loader.load().await {
            Ok(model) => {
                let (input_size, dimension) = (model.input_size(), model.dimension());
                *self.model.write() = Some(model);
                self.status_tx.send_replace(ModelStatus::Ready);
                let load_us = span.finish();
                info!(input_size, dimension, load_us, "embedding model ready");
                Ok(())
            }
            Err(e) => {
                let reason = match &e {
                    ModelLoadError::Load(msg) | ModelLoadError::PreviouslyFailed(msg) => {
                        msg.clone()
                    }
                };
                self.status_tx.send_replace(ModelStatus::Failed(reason));
                warn!(error = %e, "embedding model load failed");
                Err(e)
            }
        }
    }

    /// Clear a sticky load failure and try again.
    pub async fn retry_load(&self) -> Result<(), ModelLoadError> {
        {
            let _serial = self.load_lock.lock().await;
            if matches!(self.status(), ModelStatus::Failed(_)) {
                info!("retrying embedding model load");
                self.status_tx.send_replace(ModelStatus::NotLoaded);
            }
        }
        self.load().await
    }
}

#[async_trait]
impl Embedder for EmbedderGateway {
    fn is_ready(&self) -> bool {
        self.model.read().is_some()
    }

    async fn embed(&self, frame: &Frame) -> Result<Embedding, EmbedError> {
        let model = self.model.read().clone().ok_or(EmbedError::NotReady)?;
        let frame = frame.clone();
        let start = Instant::now();

        let values = tokio::task::spawn_blocking(move || {
            let input = preprocess::prepare(&frame, model.input_size())?;
            let values = model.infer(&input)?;
            if values.len() != model.dimension() {
                return Err(EmbedError::Inference(format!(
                    "model returned {} values, declared dimension is {}",
                    values.len(),
                    model.dimension()
                )));
            }
            Ok(values)
        })
        .await
        .map_err(|e| EmbedError::TaskFailed(e.to_string()))??;

        let embed_us = start.elapsed().as_micros() as f64;
        self.metrics.record(metric_names::EMBED_DONE, embed_us);
        debug!(dimension = values.len(), embed_us, "frame_embedded");
        Ok(Embedding::new(values))
    }
}
