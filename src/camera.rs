//! Camera session manager: facing-mode selection and stream (re)acquisition.
//!
//! Acquisition is asynchronous and may complete out of order when the user
//! switches cameras quickly. Each request takes a generation number; a result
//! that arrives after a newer request has started is dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::frame::Frame;
use crate::metrics::{metric_names, MetricsRegistry};

/// Which physical camera supplies the live stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    Front,
    Back,
}

impl FacingMode {
    pub fn toggled(self) -> Self {
        match self {
            FacingMode::Front => FacingMode::Back,
            FacingMode::Back => FacingMode::Front,
        }
    }

    /// Front camera previews are shown mirrored.
    pub fn is_mirrored(self) -> bool {
        matches!(self, FacingMode::Front)
    }
}

impl std::fmt::Display for FacingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FacingMode::Front => write!(f, "front"),
            FacingMode::Back => write!(f, "back"),
        }
    }
}

impl std::str::FromStr for FacingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "front" | "user" => Ok(FacingMode::Front),
            "back" | "environment" => Ok(FacingMode::Back),
            other => Err(format!("unknown facing mode: {other}")),
        }
    }
}

/// A live stream that can be sampled.
pub trait FrameSource: Send + Sync {
    /// Latest frame, or None if the stream has nothing to show yet.
    fn current_frame(&self) -> Option<Frame>;
}

/// Platform camera API.
#[async_trait]
pub trait CameraBackend: Send + Sync {
    async fn acquire(
        &self,
        facing: FacingMode,
        aspect_ratio: f64,
    ) -> Result<Arc<dyn FrameSource>, CameraError>;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CameraError {
    #[error("camera permission denied")]
    PermissionDenied,
    #[error("no {0} camera available")]
    NotFound(FacingMode),
    #[error("camera acquisition failed: {0}")]
    Failed(String),
}

/// What happened to an acquisition request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired(FacingMode),
    /// A newer request started while this one was in flight.
    Superseded,
}

pub struct CameraSessionManager {
    backend: Arc<dyn CameraBackend>,
    aspect_ratio: f64,
    facing: RwLock<FacingMode>,
    source: RwLock<Option<Arc<dyn FrameSource>>>,
    generation: AtomicU64,
    metrics: Arc<MetricsRegistry>,
}

impl CameraSessionManager {
    pub fn new(
        backend: Arc<dyn CameraBackend>,
        initial: FacingMode,
        aspect_ratio: f64,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            backend,
            aspect_ratio,
            facing: RwLock::new(initial),
            source: RwLock::new(None),
            generation: AtomicU64::new(0),
            metrics,
        }
    }

    pub fn facing(&self) -> FacingMode {
        *self.facing.read()
    }

    pub fn has_stream(&self) -> bool {
        self.source.read().is_some()
    }

    /// (Re)acquire a stream for the current facing mode.
    pub async fn acquire(&self) -> Result<AcquireOutcome, CameraError> {
        let facing = self.facing();
        self.acquire_for(facing).await
    }

    /// Flip front/back and reacquire. The old stream is dropped immediately so
    /// nothing samples it while the new one comes up.
    pub async fn switch(&self) -> Result<AcquireOutcome, CameraError> {
        let next = {
            let mut facing = self.facing.write();
            *facing = facing.toggled();
            *facing
        };
        info!(facing = %next, "camera_switch");
        self.acquire_for(next).await
    }

    async fn acquire_for(&self, facing: FacingMode) -> Result<AcquireOutcome, CameraError> {
        let generation = {
            let mut source = self.source.write();
            *source = None;
            self.generation.fetch_add(1, Ordering::SeqCst) + 1
        };

        let span = self.metrics.span(metric_names::CAMERA_ACQUIRE);
        let result = self.backend.acquire(facing, self.aspect_ratio).await;

        // Generation only advances under this lock.
        let mut source = self.source.write();
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!(generation, facing = %facing, "stale camera acquisition dropped");
            return Ok(AcquireOutcome::Superseded);
        }

        match result {
            Ok(stream) => {
                *source = Some(stream);
                drop(source);
                let acquire_us = span.finish();
                info!(facing = %facing, acquire_us, "camera stream acquired");
                Ok(AcquireOutcome::Acquired(facing))
            }
            Err(e) => {
                warn!(facing = %facing, error = %e, "camera acquisition failed");
                Err(e)
            }
        }
    }
}

impl FrameSource for CameraSessionManager {
    fn current_frame(&self) -> Option<Frame> {
        let source = self.source.read().clone()?;
        source.current_frame()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Frame source returning whatever frame was last set.
    pub struct StaticSource {
        pub frame: Mutex<Option<Frame>>,
        pub samples: AtomicU64,
    }

    impl StaticSource {
        pub fn new(frame: Option<Frame>) -> Arc<Self> {
            Arc::new(Self {
                frame: Mutex::new(frame),
                samples: AtomicU64::new(0),
            })
        }

        pub fn set(&self, frame: Frame) {
            *self.frame.lock() = Some(frame);
        }

        pub fn sample_count(&self) -> u64 {
            self.samples.load(Ordering::SeqCst)
        }
    }

    impl FrameSource for StaticSource {
        fn current_frame(&self) -> Option<Frame> {
            self.samples.fetch_add(1, Ordering::SeqCst);
            self.frame.lock().clone()
        }
    }

    /// Backend replaying scripted results, each after a scripted delay.
    pub struct ScriptedBackend {
        pub script: Mutex<VecDeque<(Duration, Result<Arc<dyn FrameSource>, CameraError>)>>,
        pub requests: Mutex<Vec<FacingMode>>,
    }

    impl ScriptedBackend {
        pub fn new(
            script: Vec<(Duration, Result<Arc<dyn FrameSource>, CameraError>)>,
        ) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CameraBackend for ScriptedBackend {
        async fn acquire(
            &self,
            facing: FacingMode,
            _aspect_ratio: f64,
        ) -> Result<Arc<dyn FrameSource>, CameraError> {
            self.requests.lock().push(facing);
            let next = self.script.lock().pop_front();
            match next {
                Some((delay, result)) => {
                    tokio::time::sleep(delay).await;
                    result
                }
                None => Err(CameraError::Failed("script exhausted".into())),
            }
        }
    }
}
