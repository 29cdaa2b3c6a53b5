//! Comparator session: the boundary the UI layer talks to.
//!
//! Observables are watch channels (current value + change notification):
//! capture state, score, model-loading flag and the user-facing error text.
//! Commands are `capture_before`, `capture_after`, `reset` and
//! `switch_camera`. Only model-load and camera failures produce error text;
//! capture refusals come back as [`Refusal`] values for the UI to render as
//! disabled actions.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::camera::{
    AcquireOutcome, CameraBackend, CameraError, CameraSessionManager, FacingMode, FrameSource,
};
use crate::config::ComparatorConfig;
use crate::embedder::{Embedder, EmbedderGateway, ModelLoadError, ModelLoader};
use crate::metrics::MetricsRegistry;
use crate::scheduler::ScoringScheduler;
use crate::similarity::{display_percent, ScoreBand, SimilarityScore};
use crate::state_machine::{CapturePhase, CaptureState, Refusal, StateMachine};

/// Error text per source; the model error wins when both are set.
#[derive(Default)]
struct ErrorSlots {
    model: Option<String>,
    camera: Option<String>,
}

impl ErrorSlots {
    fn message(&self) -> Option<String> {
        self.model.clone().or_else(|| self.camera.clone())
    }
}

/// Serializable view of the session for the UI layer.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub phase: CapturePhase,
    pub before_frame: Option<u64>,
    pub after_frame: Option<u64>,
    pub score: Option<SimilarityScore>,
    pub score_percent: u8,
    pub band: ScoreBand,
    pub facing: FacingMode,
    pub mirrored: bool,
    pub model_loading: bool,
    pub error: Option<String>,
    pub can_capture_before: bool,
    pub can_capture_after: bool,
}

pub struct ComparatorSession {
    config: ComparatorConfig,
    state_machine: Arc<StateMachine>,
    gateway: Arc<EmbedderGateway>,
    camera: Arc<CameraSessionManager>,
    scheduler: Arc<ScoringScheduler>,
    metrics: Arc<MetricsRegistry>,
    errors: Mutex<ErrorSlots>,
    model_loading_tx: watch::Sender<bool>,
    error_tx: watch::Sender<Option<String>>,
}

impl ComparatorSession {
    pub fn new(
        config: ComparatorConfig,
        loader: Arc<dyn ModelLoader>,
        backend: Arc<dyn CameraBackend>,
    ) -> Self {
        let metrics = Arc::new(MetricsRegistry::new());
        let state_machine = Arc::new(StateMachine::new());
        let gateway = Arc::new(EmbedderGateway::new(loader, Arc::clone(&metrics)));
        let camera = Arc::new(CameraSessionManager::new(
            backend,
            config.camera.initial_facing,
            config.camera.aspect_ratio,
            Arc::clone(&metrics),
        ));
        let scheduler = Arc::new(ScoringScheduler::new(
            Arc::clone(&state_machine),
            Arc::clone(&gateway) as Arc<dyn Embedder>,
            Arc::clone(&camera) as Arc<dyn FrameSource>,
            Arc::clone(&metrics),
            config.scoring.clone(),
        ));
        // The model is pending from construction until the first load resolves.
        let (model_loading_tx, _) = watch::channel(true);
        let (error_tx, _) = watch::channel(None);

        Self {
            config,
            state_machine,
            gateway,
            camera,
            scheduler,
            metrics,
            errors: Mutex::new(ErrorSlots::default()),
            model_loading_tx,
            error_tx,
        }
    }

    /// Load the model and acquire the initial camera stream concurrently.
    /// Failures are surfaced through `error_message`, not returned.
    pub async fn start(&self) {
        info!(
            facing = %self.camera.facing(),
            interval_ms = self.config.scoring.interval.as_millis() as u64,
            "comparator session starting"
        );
        let (model, camera) = tokio::join!(self.load_model(), self.acquire_camera());
        debug!(model_ok = model.is_ok(), camera_ok = camera.is_ok(), "comparator session started");
    }

    pub async fn load_model(&self) -> Result<(), ModelLoadError> {
        self.model_loading_tx.send_replace(true);
        let result = self.gateway.load().await;
        self.finish_model_load(&result);
        result
    }

    /// Explicit retry after a failed load.
    pub async fn retry_model_load(&self) -> Result<(), ModelLoadError> {
        self.model_loading_tx.send_replace(true);
        let result = self.gateway.retry_load().await;
        self.finish_model_load(&result);
        result
    }

    fn finish_model_load(&self, result: &Result<(), ModelLoadError>) {
        self.model_loading_tx.send_replace(false);
        let message = result
            .as_ref()
            .err()
            .map(|e| format!("Failed to load the similarity model: {e}"));
        self.set_error(|slots| slots.model = message);
    }

    /// (Re)acquire the stream for the current facing mode.
    pub async fn acquire_camera(&self) -> Result<AcquireOutcome, CameraError> {
        let result = self.camera.acquire().await;
        self.finish_camera(&result);
        result
    }

    /// Flip front/back. Capture state and scoring are left alone; ticks that
    /// land while the new stream comes up are skipped.
    pub async fn switch_camera(&self) -> Result<AcquireOutcome, CameraError> {
        let result = self.camera.switch().await;
        self.finish_camera(&result);
        result
    }

    fn finish_camera(&self, result: &Result<AcquireOutcome, CameraError>) {
        match result {
            Ok(AcquireOutcome::Acquired(_)) => self.set_error(|slots| slots.camera = None),
            Ok(AcquireOutcome::Superseded) => {}
            Err(e) => {
                let message = format!("Could not access the {} camera: {e}", self.camera.facing());
                self.set_error(|slots| slots.camera = Some(message));
            }
        }
    }

    fn set_error(&self, update: impl FnOnce(&mut ErrorSlots)) {
        let mut slots = self.errors.lock();
        update(&mut slots);
        let message = slots.message();
        if *self.error_tx.borrow() != message {
            if let Some(ref text) = message {
                warn!(error = %text, "user-facing error");
            }
            self.error_tx.send_replace(message);
        }
    }

    // --- Commands ---

    /// Freeze the current live frame as the before reference and start scoring.
    pub fn capture_before(&self) -> Result<(), Refusal> {
        if !self.state_machine.can_capture_before() {
            return Err(self.refuse("capture_before", Refusal::BeforeAlreadyCaptured));
        }
        if !self.gateway.is_ready() {
            return Err(self.refuse("capture_before", Refusal::EmbedderNotReady));
        }
        let frame = self
            .camera
            .current_frame()
            .ok_or_else(|| self.refuse("capture_before", Refusal::NoLiveFrame))?;

        let guard = self.state_machine.capture_before(frame.clone())?;
        self.scheduler.start(guard, frame);
        Ok(())
    }

    /// Freeze the current live frame as the after frame. Periodic scoring stops
    /// inside the transition; one final before-vs-after score follows.
    pub fn capture_after(&self) -> Result<(), Refusal> {
        match self.state_machine.phase() {
            CapturePhase::Live => return Err(self.refuse("capture_after", Refusal::NoBeforeFrame)),
            CapturePhase::AfterCaptured => {
                return Err(self.refuse("capture_after", Refusal::AlreadyFrozen))
            }
            CapturePhase::BeforeCaptured => {}
        }
        if !self.gateway.is_ready() {
            return Err(self.refuse("capture_after", Refusal::EmbedderNotReady));
        }
        let frame = self
            .camera
            .current_frame()
            .ok_or_else(|| self.refuse("capture_after", Refusal::NoLiveFrame))?;

        let (before, guard) = self.state_machine.capture_after(frame.clone())?;
        self.scheduler.score_final(guard, before, frame);
        Ok(())
    }

    /// Back to Live from anywhere. Never refused.
    pub fn reset(&self) {
        self.state_machine.reset();
    }

    fn refuse(&self, command: &'static str, reason: Refusal) -> Refusal {
        debug!(command, reason = %reason, "command refused");
        reason
    }

    // --- Observables ---

    pub fn state(&self) -> CaptureState {
        self.state_machine.current()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<CaptureState> {
        self.state_machine.subscribe()
    }

    pub fn score(&self) -> SimilarityScore {
        self.state_machine.score()
    }

    pub fn subscribe_score(&self) -> watch::Receiver<SimilarityScore> {
        self.state_machine.subscribe_score()
    }

    pub fn score_band(&self) -> ScoreBand {
        self.config.scoring.bands.classify(self.score())
    }

    pub fn is_model_loading(&self) -> bool {
        *self.model_loading_tx.borrow()
    }

    pub fn subscribe_model_loading(&self) -> watch::Receiver<bool> {
        self.model_loading_tx.subscribe()
    }

    pub fn error_message(&self) -> Option<String> {
        self.error_tx.borrow().clone()
    }

    pub fn subscribe_error(&self) -> watch::Receiver<Option<String>> {
        self.error_tx.subscribe()
    }

    pub fn facing_mode(&self) -> FacingMode {
        self.camera.facing()
    }

    pub fn is_mirrored(&self) -> bool {
        self.camera.facing().is_mirrored()
    }

    pub fn can_capture_before(&self) -> bool {
        self.state_machine.can_capture_before()
            && self.gateway.is_ready()
            && self.camera.has_stream()
    }

    pub fn can_capture_after(&self) -> bool {
        self.state_machine.can_capture_after()
            && self.gateway.is_ready()
            && self.camera.has_stream()
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state();
        let score = state.last_score();
        let shown = self.score();
        SessionSnapshot {
            phase: state.phase(),
            before_frame: state.before().map(|f| f.id()),
            after_frame: state.after().map(|f| f.id()),
            score: score.filter(|s| !s.is_nan()),
            score_percent: display_percent(shown),
            band: self.config.scoring.bands.classify(shown),
            facing: self.facing_mode(),
            mirrored: self.is_mirrored(),
            model_loading: self.is_model_loading(),
            error: self.error_message(),
            can_capture_before: self.can_capture_before(),
            can_capture_after: self.can_capture_after(),
        }
    }

    pub fn snapshot_json(&self) -> serde_json::Value {
        serde_json::to_value(self.snapshot()).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::testing::{ScriptedBackend, StaticSource};
    use crate::embedder::preprocess::ModelInput;
    use crate::embedder::{EmbedError, EmbeddingModel};
    use crate::frame::Frame;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Embeds a frame as the (red, green) of its top-left pixel.
    struct RedGreenModel;

    impl EmbeddingModel for RedGreenModel {
        fn input_size(&self) -> u32 {
            8
        }
        fn dimension(&self) -> usize {
            2
        }
        fn infer(&self, input: &ModelInput) -> Result<Vec<f32>, EmbedError> {
            let [r, g, _] = input.pixel(0, 0);
            Ok(vec![r, g])
        }
    }

    struct TestLoader {
        attempts: AtomicUsize,
        failures: usize,
    }

    #[async_trait]
    impl ModelLoader for TestLoader {
        async fn load(&self) -> Result<Arc<dyn EmbeddingModel>, ModelLoadError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                return Err(ModelLoadError::Load("network unreachable".into()));
            }
            Ok(Arc::new(RedGreenModel))
        }
    }

    fn red() -> Frame {
        Frame::solid(6, 4, [255, 0, 0, 255]).unwrap()
    }

    fn green() -> Frame {
        Frame::solid(6, 4, [0, 255, 0, 255]).unwrap()
    }

    fn olive() -> Frame {
        // (0.6, 0.8) after normalization.
        Frame::solid(6, 4, [153, 204, 0, 255]).unwrap()
    }

    struct Fixture {
        session: ComparatorSession,
        source: Arc<StaticSource>,
    }

    fn fixture(model_failures: usize, camera: Vec<Result<(), CameraError>>) -> Fixture {
        let source = StaticSource::new(Some(red()));
        let script = camera
            .into_iter()
            .map(|r| {
                let r = r.map(|_| source.clone() as Arc<dyn FrameSource>);
                (Duration::ZERO, r)
            })
            .collect();
        let mut config = ComparatorConfig::default();
        config.scoring.interval = Duration::from_millis(20);
        let session = ComparatorSession::new(
            config,
            Arc::new(TestLoader {
                attempts: AtomicUsize::new(0),
                failures: model_failures,
            }),
            ScriptedBackend::new(script),
        );
        Fixture { session, source }
    }

    async fn wait_state(
        session: &ComparatorSession,
        pred: impl FnMut(&CaptureState) -> bool,
    ) -> CaptureState {
        let mut rx = session.subscribe_state();
        let state = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(pred))
            .await
            .expect("state not reached")
            .unwrap()
            .clone();
        state
    }

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-5
    }

    #[tokio::test]
    async fn model_load_failure_refuses_captures_until_retry() {
        let fx = fixture(1, vec![Ok(())]);
        fx.session.start().await;

        assert!(!fx.session.is_model_loading());
        let message = fx.session.error_message().unwrap();
        assert!(message.contains("network unreachable"), "{message}");
        assert_eq!(fx.session.capture_before(), Err(Refusal::EmbedderNotReady));
        assert_eq!(fx.session.capture_after(), Err(Refusal::NoBeforeFrame));
        assert!(!fx.session.can_capture_before());
        assert_eq!(fx.session.state(), CaptureState::Live);

        fx.session.retry_model_load().await.unwrap();
        assert_eq!(fx.session.error_message(), None);
        assert!(fx.session.can_capture_before());
        fx.session.capture_before().unwrap();
    }

    #[tokio::test]
    async fn model_is_reported_loading_until_first_load_resolves() {
        let fx = fixture(0, vec![Ok(())]);
        let mut rx = fx.session.subscribe_model_loading();
        assert!(*rx.borrow_and_update());
        assert!(fx.session.snapshot().model_loading);
        assert_eq!(fx.session.error_message(), None);

        fx.session.load_model().await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert!(!*rx.borrow_and_update());
        assert!(!fx.session.snapshot().model_loading);
    }

    #[tokio::test]
    async fn before_after_reset_flow() {
        let fx = fixture(0, vec![Ok(())]);
        fx.session.start().await;
        assert!(fx.session.can_capture_before());
        assert!(!fx.session.can_capture_after());

        fx.session.capture_before().unwrap();
        let state = wait_state(&fx.session, |s| s.last_score().is_some()).await;
        assert!(close(state.last_score().unwrap(), 1.0));
        assert_eq!(fx.session.score_band(), ScoreBand::High);

        fx.source.set(green());
        wait_state(&fx.session, |s| s.last_score().is_some_and(|v| close(v, 0.0))).await;
        assert_eq!(fx.session.score_band(), ScoreBand::Low);

        fx.source.set(olive());
        wait_state(&fx.session, |s| s.last_score().is_some_and(|v| close(v, 0.6))).await;
        assert_eq!(fx.session.score_band(), ScoreBand::Medium);

        assert!(fx.session.can_capture_after());
        fx.session.capture_after().unwrap();
        let frozen = wait_state(&fx.session, |s| {
            s.phase() == CapturePhase::AfterCaptured && s.last_score().is_some()
        })
        .await;
        assert!(close(frozen.last_score().unwrap(), 0.6));
        assert!(frozen.after().is_some());
        assert!(!fx.session.can_capture_before());
        assert!(!fx.session.can_capture_after());

        fx.session.reset();
        assert_eq!(fx.session.state(), CaptureState::Live);
        assert_eq!(fx.session.score(), 0.0);
    }

    #[tokio::test]
    async fn second_capture_before_is_a_no_op() {
        let fx = fixture(0, vec![Ok(())]);
        fx.session.start().await;
        fx.session.capture_before().unwrap();
        let first = fx.session.state().before().cloned().unwrap();

        fx.source.set(green());
        assert_eq!(fx.session.capture_before(), Err(Refusal::BeforeAlreadyCaptured));
        assert_eq!(fx.session.state().before(), Some(&first));
    }

    #[tokio::test]
    async fn capture_after_from_live_is_a_no_op() {
        let fx = fixture(0, vec![Ok(())]);
        fx.session.start().await;
        assert_eq!(fx.session.capture_after(), Err(Refusal::NoBeforeFrame));
        assert_eq!(fx.session.state(), CaptureState::Live);
    }

    #[tokio::test]
    async fn camera_failure_surfaces_and_switch_recovers() {
        let fx = fixture(0, vec![Err(CameraError::PermissionDenied), Ok(())]);
        fx.session.start().await;

        let message = fx.session.error_message().unwrap();
        assert!(message.contains("back camera"), "{message}");
        assert_eq!(fx.session.capture_before(), Err(Refusal::NoLiveFrame));

        let outcome = fx.session.switch_camera().await.unwrap();
        assert_eq!(outcome, AcquireOutcome::Acquired(FacingMode::Front));
        assert_eq!(fx.session.error_message(), None);
        assert!(fx.session.is_mirrored());
        fx.session.capture_before().unwrap();
    }

    #[tokio::test]
    async fn switching_camera_keeps_capture_state() {
        let fx = fixture(0, vec![Ok(()), Ok(())]);
        fx.session.start().await;
        fx.session.capture_before().unwrap();
        let before = fx.session.state().before().cloned();

        fx.session.switch_camera().await.unwrap();
        assert_eq!(fx.session.state().phase(), CapturePhase::BeforeCaptured);
        assert_eq!(fx.session.state().before().cloned(), before);
        assert_eq!(fx.session.facing_mode(), FacingMode::Front);
    }

    #[tokio::test]
    async fn model_error_takes_precedence_over_camera_error() {
        let fx = fixture(1, vec![Err(CameraError::Failed("busy".into()))]);
        fx.session.start().await;
        let message = fx.session.error_message().unwrap();
        assert!(message.starts_with("Failed to load the similarity model"), "{message}");
    }

    #[tokio::test]
    async fn snapshot_reflects_session() {
        let fx = fixture(0, vec![Ok(())]);
        fx.session.start().await;
        fx.session.capture_before().unwrap();
        wait_state(&fx.session, |s| s.last_score().is_some()).await;

        let json = fx.session.snapshot_json();
        assert_eq!(json["phase"], "BeforeCaptured");
        assert_eq!(json["band"], "high");
        assert_eq!(json["score_percent"], 100);
        assert_eq!(json["facing"], "back");
        assert_eq!(json["mirrored"], false);
        assert_eq!(json["can_capture_after"], true);
        assert!(json["after_frame"].is_null());
        assert!(json["error"].is_null());
    }
}
