//! Scoring scheduler: periodic before-vs-live comparison while BeforeCaptured,
//! plus the one-shot before-vs-after score when the after frame is frozen.
//!
//! Each tick samples the live source and spawns an independent scoring cycle;
//! cycles are not serialized against each other. Whichever cycle *completes*
//! last wins, provided its generation is still current when it resolves.
//! Every task here runs under a [`GenerationGuard`] issued by the state
//! machine, so a transition stops the ticker and all in-flight cycles at once.

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::camera::FrameSource;
use crate::cancellation::GenerationGuard;
use crate::config::{ScoringConfig, MIN_SCORE_INTERVAL};
use crate::embedder::{EmbedError, Embedder};
use crate::frame::Frame;
use crate::metrics::{metric_names, CycleIds, MetricsRegistry};
use crate::similarity::{cosine_similarity, DimensionMismatch, Embedding, SimilarityScore};
use crate::state_machine::StateMachine;

/// Why a scoring cycle produced no score.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Embed(#[from] EmbedError),
    #[error(transparent)]
    Dimension(#[from] DimensionMismatch),
}

/// Before-embedding shared by every cycle of one before reference.
type BeforeCache = Arc<OnceCell<Embedding>>;

pub struct ScoringScheduler {
    state_machine: Arc<StateMachine>,
    embedder: Arc<dyn Embedder>,
    frames: Arc<dyn FrameSource>,
    metrics: Arc<MetricsRegistry>,
    config: ScoringConfig,
}

impl ScoringScheduler {
    pub fn new(
        state_machine: Arc<StateMachine>,
        embedder: Arc<dyn Embedder>,
        frames: Arc<dyn FrameSource>,
        metrics: Arc<MetricsRegistry>,
        mut config: ScoringConfig,
    ) -> Self {
        if config.interval < MIN_SCORE_INTERVAL {
            warn!(
                interval_us = config.interval.as_micros() as u64,
                "score interval below minimum, clamping to 1 ms"
            );
            config.interval = MIN_SCORE_INTERVAL;
        }
        Self {
            state_machine,
            embedder,
            frames,
            metrics,
            config,
        }
    }

    /// Start ticking for `before`. The first tick fires one interval from now;
    /// the loop ends as soon as the guard's token is cancelled.
    pub fn start(self: &Arc<Self>, guard: GenerationGuard, before: Frame) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.run_ticker(guard, before).await })
    }

    /// Score `before` against the frozen `after` frame once.
    pub fn score_final(
        self: &Arc<Self>,
        guard: GenerationGuard,
        before: Frame,
        after: Frame,
    ) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        let span = info_span!(
            "final_score",
            generation = guard.my_generation(),
            after_id = after.id()
        );
        tokio::spawn(
            async move {
                scheduler.run_cycle(guard, before, after, None).await;
            }
            .instrument(span),
        )
    }

    async fn run_ticker(self: Arc<Self>, guard: GenerationGuard, before: Frame) {
        let period = self.config.interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let cache: Option<BeforeCache> = self
            .config
            .cache_before_embedding
            .then(|| Arc::new(OnceCell::new()));

        info!(
            generation = guard.my_generation(),
            before_id = before.id(),
            interval_ms = period.as_millis() as u64,
            "scoring loop started"
        );

        loop {
            tokio::select! {
                biased;
                _ = guard.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if !guard.should_continue() {
                break;
            }

            let Some(current) = self.frames.current_frame() else {
                self.metrics.increment(metric_names::TICKS_SKIPPED);
                debug!("tick skipped: no live frame");
                continue;
            };

            let ids = CycleIds::new(guard.my_generation());
            let span = info_span!(
                "scoring_cycle",
                trace_id = %ids.trace_id,
                generation = ids.generation,
                frame_id = current.id()
            );
            let scheduler = Arc::clone(&self);
            let cycle_guard = guard.clone();
            let before = before.clone();
            let cache = cache.clone();
            tokio::spawn(
                async move {
                    scheduler.run_cycle(cycle_guard, before, current, cache).await;
                }
                .instrument(span),
            );
        }

        info!(generation = guard.my_generation(), "scoring loop stopped");
    }

    async fn run_cycle(
        &self,
        guard: GenerationGuard,
        before: Frame,
        current: Frame,
        cache: Option<BeforeCache>,
    ) {
        let start = Instant::now();
        let result = tokio::select! {
            biased;
            _ = guard.cancelled() => {
                self.metrics.increment(metric_names::CYCLES_STALE);
                debug!("scoring cycle cancelled");
                return;
            }
            r = self.score_pair(&before, &current, cache.as_deref()) => r,
        };

        match result {
            Ok(score) => {
                if self.state_machine.apply_score(&guard, score) {
                    let cycle_us = start.elapsed().as_micros() as f64;
                    self.metrics.record(metric_names::SCORING_CYCLE, cycle_us);
                    self.metrics.increment(metric_names::CYCLES_APPLIED);
                    debug!(
                        score,
                        band = %self.config.bands.classify(score),
                        cycle_us,
                        "scoring cycle complete"
                    );
                } else {
                    self.metrics.increment(metric_names::CYCLES_STALE);
                }
            }
            Err(CycleError::Embed(EmbedError::NotReady)) => {
                self.metrics.increment(metric_names::CYCLES_DROPPED);
                debug!("scoring cycle dropped: embedder not ready");
            }
            Err(CycleError::Embed(e)) => {
                self.metrics.increment(metric_names::CYCLES_DROPPED);
                warn!(error = %e, "scoring cycle dropped");
            }
            Err(CycleError::Dimension(e)) => {
                self.metrics.increment(metric_names::CYCLES_DROPPED);
                error!(error = %e, "scoring cycle dropped: embedder produced mismatched vectors");
            }
        }
    }

    async fn score_pair(
        &self,
        before: &Frame,
        current: &Frame,
        cache: Option<&OnceCell<Embedding>>,
    ) -> Result<SimilarityScore, CycleError> {
        let (before_emb, current_emb) = match cache {
            Some(cell) => {
                let (b, c) = tokio::join!(
                    cell.get_or_try_init(|| self.embedder.embed(before)),
                    self.embedder.embed(current)
                );
                (b?.clone(), c?)
            }
            None => tokio::try_join!(self.embedder.embed(before), self.embedder.embed(current))?,
        };
        Ok(cosine_similarity(&before_emb, &current_emb)?)
    }
}
