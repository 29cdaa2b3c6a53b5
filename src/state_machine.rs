//! State machine: Live → BeforeCaptured → AfterCaptured, reset to Live from anywhere.
//! Owns the captured frames, the last score, and the scoring generation: every
//! transition cancels outstanding scoring work under the same lock that
//! changes the state, so no stale score can land after a freeze or reset.

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::cancellation::{GenerationGuard, TaskGeneration};
use crate::frame::Frame;
use crate::similarity::SimilarityScore;

/// The single source of truth for what the UI shows and whether scoring runs.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureState {
    Live,
    BeforeCaptured {
        before: Frame,
        last_score: Option<SimilarityScore>,
    },
    AfterCaptured {
        before: Frame,
        after: Frame,
        last_score: Option<SimilarityScore>,
    },
}

impl CaptureState {
    pub fn phase(&self) -> CapturePhase {
        match self {
            CaptureState::Live => CapturePhase::Live,
            CaptureState::BeforeCaptured { .. } => CapturePhase::BeforeCaptured,
            CaptureState::AfterCaptured { .. } => CapturePhase::AfterCaptured,
        }
    }

    pub fn before(&self) -> Option<&Frame> {
        match self {
            CaptureState::Live => None,
            CaptureState::BeforeCaptured { before, .. }
            | CaptureState::AfterCaptured { before, .. } => Some(before),
        }
    }

    pub fn after(&self) -> Option<&Frame> {
        match self {
            CaptureState::AfterCaptured { after, .. } => Some(after),
            _ => None,
        }
    }

    pub fn last_score(&self) -> Option<SimilarityScore> {
        match self {
            CaptureState::Live => None,
            CaptureState::BeforeCaptured { last_score, .. }
            | CaptureState::AfterCaptured { last_score, .. } => *last_score,
        }
    }
}

/// Fieldless view of [`CaptureState`] for logging and serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CapturePhase {
    Live,
    BeforeCaptured,
    AfterCaptured,
}

impl std::fmt::Display for CapturePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CapturePhase::Live => write!(f, "Live"),
            CapturePhase::BeforeCaptured => write!(f, "BeforeCaptured"),
            CapturePhase::AfterCaptured => write!(f, "AfterCaptured"),
        }
    }
}

/// Why a capture command was not applied. These are expected user-side
/// outcomes (a disabled button), not faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Refusal {
    BeforeAlreadyCaptured,
    NoBeforeFrame,
    AlreadyFrozen,
    EmbedderNotReady,
    NoLiveFrame,
}

impl std::fmt::Display for Refusal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Refusal::BeforeAlreadyCaptured => write!(f, "before frame already captured"),
            Refusal::NoBeforeFrame => write!(f, "no before frame captured"),
            Refusal::AlreadyFrozen => write!(f, "after frame already captured"),
            Refusal::EmbedderNotReady => write!(f, "embedding model not ready"),
            Refusal::NoLiveFrame => write!(f, "no live frame available"),
        }
    }
}

/// Thread-safe state machine with watch channels for reactive subscribers.
pub struct StateMachine {
    state: RwLock<CaptureState>,
    scoring: TaskGeneration,
    state_tx: watch::Sender<CaptureState>,
    score_tx: watch::Sender<SimilarityScore>,
}

impl StateMachine {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(CaptureState::Live);
        let (score_tx, _) = watch::channel(0.0);
        Self {
            state: RwLock::new(CaptureState::Live),
            scoring: TaskGeneration::new(),
            state_tx,
            score_tx,
        }
    }

    /// Current state (clone of the shared frames, no pixel copy).
    pub fn current(&self) -> CaptureState {
        self.state.read().clone()
    }

    pub fn phase(&self) -> CapturePhase {
        self.state.read().phase()
    }

    /// Most recently applied score; 0 after reset.
    pub fn score(&self) -> SimilarityScore {
        *self.score_tx.borrow()
    }

    pub fn can_capture_before(&self) -> bool {
        matches!(*self.state.read(), CaptureState::Live)
    }

    pub fn can_capture_after(&self) -> bool {
        matches!(*self.state.read(), CaptureState::BeforeCaptured { .. })
    }

    /// Live → BeforeCaptured. Returns the guard the periodic scorer runs under.
    pub fn capture_before(&self, frame: Frame) -> Result<GenerationGuard, Refusal> {
        let mut state = self.state.write();
        if !matches!(*state, CaptureState::Live) {
            debug!(phase = %state.phase(), "capture_before refused");
            return Err(Refusal::BeforeAlreadyCaptured);
        }
        let guard = self.scoring.cancel_and_advance();
        let frame_id = frame.id();
        *state = CaptureState::BeforeCaptured {
            before: frame,
            last_score: None,
        };
        self.state_tx.send_replace(state.clone());
        info!(
            from = %CapturePhase::Live,
            to = %CapturePhase::BeforeCaptured,
            frame_id,
            generation = guard.my_generation(),
            "state_transition"
        );
        Ok(guard)
    }

    /// BeforeCaptured → AfterCaptured. Cancels the periodic scorer before
    /// releasing the lock; returns the before frame and the guard for the
    /// one-shot final score.
    pub fn capture_after(&self, frame: Frame) -> Result<(Frame, GenerationGuard), Refusal> {
        let mut state = self.state.write();
        let before = match &*state {
            CaptureState::BeforeCaptured { before, .. } => before.clone(),
            CaptureState::Live => {
                debug!("capture_after refused: no before frame");
                return Err(Refusal::NoBeforeFrame);
            }
            CaptureState::AfterCaptured { .. } => {
                debug!("capture_after refused: already frozen");
                return Err(Refusal::AlreadyFrozen);
            }
        };
        let guard = self.scoring.cancel_and_advance();
        let frame_id = frame.id();
        *state = CaptureState::AfterCaptured {
            before: before.clone(),
            after: frame,
            last_score: None,
        };
        self.state_tx.send_replace(state.clone());
        info!(
            from = %CapturePhase::BeforeCaptured,
            to = %CapturePhase::AfterCaptured,
            frame_id,
            generation = guard.my_generation(),
            "state_transition"
        );
        Ok((before, guard))
    }

    /// Any state → Live. Drops both frames and zeroes the score.
    pub fn reset(&self) {
        let mut state = self.state.write();
        let prev = state.phase();
        let generation = self.scoring.cancel_all();
        *state = CaptureState::Live;
        self.state_tx.send_replace(CaptureState::Live);
        self.score_tx.send_replace(0.0);
        info!(from = %prev, generation, "reset");
    }

    /// Record a resolved score. Applied only if the guard's generation is still
    /// current, i.e. no transition happened since the work was started.
    pub fn apply_score(&self, guard: &GenerationGuard, score: SimilarityScore) -> bool {
        let mut state = self.state.write();
        if !guard.is_current() {
            debug!(
                generation = guard.my_generation(),
                current = self.scoring.current_generation(),
                "stale score discarded"
            );
            return false;
        }
        match &mut *state {
            CaptureState::BeforeCaptured { last_score, .. }
            | CaptureState::AfterCaptured { last_score, .. } => *last_score = Some(score),
            CaptureState::Live => return false,
        }
        self.state_tx.send_replace(state.clone());
        self.score_tx.send_replace(score);
        debug!(score, phase = %state.phase(), "score_applied");
        true
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<CaptureState> {
        self.state_tx.subscribe()
    }

    /// Subscribe to score updates.
    pub fn subscribe_score(&self) -> watch::Receiver<SimilarityScore> {
        self.score_tx.subscribe()
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> Frame {
        Frame::solid(4, 4, [128, 64, 32, 255]).unwrap()
    }

    #[test]
    fn full_cycle_and_reset() {
        let sm = StateMachine::new();
        assert_eq!(sm.phase(), CapturePhase::Live);

        let before = frame();
        let guard = sm.capture_before(before.clone()).unwrap();
        assert_eq!(sm.phase(), CapturePhase::BeforeCaptured);
        assert!(sm.apply_score(&guard, 0.42));
        assert_eq!(sm.score(), 0.42);
        assert_eq!(sm.current().last_score(), Some(0.42));

        let after = frame();
        let (returned_before, final_guard) = sm.capture_after(after.clone()).unwrap();
        assert_eq!(returned_before, before);
        assert!(guard.is_cancelled());
        let state = sm.current();
        assert_eq!(state.after(), Some(&after));
        assert_eq!(state.last_score(), None);
        assert!(sm.apply_score(&final_guard, 0.9));
        assert_eq!(sm.current().last_score(), Some(0.9));

        sm.reset();
        assert_eq!(sm.current(), CaptureState::Live);
        assert_eq!(sm.score(), 0.0);
        assert!(final_guard.is_cancelled());
    }

    #[test]
    fn second_capture_before_keeps_first_frame() {
        let sm = StateMachine::new();
        let first = frame();
        sm.capture_before(first.clone()).unwrap();
        assert_eq!(sm.capture_before(frame()).unwrap_err(), Refusal::BeforeAlreadyCaptured);
        assert_eq!(sm.current().before(), Some(&first));
    }

    #[test]
    fn capture_before_refused_when_frozen() {
        let sm = StateMachine::new();
        sm.capture_before(frame()).unwrap();
        sm.capture_after(frame()).unwrap();
        let snapshot = sm.current();
        assert_eq!(sm.capture_before(frame()).unwrap_err(), Refusal::BeforeAlreadyCaptured);
        assert_eq!(sm.current(), snapshot);
    }

    #[test]
    fn capture_after_refused_without_before_or_twice() {
        let sm = StateMachine::new();
        assert_eq!(sm.capture_after(frame()).unwrap_err(), Refusal::NoBeforeFrame);
        assert_eq!(sm.current(), CaptureState::Live);

        sm.capture_before(frame()).unwrap();
        let (_, _) = sm.capture_after(frame()).unwrap();
        let snapshot = sm.current();
        assert_eq!(sm.capture_after(frame()).unwrap_err(), Refusal::AlreadyFrozen);
        assert_eq!(sm.current(), snapshot);
    }

    #[test]
    fn reset_is_legal_from_every_phase() {
        let sm = StateMachine::new();
        sm.reset();
        assert_eq!(sm.current(), CaptureState::Live);

        let guard = sm.capture_before(frame()).unwrap();
        sm.apply_score(&guard, 0.8);
        sm.reset();
        assert_eq!(sm.current(), CaptureState::Live);
        assert_eq!(sm.score(), 0.0);
    }

    #[test]
    fn stale_guard_cannot_write_after_reset_and_recapture() {
        let sm = StateMachine::new();
        let old = sm.capture_before(frame()).unwrap();
        sm.reset();
        let fresh = sm.capture_before(frame()).unwrap();

        assert!(!sm.apply_score(&old, 0.99));
        assert_eq!(sm.current().last_score(), None);
        assert!(sm.apply_score(&fresh, 0.3));
        assert_eq!(sm.score(), 0.3);
    }

    #[test]
    fn tick_guard_cannot_write_into_frozen_state() {
        let sm = StateMachine::new();
        let tick = sm.capture_before(frame()).unwrap();
        sm.apply_score(&tick, 0.55);
        sm.capture_after(frame()).unwrap();
        assert!(!sm.apply_score(&tick, 0.1));
        assert_eq!(sm.score(), 0.55);
        assert_eq!(sm.current().last_score(), None);
    }

    #[test]
    fn subscribers_see_transitions() {
        let sm = StateMachine::new();
        let mut rx = sm.subscribe();
        sm.capture_before(frame()).unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().phase(), CapturePhase::BeforeCaptured);
        sm.reset();
        assert_eq!(rx.borrow_and_update().phase(), CapturePhase::Live);
    }
}
