//! Scoring generations.
//!
//! Every capture transition starts a new generation: the previous generation's
//! token is cancelled and its number becomes stale. Work started under an old
//! generation can still finish computing, but it cannot publish.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

pub struct TaskGeneration {
    token: Mutex<CancellationToken>,
    counter: Arc<AtomicU64>,
}

impl TaskGeneration {
    pub fn new() -> Self {
        Self {
            token: Mutex::new(CancellationToken::new()),
            counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Cancel the running generation and start the next one.
    fn rotate(&self) -> (u64, CancellationToken) {
        let mut token = self.token.lock();
        token.cancel();
        *token = CancellationToken::new();
        let next = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        (next, token.clone())
    }

    /// Cancel outstanding work and return a guard for the work about to start.
    pub fn cancel_and_advance(&self) -> GenerationGuard {
        let (generation, token) = self.rotate();
        GenerationGuard {
            counter: Arc::clone(&self.counter),
            generation,
            token,
        }
    }

    /// Cancel outstanding work without starting anything new.
    pub fn cancel_all(&self) -> u64 {
        self.rotate().0
    }

    pub fn current_generation(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }
}

impl Default for TaskGeneration {
    fn default() -> Self {
        Self::new()
    }
}

/// Held by work started under one generation.
#[derive(Clone, Debug)]
pub struct GenerationGuard {
    counter: Arc<AtomicU64>,
    generation: u64,
    token: CancellationToken,
}

impl GenerationGuard {
    pub fn is_current(&self) -> bool {
        self.counter.load(Ordering::SeqCst) == self.generation
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn should_continue(&self) -> bool {
        !self.is_cancelled() && self.is_current()
    }

    /// Resolves once this generation has been superseded.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn my_generation(&self) -> u64 {
        self.generation
    }
}
