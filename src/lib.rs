//! beforeafter: before/after camera capture with live visual-similarity scoring.
//!
//! The UI layer talks to a [`ComparatorSession`]; everything behind it
//! (camera acquisition, model loading, periodic scoring) runs on tokio tasks.

pub mod camera;
pub mod cancellation;
pub mod config;
pub mod embedder;
pub mod frame;
pub mod metrics;
pub mod scheduler;
pub mod session;
pub mod similarity;
pub mod state_machine;

pub use camera::{AcquireOutcome, CameraBackend, CameraError, FacingMode, FrameSource};
pub use config::ComparatorConfig;
pub use embedder::{Embedder, EmbedderGateway, EmbeddingModel, ModelLoader, PooledColorLoader};
pub use frame::{Frame, FrameError};
pub use session::{ComparatorSession, SessionSnapshot};
pub use similarity::{cosine_similarity, Embedding, ScoreBand, SimilarityScore};
pub use state_machine::{CapturePhase, CaptureState, Refusal};

use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "beforeafter=debug";

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// filter. Calling it twice is harmless; the second install is ignored.
pub fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);

    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
