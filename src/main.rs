//! Headless demo: drives a comparator session against a synthetic camera
//! whose scene drifts over time, logging every score until the after capture.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{info, warn};

use beforeafter::camera::{CameraBackend, CameraError, FacingMode, FrameSource};
use beforeafter::similarity::display_percent;
use beforeafter::{init_tracing, ComparatorConfig, ComparatorSession, Frame, PooledColorLoader};

const DEMO_WIDTH: u32 = 96;
const SCORING_WINDOW: Duration = Duration::from_secs(3);

/// Gradient background with a bright square sliding left to right.
struct DriftingScene {
    width: u32,
    height: u32,
    started: Instant,
    tint: u8,
}

impl DriftingScene {
    fn render(&self) -> Option<Frame> {
        let t = self.started.elapsed().as_secs_f32();
        let side = self.height / 3;
        let travel = self.width.saturating_sub(side).max(1) as f32;
        let square_x = ((t * 0.25).fract() * travel) as u32;
        let square_y = self.height / 3;

        let mut rgba = Vec::with_capacity((self.width * self.height * 4) as usize);
        for y in 0..self.height {
            for x in 0..self.width {
                let inside = (square_x..square_x + side).contains(&x)
                    && (square_y..square_y + side).contains(&y);
                if inside {
                    rgba.extend_from_slice(&[250, 250, 250, 255]);
                } else {
                    let r = (x * 255 / self.width) as u8;
                    let g = (y * 255 / self.height) as u8;
                    rgba.extend_from_slice(&[r, g, self.tint, 255]);
                }
            }
        }
        match Frame::from_rgba(self.width, self.height, rgba) {
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!(error = %e, "synthetic frame rejected");
                None
            }
        }
    }
}

impl FrameSource for DriftingScene {
    fn current_frame(&self) -> Option<Frame> {
        self.render()
    }
}

struct SyntheticCamera;

#[async_trait]
impl CameraBackend for SyntheticCamera {
    async fn acquire(
        &self,
        facing: FacingMode,
        aspect_ratio: f64,
    ) -> Result<Arc<dyn FrameSource>, CameraError> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let height = ((DEMO_WIDTH as f64 / aspect_ratio).round() as u32).max(3);
        let tint = match facing {
            FacingMode::Back => 40,
            FacingMode::Front => 160,
        };
        Ok(Arc::new(DriftingScene {
            width: DEMO_WIDTH,
            height,
            started: Instant::now(),
            tint,
        }))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ComparatorConfig::from_env();
    init_tracing(config.log_json);
    let rendered = serde_json::to_string(&config)?;
    info!(config = %rendered, "beforeafter demo starting");

    let loader = Arc::new(PooledColorLoader {
        grid: config.model.pooled_grid,
        input_size: config.model.input_size,
    });
    let session = ComparatorSession::new(config, loader, Arc::new(SyntheticCamera));
    session.start().await;
    if let Some(message) = session.error_message() {
        warn!(error = %message, "session not usable");
        return Ok(());
    }

    session
        .capture_before()
        .map_err(|r| format!("capture before refused: {r}"))?;

    let mut scores = session.subscribe_score();
    let window = tokio::time::sleep(SCORING_WINDOW);
    tokio::pin!(window);
    loop {
        tokio::select! {
            _ = &mut window => break,
            changed = scores.changed() => {
                if changed.is_err() {
                    break;
                }
                let score = *scores.borrow_and_update();
                info!(
                    score,
                    percent = display_percent(score),
                    band = %session.score_band(),
                    "live score"
                );
            }
        }
    }

    session
        .capture_after()
        .map_err(|r| format!("capture after refused: {r}"))?;
    let mut states = session.subscribe_state();
    let settled = tokio::time::timeout(
        Duration::from_secs(2),
        states.wait_for(|s| s.last_score().is_some()),
    )
    .await
    .is_ok();
    if !settled {
        warn!("final score did not arrive in time");
    }

    println!("{}", serde_json::to_string_pretty(&session.snapshot())?);
    println!("{}", serde_json::to_string_pretty(&session.metrics().summary())?);
    Ok(())
}
