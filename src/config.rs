//! Runtime configuration. Every field has a default and can be overridden
//! from the environment.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::camera::FacingMode;
use crate::similarity::ScoreBands;

/// Scoring cadence while a before frame is held.
pub const DEFAULT_SCORE_INTERVAL_MS: u64 = 300;
/// Shortest interval the scheduler will tick at.
pub const MIN_SCORE_INTERVAL: Duration = Duration::from_millis(1);
/// Square input resolution fed to the embedding model.
pub const DEFAULT_MODEL_INPUT_SIZE: u32 = 224;
/// Largest model input accepted from the environment.
pub const MAX_MODEL_INPUT_SIZE: u32 = 4096;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringConfig {
    #[serde(with = "millis")]
    pub interval: Duration,
    /// Embed the before frame once per reference instead of on every tick.
    pub cache_before_embedding: bool,
    pub bands: ScoreBands,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_SCORE_INTERVAL_MS),
            cache_before_embedding: false,
            bands: ScoreBands::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    pub initial_facing: FacingMode,
    /// Width / height requested from the camera.
    pub aspect_ratio: f64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            initial_facing: FacingMode::Back,
            aspect_ratio: 4.0 / 3.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub input_size: u32,
    /// Mosaic size of the built-in pooled colour model.
    pub pooled_grid: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            input_size: DEFAULT_MODEL_INPUT_SIZE,
            pooled_grid: 8,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComparatorConfig {
    pub scoring: ScoringConfig,
    pub camera: CameraConfig,
    pub model: ModelConfig,
    /// Emit logs as JSON lines.
    pub log_json: bool,
}

impl ComparatorConfig {
    /// Defaults overridden by `BEFOREAFTER_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(ms) = parse_var::<u64>(&lookup, "BEFOREAFTER_SCORE_INTERVAL_MS") {
            if ms == 0 {
                warn!("BEFOREAFTER_SCORE_INTERVAL_MS must be positive, keeping default");
            } else {
                cfg.scoring.interval = Duration::from_millis(ms);
            }
        }
        if let Some(v) = parse_var::<bool>(&lookup, "BEFOREAFTER_CACHE_BEFORE_EMBEDDING") {
            cfg.scoring.cache_before_embedding = v;
        }
        if let Some(facing) = parse_var::<FacingMode>(&lookup, "BEFOREAFTER_FACING") {
            cfg.camera.initial_facing = facing;
        }
        if let Some(ratio) = parse_var::<f64>(&lookup, "BEFOREAFTER_ASPECT_RATIO") {
            if ratio.is_finite() && ratio > 0.0 {
                cfg.camera.aspect_ratio = ratio;
            } else {
                warn!(ratio, "BEFOREAFTER_ASPECT_RATIO must be positive, keeping default");
            }
        }
        if let Some(size) = parse_var::<u32>(&lookup, "BEFOREAFTER_MODEL_INPUT_SIZE") {
            if size == 0 {
                warn!("BEFOREAFTER_MODEL_INPUT_SIZE must be positive, keeping default");
            } else if size > MAX_MODEL_INPUT_SIZE {
                warn!(
                    size,
                    max = MAX_MODEL_INPUT_SIZE,
                    "BEFOREAFTER_MODEL_INPUT_SIZE too large, capping"
                );
                cfg.model.input_size = MAX_MODEL_INPUT_SIZE;
            } else {
                cfg.model.input_size = size;
            }
        }
        if let Some(v) = parse_var::<bool>(&lookup, "BEFOREAFTER_LOG_JSON") {
            cfg.log_json = v;
        }

        cfg
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(key, value = %raw, error = %e, "ignoring invalid config value");
            None
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        match u64::deserialize(d)? {
            0 => Err(serde::de::Error::custom("interval must be at least 1 ms")),
            ms => Ok(Duration::from_millis(ms)),
        }
    }
}
