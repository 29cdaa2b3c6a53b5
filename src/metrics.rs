//! In-process metrics: latency histograms over a sliding window of samples,
//! monotonic counters and a per-cycle trace id for log correlation.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

/// Samples kept per histogram; older samples fall out of the window.
pub const DEFAULT_WINDOW: usize = 1024;

/// Identifiers attached to every scoring cycle's tracing span.
#[derive(Debug, Clone)]
pub struct CycleIds {
    pub trace_id: String,
    pub generation: u64,
}

impl CycleIds {
    pub fn new(generation: u64) -> Self {
        Self {
            trace_id: uuid::Uuid::new_v4().to_string(),
            generation,
        }
    }
}

/// Measures from creation until [`finish`](Self::finish). Dropping it without
/// finishing records nothing, so failed operations stay out of the histogram.
pub struct TimingSpan {
    name: &'static str,
    start: Instant,
    registry: Arc<MetricsRegistry>,
}

impl TimingSpan {
    /// Record the elapsed time and return it in microseconds.
    pub fn finish(self) -> f64 {
        let elapsed_us = self.start.elapsed().as_micros() as f64;
        self.registry.record(self.name, elapsed_us);
        elapsed_us
    }
}

struct Histogram {
    window: VecDeque<f64>,
    limit: usize,
    total: u64,
}

impl Histogram {
    fn new(limit: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(limit.min(DEFAULT_WINDOW)),
            limit: limit.max(1),
            total: 0,
        }
    }

    fn push(&mut self, value: f64) {
        if self.window.len() == self.limit {
            self.window.pop_front();
        }
        self.window.push_back(value);
        self.total += 1;
    }

    fn sorted(&self) -> Vec<f64> {
        let mut values: Vec<f64> = self.window.iter().copied().collect();
        values.sort_by(f64::total_cmp);
        values
    }

    fn summarize(&self) -> HistogramSummary {
        let sorted = self.sorted();
        let mean = if sorted.is_empty() {
            0.0
        } else {
            sorted.iter().sum::<f64>() / sorted.len() as f64
        };
        HistogramSummary {
            samples: sorted.len(),
            total: self.total,
            min_us: sorted.first().copied().unwrap_or(0.0),
            max_us: sorted.last().copied().unwrap_or(0.0),
            mean_us: mean,
            p50_us: nearest_rank(&sorted, 50.0),
            p95_us: nearest_rank(&sorted, 95.0),
            p99_us: nearest_rank(&sorted, 99.0),
        }
    }
}

/// Nearest-rank percentile of an ascending slice; 0 when empty.
fn nearest_rank(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((p.clamp(0.0, 100.0) / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramSummary {
    /// Samples currently in the window.
    pub samples: usize,
    /// Samples ever recorded.
    pub total: u64,
    pub min_us: f64,
    pub max_us: f64,
    pub mean_us: f64,
    pub p50_us: f64,
    pub p95_us: f64,
    pub p99_us: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub histograms: BTreeMap<&'static str, HistogramSummary>,
    pub counters: BTreeMap<&'static str, u64>,
}

pub struct MetricsRegistry {
    histograms: Mutex<HashMap<&'static str, Histogram>>,
    counters: Mutex<HashMap<&'static str, u64>>,
    window: usize,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            histograms: Mutex::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
            window,
        }
    }

    /// Record one sample, in microseconds.
    pub fn record(&self, name: &'static str, value_us: f64) {
        self.histograms
            .lock()
            .entry(name)
            .or_insert_with(|| Histogram::new(self.window))
            .push(value_us);
        tracing::trace!(metric = name, value_us, "metric_recorded");
    }

    pub fn increment(&self, name: &'static str) {
        *self.counters.lock().entry(name).or_insert(0) += 1;
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.lock().get(name).copied().unwrap_or(0)
    }

    pub fn span(self: &Arc<Self>, name: &'static str) -> TimingSpan {
        TimingSpan {
            name,
            start: Instant::now(),
            registry: Arc::clone(self),
        }
    }

    /// Nearest-rank percentile (`p` in 0..=100) over the current window.
    pub fn percentile(&self, name: &str, p: f64) -> f64 {
        self.histograms
            .lock()
            .get(name)
            .map(|h| nearest_rank(&h.sorted(), p))
            .unwrap_or(0.0)
    }

    pub fn sample_count(&self, name: &str) -> usize {
        self.histograms.lock().get(name).map_or(0, |h| h.window.len())
    }

    pub fn summary(&self) -> MetricsSnapshot {
        let histograms = self
            .histograms
            .lock()
            .iter()
            .map(|(&name, h)| (name, h.summarize()))
            .collect();
        let counters = self
            .counters
            .lock()
            .iter()
            .map(|(&name, &v)| (name, v))
            .collect();
        MetricsSnapshot { histograms, counters }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub mod metric_names {
    pub const MODEL_LOAD: &str = "t_model_load";
    pub const EMBED_DONE: &str = "t_embed_done";
    pub const SCORING_CYCLE: &str = "t_scoring_cycle";
    pub const CAMERA_ACQUIRE: &str = "t_camera_acquire";
    pub const CYCLES_APPLIED: &str = "cycles_applied";
    pub const CYCLES_DROPPED: &str = "cycles_dropped";
    pub const CYCLES_STALE: &str = "cycles_stale";
    pub const TICKS_SKIPPED: &str = "ticks_skipped";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nearest_rank_percentiles() {
        let registry = MetricsRegistry::new();
        for v in 1..=100 {
            registry.record(metric_names::EMBED_DONE, v as f64);
        }
        assert_eq!(registry.percentile(metric_names::EMBED_DONE, 50.0), 50.0);
        assert_eq!(registry.percentile(metric_names::EMBED_DONE, 99.0), 99.0);
        assert_eq!(registry.percentile(metric_names::EMBED_DONE, 0.0), 1.0);
        assert_eq!(registry.percentile("missing", 50.0), 0.0);

        let summary = &registry.summary().histograms[metric_names::EMBED_DONE];
        assert_eq!(summary.samples, 100);
        assert_eq!(summary.min_us, 1.0);
        assert_eq!(summary.max_us, 100.0);
        assert_eq!(summary.mean_us, 50.5);
    }

    #[test]
    fn window_keeps_latest_samples() {
        let registry = MetricsRegistry::with_window(4);
        for v in [100.0, 1.0, 2.0, 3.0, 4.0] {
            registry.record(metric_names::SCORING_CYCLE, v);
        }
        assert_eq!(registry.sample_count(metric_names::SCORING_CYCLE), 4);
        assert_eq!(registry.percentile(metric_names::SCORING_CYCLE, 100.0), 4.0);
        let summary = &registry.summary().histograms[metric_names::SCORING_CYCLE];
        assert_eq!(summary.total, 5);
    }

    #[test]
    fn counters_and_spans() {
        let registry = Arc::new(MetricsRegistry::new());
        registry.increment(metric_names::CYCLES_DROPPED);
        registry.increment(metric_names::CYCLES_DROPPED);
        assert_eq!(registry.counter(metric_names::CYCLES_DROPPED), 2);
        assert_eq!(registry.counter(metric_names::CYCLES_APPLIED), 0);

        registry.span(metric_names::MODEL_LOAD).finish();
        drop(registry.span(metric_names::CAMERA_ACQUIRE));
        assert_eq!(registry.sample_count(metric_names::MODEL_LOAD), 1);
        assert_eq!(registry.sample_count(metric_names::CAMERA_ACQUIRE), 0);

        let json = serde_json::to_value(registry.summary()).unwrap();
        assert_eq!(json["counters"]["cycles_dropped"], 2);
        assert_eq!(json["histograms"]["t_model_load"]["samples"], 1);
    }
}
