//! Arbiter Residual Detector - what the dimensions fail to explain
//!
//! Compares predicted quality against observed outcomes over tumbling
//! windows. When the unexplained share of outcome variance stays above φ⁻²,
//! the residual series is classified (spike, rising, stable-high) and the
//! dominant context tag among poorly-predicted tasks is surfaced as a
//! candidate for a new scoring dimension.

#![deny(unsafe_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use arbiter_types::phi::{fibonacci, EMERGENCE_THRESHOLD, PHI_INV_3};
use arbiter_types::TaskId;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub mod proposal;

pub use proposal::{vote_passes, DimensionProposal, ProposalBallot, ProposalId};

/// One prediction/outcome pair fed to the detector.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResidualObservation {
    pub task_id: TaskId,
    pub context_tags: Vec<String>,
    /// Predicted quality in [0, 1] (q-score / 100).
    pub predicted: f64,
    /// Observed reward in [0, 1].
    pub actual: f64,
}

/// Shape of the residual series across recent windows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResidualPattern {
    /// Latest window is an outlier against the rolling baseline (z ≥ 2).
    Spike,
    /// Regression slope of the series is at least φ⁻³ per window.
    Rising,
    /// At least five consecutive windows above φ⁻².
    StableHigh,
}

impl std::fmt::Display for ResidualPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResidualPattern::Spike => write!(f, "SPIKE"),
            ResidualPattern::Rising => write!(f, "RISING"),
            ResidualPattern::StableHigh => write!(f, "STABLE_HIGH"),
        }
    }
}

/// A window whose unexplained variance crossed the emergence threshold.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResidualFinding {
    pub window_id: u64,
    /// Share of outcome variance the dimension scores fail to explain.
    pub unexplained_variance: f64,
    /// In [0, 1]: how far above the φ⁻² threshold the window sits.
    pub severity: f64,
    pub pattern: Option<ResidualPattern>,
    /// Most common context tag among the worst-predicted tasks.
    pub dominant_tag: Option<String>,
    pub observations: usize,
}

/// Detector tuning. Defaults follow the φ ladder.
#[derive(Clone, Debug)]
pub struct ResidualConfig {
    /// Observations per tumbling window, F(8) = 21.
    pub window_size: usize,
    /// Unexplained-variance threshold, φ⁻².
    pub threshold: f64,
    /// Z-score that marks a spike.
    pub spike_z: f64,
    /// Per-window slope that marks a rising trend, φ⁻³.
    pub rising_slope: f64,
    /// Consecutive high windows that mark a stable-high regime.
    pub stable_high_run: usize,
    /// Windows of history kept for pattern classification.
    pub history: usize,
}

impl Default for ResidualConfig {
    fn default() -> Self {
        Self {
            window_size: fibonacci(8) as usize,
            threshold: EMERGENCE_THRESHOLD,
            spike_z: 2.0,
            rising_slope: PHI_INV_3,
            stable_high_run: 5,
            history: 34,
        }
    }
}

struct DetectorState {
    pending: Vec<ResidualObservation>,
    history: VecDeque<f64>,
    next_window_id: u64,
}

/// Tumbling-window residual detector.
pub struct ResidualDetector {
    config: ResidualConfig,
    state: Mutex<DetectorState>,
}

impl ResidualDetector {
    pub fn new(config: ResidualConfig) -> Self {
        Self {
            config,
            state: Mutex::new(DetectorState {
                pending: Vec::new(),
                history: VecDeque::new(),
                next_window_id: 0,
            }),
        }
    }

    /// Feed one observation. Returns a finding when this observation closes
    /// a window whose unexplained variance exceeds the threshold.
    pub fn observe(&self, observation: ResidualObservation) -> Option<ResidualFinding> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.pending.push(observation);
        if state.pending.len() < self.config.window_size {
            return None;
        }

        let window: Vec<ResidualObservation> = state.pending.drain(..).collect();
        let window_id = state.next_window_id;
        state.next_window_id += 1;

        let variance = unexplained_variance(&window);
        state.history.push_back(variance);
        if state.history.len() > self.config.history {
            state.history.pop_front();
        }

        debug!(
            window_id = window_id,
            unexplained_variance = variance,
            "Residual window closed"
        );

        if variance <= self.config.threshold {
            return None;
        }

        let series: Vec<f64> = state.history.iter().copied().collect();
        drop(state);

        let pattern = self.classify(&series);
        let dominant_tag = dominant_tag(&window);
        let severity =
            ((variance - self.config.threshold) / (1.0 - self.config.threshold)).clamp(0.0, 1.0);

        info!(
            window_id = window_id,
            unexplained_variance = variance,
            severity = severity,
            pattern = pattern.map(|p| p.to_string()).unwrap_or_default(),
            dominant_tag = dominant_tag.as_deref().unwrap_or(""),
            "Residual above emergence threshold"
        );

        Some(ResidualFinding {
            window_id,
            unexplained_variance: variance,
            severity,
            pattern,
            dominant_tag,
            observations: window.len(),
        })
    }

    /// Classify the residual series. Precedence: a fresh spike outranks a
    /// trend, a trend outranks a persistent plateau.
    fn classify(&self, series: &[f64]) -> Option<ResidualPattern> {
        if series.len() >= 3 {
            let (latest, baseline) = series.split_last().map(|(l, r)| (*l, r))?;
            let mean = baseline.iter().sum::<f64>() / baseline.len() as f64;
            let var =
                baseline.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / baseline.len() as f64;
            let std = var.sqrt();
            if std > 1e-9 && (latest - mean) / std >= self.config.spike_z {
                return Some(ResidualPattern::Spike);
            }
        }

        if series.len() >= 3 && slope(series) >= self.config.rising_slope {
            return Some(ResidualPattern::Rising);
        }

        if series.len() >= self.config.stable_high_run
            && series
                .iter()
                .rev()
                .take(self.config.stable_high_run)
                .all(|v| *v > self.config.threshold)
        {
            return Some(ResidualPattern::StableHigh);
        }

        None
    }
}

impl Default for ResidualDetector {
    fn default() -> Self {
        Self::new(ResidualConfig::default())
    }
}

/// Share of outcome variance not explained by the predictions, in [0, 1].
fn unexplained_variance(window: &[ResidualObservation]) -> f64 {
    let n = window.len() as f64;
    let mean_actual = window.iter().map(|o| o.actual).sum::<f64>() / n;

    let sse: f64 = window.iter().map(|o| (o.actual - o.predicted).powi(2)).sum();
    let sst: f64 = window
        .iter()
        .map(|o| (o.actual - mean_actual).powi(2))
        .sum();

    if sst < 1e-12 {
        // Constant outcomes: any prediction error is fully unexplained.
        if sse / n > 1e-12 {
            1.0
        } else {
            0.0
        }
    } else {
        (sse / sst).clamp(0.0, 1.0)
    }
}

/// Most frequent context tag among observations with above-mean error.
fn dominant_tag(window: &[ResidualObservation]) -> Option<String> {
    let mean_error = window
        .iter()
        .map(|o| (o.actual - o.predicted).abs())
        .sum::<f64>()
        / window.len() as f64;

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for obs in window {
        if (obs.actual - obs.predicted).abs() < mean_error {
            continue;
        }
        for tag in &obs.context_tags {
            *counts.entry(tag.as_str()).or_insert(0) += 1;
        }
    }

    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(a.0)))
        .map(|(tag, _)| tag.to_string())
}

/// Ordinary least squares slope of a series against its index.
fn slope(series: &[f64]) -> f64 {
    let n = series.len() as f64;
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = series.iter().sum::<f64>() / n;

    let mut num = 0.0;
    let mut den = 0.0;
    for (i, y) in series.iter().enumerate() {
        let dx = i as f64 - mean_x;
        num += dx * (y - mean_y);
        den += dx * dx;
    }
    if den < 1e-12 {
        0.0
    } else {
        num / den
    }
}
