//! Confidence calibration monitor.
//!
//! Consumes (stated confidence, eventual correctness) pairs over a rolling
//! window and watches for drift: confidence running systematically above
//! observed accuracy. Drift tightens the router's exploration floor; it is
//! never surfaced as an error.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use arbiter_router::ExplorationControl;
use arbiter_types::phi::{fibonacci, PHI_INV_3, PHI_INV_4};
use std::sync::Arc;
use tracing::{debug, warn};

const ECE_BINS: usize = 10;

/// Monitor tuning.
#[derive(Clone, Debug)]
pub struct CalibrationConfig {
    /// Rolling window capacity.
    pub window: usize,
    /// Samples required before drift is acted on.
    pub min_samples: usize,
    /// Overconfidence (mean confidence minus accuracy) that counts as drift.
    pub drift_threshold: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            window: 100,
            min_samples: fibonacci(8) as usize,
            drift_threshold: PHI_INV_3,
        }
    }
}

/// Point-in-time calibration summary.
#[derive(Clone, Copy, Debug, Default)]
pub struct CalibrationReport {
    pub samples: usize,
    pub brier_score: f64,
    pub ece: f64,
    /// Mean confidence minus accuracy; positive means overconfident.
    pub drift: f64,
}

/// Rolling calibration monitor wired to the exploration floor.
pub struct CalibrationMonitor {
    config: CalibrationConfig,
    window: Mutex<VecDeque<(f64, bool)>>,
    exploration: Arc<ExplorationControl>,
}

impl CalibrationMonitor {
    pub fn new(config: CalibrationConfig, exploration: Arc<ExplorationControl>) -> Self {
        Self {
            config,
            window: Mutex::new(VecDeque::new()),
            exploration,
        }
    }

    /// Record one (confidence, correctness) pair and react to drift.
    pub fn record(&self, confidence: f64, correct: bool) {
        let report = {
            let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
            window.push_back((confidence.clamp(0.0, 1.0), correct));
            if window.len() > self.config.window {
                window.pop_front();
            }
            if window.len() < self.config.min_samples {
                return;
            }
            Self::summarize(window.make_contiguous())
        };

        if report.drift > self.config.drift_threshold {
            // Overconfident: widen exploration proportionally to the drift.
            let target = PHI_INV_4 + report.drift * (PHI_INV_3 - PHI_INV_4);
            warn!(
                drift = report.drift,
                brier = report.brier_score,
                ece = report.ece,
                floor = target,
                "Calibration drift detected, tightening exploration floor"
            );
            self.exploration.tighten(target);
        } else if report.drift <= 0.0 {
            debug!(drift = report.drift, "Calibration healthy, relaxing exploration floor");
            self.exploration.relax();
        }
    }

    /// Current window summary.
    pub fn report(&self) -> CalibrationReport {
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        if window.is_empty() {
            return CalibrationReport::default();
        }
        Self::summarize(window.make_contiguous())
    }

    fn summarize(samples: &[(f64, bool)]) -> CalibrationReport {
        let n = samples.len() as f64;
        let mut brier = 0.0;
        let mut conf_sum = 0.0;
        let mut correct_sum = 0.0;
        let mut bins = [(0usize, 0.0f64, 0.0f64); ECE_BINS];

        for &(confidence, correct) in samples {
            let outcome = if correct { 1.0 } else { 0.0 };
            brier += (confidence - outcome).powi(2);
            conf_sum += confidence;
            correct_sum += outcome;

            let bin = ((confidence * ECE_BINS as f64) as usize).min(ECE_BINS - 1);
            bins[bin].0 += 1;
            bins[bin].1 += confidence;
            bins[bin].2 += outcome;
        }

        let mut ece = 0.0;
        for (count, conf, correct) in bins {
            if count == 0 {
                continue;
            }
            let weight = count as f64 / n;
            ece += weight * ((conf - correct) / count as f64).abs();
        }

        CalibrationReport {
            samples: samples.len(),
            brier_score: brier / n,
            ece,
            drift: (conf_sum - correct_sum) / n,
        }
    }
}
