//! Arbiter Dimension Scorer - raw signals to bounded judgments
//!
//! Pure scoring: a complete raw signal in, a φ-bounded judgment out.
//! Incomplete input is rejected, never silently defaulted.

#![deny(unsafe_code)]

use std::sync::{Arc, RwLock};

use arbiter_types::phi::{clamp_confidence, geometric_mean, weighted_mean, AXIOM_COUNT};
use arbiter_types::{Axiom, Judgment, JudgmentId, RawSignal, Verdict};
use thiserror::Error;
use tracing::debug;

pub mod registry;

pub use registry::{DimensionRegistry, RegistryError, RESIDUAL_DIMENSION};

/// Shared handle to the registry: the scorer reads it, the engine appends
/// adopted dimensions to it.
pub type SharedRegistry = Arc<RwLock<DimensionRegistry>>;

/// Scores raw signals against the currently registered dimensions.
pub struct DimensionScorer {
    registry: SharedRegistry,
}

impl DimensionScorer {
    pub fn new(registry: SharedRegistry) -> Self {
        Self { registry }
    }

    /// Scorer over a fresh seed registry. Mostly for tests and wiring.
    pub fn with_seed_registry() -> Self {
        Self::new(Arc::new(RwLock::new(DimensionRegistry::seed())))
    }

    pub fn registry(&self) -> SharedRegistry {
        Arc::clone(&self.registry)
    }

    /// Score a raw signal into a judgment.
    ///
    /// Every registered dimension must carry a value in [0, 1]; a missing or
    /// out-of-range value fails validation. Confidence is clamped to φ⁻¹ —
    /// silently, by design of the scale, never as an error.
    pub fn score(&self, signal: &RawSignal) -> Result<Judgment, ScoreError> {
        let registry = self.registry.read().map_err(|_| ScoreError::LockError)?;

        let mut axiom_scores = [0.0f64; AXIOM_COUNT];
        let mut dimension_scores = std::collections::HashMap::new();

        for (i, axiom) in Axiom::ALL.iter().enumerate() {
            let dims = registry.dimensions_for(*axiom);
            let mut values = Vec::with_capacity(dims.len());
            let mut weights = Vec::with_capacity(dims.len());

            for dim in dims {
                let value = *signal
                    .dimension_values
                    .get(&dim.id)
                    .ok_or_else(|| ScoreError::MissingDimension(dim.id.0.clone()))?;
                if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                    return Err(ScoreError::OutOfRange {
                        dimension: dim.id.0.clone(),
                        value,
                    });
                }
                values.push(value);
                weights.push(dim.weight());
                dimension_scores.insert(dim.id.clone(), value);
            }

            axiom_scores[i] = weighted_mean(&values, &weights);
        }

        // Geometric mean: one axiom at zero zeroes the whole q-score.
        let q_score = 100.0 * geometric_mean(&axiom_scores);
        let verdict = Verdict::from_q_score(q_score);
        let confidence = clamp_confidence(signal.raw_confidence);

        debug!(
            task_id = %signal.task_id,
            worker_id = %signal.worker_id,
            q_score = q_score,
            verdict = %verdict,
            confidence = confidence,
            "Signal scored"
        );

        Ok(Judgment {
            judgment_id: JudgmentId::generate(),
            task_id: signal.task_id.clone(),
            worker_id: signal.worker_id.clone(),
            dimension_scores,
            axiom_scores,
            q_score,
            verdict,
            confidence,
            created_at: chrono::Utc::now(),
        })
    }
}

/// Scoring errors. Validation failures produce no judgment.
#[derive(Debug, Error)]
pub enum ScoreError {
    #[error("Missing value for registered dimension: {0}")]
    MissingDimension(String),

    #[error("Dimension {dimension} value {value} outside [0, 1]")]
    OutOfRange { dimension: String, value: f64 },

    #[error("Lock error")]
    LockError,
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbiter_types::phi::MAX_CONFIDENCE;
    use arbiter_types::{DimensionId, TaskId, WorkerId};
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn uniform_signal(value: f64, confidence: f64) -> RawSignal {
        let registry = DimensionRegistry::seed();
        let dimension_values: HashMap<DimensionId, f64> = registry
            .dimensions()
            .iter()
            .map(|d| (d.id.clone(), value))
            .collect();
        RawSignal {
            task_id: TaskId::generate(),
            worker_id: WorkerId::new("w1"),
            dimension_values,
            raw_confidence: confidence,
        }
    }

    /// Signal where every dimension of one axiom scores zero.
    fn zeroed_axiom_signal(zero_axiom: Axiom) -> RawSignal {
        let registry = DimensionRegistry::seed();
        let dimension_values: HashMap<DimensionId, f64> = registry
            .dimensions()
            .iter()
            .map(|d| (d.id.clone(), if d.axiom == zero_axiom { 0.0 } else { 0.9 }))
            .collect();
        RawSignal {
            task_id: TaskId::generate(),
            worker_id: WorkerId::new("w1"),
            dimension_values,
            raw_confidence: 0.5,
        }
    }

    #[test]
    fn test_uniform_scores_pass_through() {
        let scorer = DimensionScorer::with_seed_registry();
        let judgment = scorer.score(&uniform_signal(0.8, 0.5)).unwrap();

        for axiom_score in judgment.axiom_scores {
            assert!((axiom_score - 0.8).abs() < 1e-9);
        }
        assert!((judgment.q_score - 80.0).abs() < 1e-9);
        assert_eq!(judgment.verdict, Verdict::Excellent);
    }

    #[test]
    fn test_zero_axiom_zeroes_q_score() {
        let scorer = DimensionScorer::with_seed_registry();
        let judgment = scorer.score(&zeroed_axiom_signal(Axiom::Economy)).unwrap();

        assert_eq!(judgment.q_score, 0.0);
        assert_eq!(judgment.verdict, Verdict::Poor);
    }

    #[test]
    fn test_missing_dimension_rejected() {
        let scorer = DimensionScorer::with_seed_registry();
        let mut signal = uniform_signal(0.8, 0.5);
        signal
            .dimension_values
            .remove(&DimensionId::new("evidence.provenance"));

        let result = scorer.score(&signal);
        assert!(matches!(result, Err(ScoreError::MissingDimension(d)) if d == "evidence.provenance"));
    }

    #[test]
    fn test_out_of_range_rejected() {
        let scorer = DimensionScorer::with_seed_registry();
        let mut signal = uniform_signal(0.8, 0.5);
        signal
            .dimension_values
            .insert(DimensionId::new("economy.cost"), 1.2);

        assert!(matches!(
            scorer.score(&signal),
            Err(ScoreError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_confidence_clamped_not_errored() {
        let scorer = DimensionScorer::with_seed_registry();
        let judgment = scorer.score(&uniform_signal(0.8, 0.95)).unwrap();
        assert_eq!(judgment.confidence, MAX_CONFIDENCE);
    }

    #[test]
    fn test_adopted_dimension_becomes_required() {
        let scorer = DimensionScorer::with_seed_registry();
        {
            let registry = scorer.registry();
            let mut registry = registry.write().unwrap();
            registry
                .append(DimensionId::new("evidence.attestation"), Axiom::Evidence, "")
                .unwrap();
        }

        // Old-shape signal no longer validates.
        let result = scorer.score(&uniform_signal(0.8, 0.5));
        assert!(matches!(result, Err(ScoreError::MissingDimension(d)) if d == "evidence.attestation"));
    }

    proptest! {
        #[test]
        fn prop_q_score_and_confidence_bounded(
            value in 0.0f64..=1.0,
            confidence in 0.0f64..=2.0,
        ) {
            let scorer = DimensionScorer::with_seed_registry();
            let judgment = scorer.score(&uniform_signal(value, confidence)).unwrap();

            prop_assert!(judgment.q_score >= 0.0);
            prop_assert!(judgment.q_score <= 100.0);
            prop_assert!(judgment.confidence >= 0.0);
            prop_assert!(judgment.confidence <= MAX_CONFIDENCE);
        }
    }
}
