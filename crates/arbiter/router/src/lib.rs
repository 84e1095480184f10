//! Arbiter Bandit Router - adaptive worker selection
//!
//! Hybrid Thompson Sampling + Q-learning: per-(context, worker) Beta
//! posteriors blended with TD estimates, with a forced exploration floor
//! that decays toward φ⁻⁴ but never reaches zero.

#![deny(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arbiter_types::phi::{fibonacci, PHI_INV_3, PHI_INV_4};
use arbiter_types::{ContextClass, LearningState, StateKey, WorkerId};
use rand::Rng;
use rand_distr::{Beta, Distribution};
use thiserror::Error;
use tracing::debug;

pub mod store;

pub use store::{InMemoryLearningStore, LearningStore};

/// Visits below this leave the TD estimate out of the blend entirely.
const MIN_VISITS_TO_BLEND: u64 = 3;

/// Shared, atomically adjustable exploration floor.
///
/// Starts at φ⁻⁴. The calibration monitor tightens (raises) it when
/// confidence drifts above observed correctness; it is never lowered below
/// φ⁻⁴ and never raised above φ⁻³.
pub struct ExplorationControl {
    floor_bits: AtomicU64,
}

impl ExplorationControl {
    pub fn new() -> Self {
        Self {
            floor_bits: AtomicU64::new(PHI_INV_4.to_bits()),
        }
    }

    pub fn floor(&self) -> f64 {
        f64::from_bits(self.floor_bits.load(Ordering::Relaxed))
    }

    /// Raise the floor. Clamped to [φ⁻⁴, φ⁻³]; a lower value is ignored.
    pub fn tighten(&self, new_floor: f64) {
        let clamped = new_floor.clamp(PHI_INV_4, PHI_INV_3);
        let mut current = self.floor_bits.load(Ordering::Relaxed);
        while f64::from_bits(current) < clamped {
            match self.floor_bits.compare_exchange(
                current,
                clamped.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    /// Relax the floor back toward φ⁻⁴ (e.g. after drift clears).
    pub fn relax(&self) {
        self.floor_bits
            .store(PHI_INV_4.to_bits(), Ordering::Relaxed);
    }
}

impl Default for ExplorationControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Exploration probability after `total_visits` observations in a context.
///
/// Starts at φ⁻³ and decays toward `floor` with a half-life of F(8) = 21
/// visits. Monotonically non-increasing in visits, always ≥ `floor` > 0.
pub fn exploration_rate(total_visits: u64, floor: f64) -> f64 {
    let f8 = fibonacci(8) as f64;
    let span = (PHI_INV_3 - floor).max(0.0);
    floor + span * f8 / (f8 + total_visits as f64)
}

/// Routing errors.
#[derive(Debug, Error)]
pub enum RouteError {
    /// Caller should retry with relaxed eligibility criteria.
    #[error("No eligible worker for context class: {0}")]
    NoEligibleWorker(String),
}

/// Selects a worker per task from persisted per-(context, worker) statistics.
///
/// Read-only with respect to [`LearningState`]: all mutation happens in the
/// learning manager. Stale reads are acceptable.
pub struct BanditRouter {
    store: Arc<dyn LearningStore>,
    exploration: Arc<ExplorationControl>,
}

impl BanditRouter {
    pub fn new(store: Arc<dyn LearningStore>, exploration: Arc<ExplorationControl>) -> Self {
        Self { store, exploration }
    }

    pub fn exploration_control(&self) -> Arc<ExplorationControl> {
        Arc::clone(&self.exploration)
    }

    /// Select one worker for a context class.
    pub fn select(
        &self,
        context_class: &ContextClass,
        eligible: &[WorkerId],
    ) -> Result<WorkerId, RouteError> {
        self.select_with_rng(context_class, eligible, &mut rand::thread_rng())
    }

    /// Deterministic variant for simulation and tests.
    pub fn select_with_rng<R: Rng>(
        &self,
        context_class: &ContextClass,
        eligible: &[WorkerId],
        rng: &mut R,
    ) -> Result<WorkerId, RouteError> {
        if eligible.is_empty() {
            return Err(RouteError::NoEligibleWorker(context_class.0.clone()));
        }

        let states: Vec<LearningState> = eligible
            .iter()
            .map(|w| {
                self.store
                    .get(&StateKey::new(context_class.clone(), w.clone()))
                    .unwrap_or_default()
            })
            .collect();

        let best = Self::argmax_blend(eligible, &states, rng);

        // Forced exploration: substitute a uniformly-random eligible worker
        // other than the greedy pick. The floor keeps every worker reachable.
        let total_visits: u64 = states.iter().map(|s| s.visit_count).sum();
        let epsilon = exploration_rate(total_visits, self.exploration.floor());
        let selected = if eligible.len() > 1 && rng.gen::<f64>() < epsilon {
            let others: Vec<&WorkerId> = eligible.iter().filter(|w| **w != best).collect();
            if others.is_empty() {
                // Duplicate ids leave nothing to explore; stay greedy.
                best
            } else {
                (*others[rng.gen_range(0..others.len())]).clone()
            }
        } else {
            best
        };

        debug!(
            context = %context_class,
            worker = %selected,
            eligible = eligible.len(),
            epsilon = epsilon,
            "Worker selected"
        );

        Ok(selected)
    }

    /// Greedy pick: argmax over blended Thompson sample and TD estimate.
    fn argmax_blend<R: Rng>(
        eligible: &[WorkerId],
        states: &[LearningState],
        rng: &mut R,
    ) -> WorkerId {
        let mut best = eligible[0].clone();
        let mut best_score = f64::MIN;

        for (worker, state) in eligible.iter().zip(states.iter()) {
            let sample = Beta::new(state.alpha, state.beta)
                .map(|d| d.sample(rng))
                .unwrap_or(0.5);

            // Cold entries lean on the posterior alone.
            let blend = if state.visit_count < MIN_VISITS_TO_BLEND {
                sample
            } else {
                let estimate = (state.q_value + state.preference_bonus).clamp(0.0, 1.0);
                0.5 * sample + 0.5 * estimate
            };

            if blend > best_score {
                best_score = blend;
                best = worker.clone();
            }
        }

        best
    }
}
