//! Pure learning-state update math.
//!
//! TD(0) with φ-derived rates: learning rate α = φ⁻¹, discount γ = φ⁻².
//! Consolidated entries (Fisher importance above φ⁻¹) take scaled-down
//! updates so well-established knowledge is protected from churn.

use arbiter_types::phi::{PHI_INV, PHI_INV_2};
use arbiter_types::LearningState;

/// Rates for one TD update. The meta-control loop decays the learning rate
/// over the life of the process; the discount stays fixed.
#[derive(Clone, Copy, Debug)]
pub struct UpdateParams {
    pub learning_rate: f64,
    pub discount: f64,
}

impl Default for UpdateParams {
    fn default() -> Self {
        Self {
            learning_rate: PHI_INV,
            discount: PHI_INV_2,
        }
    }
}

/// Apply one observed outcome to a learning state.
///
/// Increments the Beta posterior (`alpha` on success, `beta` on failure),
/// bumps the visit count, and moves `q_value` by the TD error
/// `reward + γ·max_q_next − q`, scaled by `(1 − fisher)` once the entry is
/// consolidated. Does not touch `fisher_importance`; that belongs to the
/// consolidation loop.
pub fn apply_outcome(
    state: &LearningState,
    success: bool,
    reward: f64,
    max_q_next: f64,
    params: UpdateParams,
) -> LearningState {
    let mut next = state.clone();

    if success {
        next.alpha += 1.0;
    } else {
        next.beta += 1.0;
    }
    next.visit_count += 1;

    let td_error = reward + params.discount * max_q_next - next.q_value;
    let mut delta = params.learning_rate * td_error;
    if next.fisher_importance > PHI_INV {
        delta *= 1.0 - next.fisher_importance;
    }
    next.q_value = (next.q_value + delta).clamp(0.0, 1.0);

    next
}
