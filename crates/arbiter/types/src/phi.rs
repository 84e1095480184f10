//! Golden-ratio constants and scoring math.
//!
//! Every threshold in the engine derives from φ. The constants are spelled
//! out as literals (const fns cannot take square roots); the identities
//! between them are checked in tests at 12-decimal precision.

/// Golden ratio φ = (1 + √5) / 2.
pub const PHI: f64 = 1.618033988749895;

/// φ⁻¹ = φ − 1 ≈ 0.618 — maximum confidence and consensus quorum.
pub const PHI_INV: f64 = 0.618033988749895;

/// φ⁻² = 2 − φ ≈ 0.382 — emergence threshold and TD discount.
pub const PHI_INV_2: f64 = 0.381966011250105;

/// φ⁻³ ≈ 0.236 — initial exploration rate.
pub const PHI_INV_3: f64 = 0.236067977499790;

/// φ⁻⁴ ≈ 0.146 — exploration floor (never reached zero).
pub const PHI_INV_4: f64 = 0.145898033750315;

/// Hard cap on any judgment confidence.
pub const MAX_CONFIDENCE: f64 = PHI_INV;

/// Minimum agreement ratio for a consensus verdict.
pub const CONSENSUS_QUORUM: f64 = PHI_INV;

/// Unexplained variance above this triggers emergence detection.
pub const EMERGENCE_THRESHOLD: f64 = PHI_INV_2;

/// Number of scoring axioms.
pub const AXIOM_COUNT: usize = 5;

/// Scored dimensions per axiom.
pub const DIMENSIONS_PER_AXIOM: usize = 7;

/// Compute F(n), the n-th Fibonacci number. F(0)=0, F(1)=1.
pub fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (0u64, 1u64);
    for _ in 0..n {
        let next = a + b;
        a = b;
        b = next;
    }
    a
}

/// Geometric mean over `values`.
///
/// Any value at or below zero collapses the mean to zero: a total failure
/// on one axis cannot be averaged away.
pub fn geometric_mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    if values.iter().any(|v| *v <= 0.0) {
        return 0.0;
    }
    let log_sum: f64 = values.iter().map(|v| v.ln()).sum();
    (log_sum / values.len() as f64).exp()
}

/// Weighted arithmetic mean. Returns 0.0 when the weights sum to zero.
pub fn weighted_mean(values: &[f64], weights: &[f64]) -> f64 {
    debug_assert_eq!(values.len(), weights.len());
    let total: f64 = weights.iter().sum();
    if total == 0.0 {
        return 0.0;
    }
    values
        .iter()
        .zip(weights.iter())
        .map(|(v, w)| v * w)
        .sum::<f64>()
        / total
}

/// Clamp a confidence value to [0, φ⁻¹]. Silent, never an error.
pub fn clamp_confidence(raw: f64) -> f64 {
    raw.clamp(0.0, MAX_CONFIDENCE)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-12;

    #[test]
    fn test_phi_identities() {
        assert!((PHI * PHI_INV - 1.0).abs() < EPS);
        assert!((PHI * PHI - (PHI + 1.0)).abs() < EPS);
        assert!((PHI_INV + PHI_INV_2 - 1.0).abs() < EPS);
        assert!((PHI_INV_2 * PHI_INV - PHI_INV_3).abs() < EPS);
        assert!((PHI_INV_3 * PHI_INV - PHI_INV_4).abs() < EPS);
    }

    #[test]
    fn test_fibonacci() {
        assert_eq!(fibonacci(0), 0);
        assert_eq!(fibonacci(1), 1);
        assert_eq!(fibonacci(5), 5);
        assert_eq!(fibonacci(8), 21);
        assert_eq!(fibonacci(13), 233);
    }

    #[test]
    fn test_fibonacci_converges_to_phi() {
        for n in 10..18 {
            let ratio = fibonacci(n) as f64 / fibonacci(n - 1) as f64;
            assert!((ratio - PHI).abs() < 0.01);
        }
    }

    #[test]
    fn test_geometric_mean_zero_propagates() {
        assert_eq!(geometric_mean(&[0.9, 0.9, 0.9, 0.9, 0.0]), 0.0);
    }

    #[test]
    fn test_geometric_mean_uniform() {
        let m = geometric_mean(&[0.8, 0.8, 0.8, 0.8, 0.8]);
        assert!((m - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_weighted_mean() {
        let m = weighted_mean(&[1.0, 0.0], &[3.0, 1.0]);
        assert!((m - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_clamp_confidence() {
        assert_eq!(clamp_confidence(0.99), MAX_CONFIDENCE);
        assert_eq!(clamp_confidence(-0.1), 0.0);
        assert_eq!(clamp_confidence(0.5), 0.5);
    }
}
