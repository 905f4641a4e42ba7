//! # Ensemble Combination
//!
//! Combines per-head point estimates into a single ensemble estimate with
//! softmax-normalized weights, and derives the disagreement component of the
//! uncertainty report.
//!
//! Softmax is deliberately reused as the projection onto the probability
//! simplex: it guarantees non-negative weights summing to one without an
//! explicit projection step, which is all the ensemble requires.
//!
//! The total uncertainty adds the disagreement variance and the Monte-Carlo
//! variance under a square root. That additive combination is an
//! approximation carried over from the reference formulation — it is not a
//! rigorously derived variance decomposition, and callers should treat the
//! resulting figure as a calibrated-by-convention summary rather than a
//! statistically exact standard deviation.

use crate::math::stable_softmax;
use ndarray::{Array1, ArrayView1};

/// Projects a raw weight vector onto the simplex via softmax.
///
/// The result satisfies `α_i ≥ 0` and `Σ α_i = 1` by construction.
pub fn normalized_weights(raw: ArrayView1<f64>) -> Array1<f64> {
    stable_softmax(raw)
}

/// Weighted ensemble point estimate `Σ α_i ŷ_i`.
pub fn weighted_mean(estimates: ArrayView1<f64>, weights: ArrayView1<f64>) -> f64 {
    estimates.dot(&weights)
}

/// Weighted spread of the head estimates around the ensemble mean,
/// `Σ α_i (ŷ_i − ŷ)²`. This is the epistemic-disagreement component of the
/// reported uncertainty.
pub fn disagreement_variance(
    estimates: ArrayView1<f64>,
    weights: ArrayView1<f64>,
    ensemble_mean: f64,
) -> f64 {
    estimates
        .iter()
        .zip(weights.iter())
        .map(|(&estimate, &weight)| weight * (estimate - ensemble_mean).powi(2))
        .sum()
}

/// Combines the disagreement and Monte-Carlo variance components into the
/// reported total uncertainty, `sqrt(σ²_disagreement + σ²_MC)`.
pub fn total_uncertainty(disagreement_variance: f64, mc_variance: f64) -> f64 {
    (disagreement_variance.max(0.0) + mc_variance.max(0.0)).sqrt()
}
