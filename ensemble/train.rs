//! # Loss and Training Gradients
//!
//! The training objective combines a plain squared error with a
//! heteroscedastic negative-log-likelihood term that uses the ensemble's own
//! reported variance:
//!
//! `L = (ŷ − y)² + 0.5·(ŷ − y)²/σ² + 0.5·log σ²`
//!
//! Numerical guards: `σ²` is floored at [`VARIANCE_FLOOR`] before the log
//! and the division, and the gradient with respect to the prediction is
//! clipped to [`PREDICTION_GRADIENT_CLIP`] so an overconfident ensemble
//! (variance at the floor, large residual) cannot blow up a gradient step.
//!
//! The variance is treated as a per-step constant when differentiating: the
//! gradient flows through the prediction path only, not through the
//! uncertainty estimate. See DESIGN.md for the rationale.

use ndarray::{Array1, ArrayView1};

/// Smallest variance admitted into the NLL term.
pub const VARIANCE_FLOOR: f64 = 1e-4;

/// Bound on `|∂L/∂ŷ|` applied before backpropagation into the heads.
pub const PREDICTION_GRADIENT_CLIP: f64 = 10.0;

/// The training loss, split into its two terms.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossBreakdown {
    /// `squared_error + negative_log_likelihood`.
    pub total: f64,
    /// `(ŷ − y)²`.
    pub squared_error: f64,
    /// `0.5·(ŷ − y)²/σ² + 0.5·log σ²` with the floored variance.
    pub negative_log_likelihood: f64,
}

/// Evaluates the combined loss for one prediction/target pair.
pub fn heteroscedastic_loss(prediction: f64, target: f64, variance: f64) -> LossBreakdown {
    let floored = variance.max(VARIANCE_FLOOR);
    let residual = prediction - target;
    let squared_error = residual * residual;
    let negative_log_likelihood = 0.5 * squared_error / floored + 0.5 * floored.ln();
    LossBreakdown {
        total: squared_error + negative_log_likelihood,
        squared_error,
        negative_log_likelihood,
    }
}

/// Gradient of the loss with respect to the ensemble prediction, with the
/// variance held constant, clipped to [`PREDICTION_GRADIENT_CLIP`].
pub fn loss_gradient(prediction: f64, target: f64, variance: f64) -> f64 {
    let floored = variance.max(VARIANCE_FLOOR);
    let residual = prediction - target;
    let raw = 2.0 * residual + residual / floored;
    raw.clamp(-PREDICTION_GRADIENT_CLIP, PREDICTION_GRADIENT_CLIP)
}

/// Gradient of the loss with respect to the raw (pre-softmax) ensemble
/// weight vector.
///
/// With `α = softmax(β)` and `ŷ = Σ α_i ŷ_i`, the chain rule gives
/// `∂L/∂β_j = ∂L/∂ŷ · α_j·(ŷ_j − ŷ)`.
pub fn weight_gradient(
    estimates: ArrayView1<f64>,
    weights: ArrayView1<f64>,
    ensemble_mean: f64,
    upstream: f64,
) -> Array1<f64> {
    Array1::from_shape_fn(weights.len(), |j| {
        upstream * weights[j] * (estimates[j] - ensemble_mean)
    })
}
