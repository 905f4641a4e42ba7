//! # Numeric Kernels
//!
//! Small, self-contained building blocks shared by the predictor heads:
//! activation functions, a numerically stable softmax, Gaussian parameter
//! initialization from an explicit seeded RNG, and a minimal feed-forward
//! stack (`Mlp`) with an analytic backward pass.
//!
//! Everything here operates on `f64` `ndarray` arrays. The softmax uses the
//! standard subtract-max stabilization so large logits cannot overflow, and
//! degenerate inputs (empty, or a sum that underflows to zero) fall back to
//! a uniform distribution instead of propagating NaN.

use ndarray::{Array1, Array2, ArrayView1};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

/// Rectified linear unit.
pub fn relu(x: f64) -> f64 {
    x.max(0.0)
}

/// Softmax with subtract-max stabilization.
///
/// Returns a uniform distribution when the exponential sum underflows to
/// zero or fails to be finite, and an empty array for empty input.
pub fn stable_softmax(logits: ArrayView1<f64>) -> Array1<f64> {
    if logits.is_empty() {
        return Array1::zeros(0);
    }
    let max = logits.fold(f64::NEG_INFINITY, |acc, &v| acc.max(v));
    let exp = logits.mapv(|v| (v - max).exp());
    let sum = exp.sum();
    if !sum.is_finite() || sum <= 0.0 {
        return Array1::from_elem(logits.len(), 1.0 / logits.len() as f64);
    }
    exp / sum
}

/// Samples a `[rows, cols]` matrix with entries drawn from `N(0, std²)`.
pub fn gaussian_matrix<R: Rng + ?Sized>(
    rows: usize,
    cols: usize,
    std: f64,
    rng: &mut R,
) -> Array2<f64> {
    let normal = Normal::new(0.0, std).expect("init standard deviation must be positive");
    Array2::from_shape_fn((rows, cols), |_| normal.sample(rng))
}

/// Samples a length-`len` vector with entries drawn from `N(0, std²)`.
pub fn gaussian_vector<R: Rng + ?Sized>(len: usize, std: f64, rng: &mut R) -> Array1<f64> {
    let normal = Normal::new(0.0, std).expect("init standard deviation must be positive");
    Array1::from_shape_fn(len, |_| normal.sample(rng))
}

/// Outer product `a ⊗ b` as a `[a.len(), b.len()]` matrix.
pub fn outer(a: ArrayView1<f64>, b: ArrayView1<f64>) -> Array2<f64> {
    Array2::from_shape_fn((a.len(), b.len()), |(i, j)| a[i] * b[j])
}

/// One affine transform `y = W·x + b` with `W: [out, in]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Affine {
    pub weight: Array2<f64>,
    pub bias: Array1<f64>,
}

impl Affine {
    /// He-style initialization: `W ~ N(0, 2/fan_in)`, zero bias.
    pub fn init<R: Rng + ?Sized>(out_dim: usize, in_dim: usize, rng: &mut R) -> Self {
        let std = (2.0 / in_dim as f64).sqrt();
        Self {
            weight: gaussian_matrix(out_dim, in_dim, std, rng),
            bias: Array1::zeros(out_dim),
        }
    }

    pub fn forward(&self, x: ArrayView1<f64>) -> Array1<f64> {
        self.weight.dot(&x) + &self.bias
    }
}

/// A stack of affine transforms with ReLU between layers and a linear
/// scalar output. The last layer must have output dimension 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mlp {
    pub layers: Vec<Affine>,
}

/// Forward-pass activations retained for the backward pass.
///
/// `activations[0]` is the input; `activations[i]` for `i >= 1` is the
/// post-ReLU output of layer `i - 1` (linear for the final layer).
#[derive(Debug, Clone)]
pub struct MlpTrace {
    pub activations: Vec<Array1<f64>>,
}

/// Per-layer `(dW, db)` pairs, ordered like `Mlp::layers`.
#[derive(Debug, Clone)]
pub struct MlpGradient {
    pub layers: Vec<(Array2<f64>, Array1<f64>)>,
}

impl Mlp {
    /// Builds a stack from consecutive layer dimensions, e.g. `[6, 16, 1]`.
    pub fn init<R: Rng + ?Sized>(dims: &[usize], rng: &mut R) -> Self {
        assert!(dims.len() >= 2, "an Mlp needs at least one affine layer");
        assert_eq!(*dims.last().unwrap(), 1, "the output layer must be scalar");
        let layers = dims
            .windows(2)
            .map(|pair| Affine::init(pair[1], pair[0], rng))
            .collect();
        Self { layers }
    }

    /// Input dimension of the first layer.
    pub fn input_dim(&self) -> usize {
        self.layers[0].weight.ncols()
    }

    /// Deterministic forward pass to a scalar.
    pub fn forward_scalar(&self, x: ArrayView1<f64>) -> f64 {
        let mut activation = x.to_owned();
        let last = self.layers.len() - 1;
        for (i, layer) in self.layers.iter().enumerate() {
            activation = layer.forward(activation.view());
            if i < last {
                activation.mapv_inplace(relu);
            }
        }
        activation[0]
    }

    /// Forward pass that retains per-layer activations for `backward`.
    pub fn forward_with_trace(&self, x: ArrayView1<f64>) -> (f64, MlpTrace) {
        let mut activations = Vec::with_capacity(self.layers.len() + 1);
        activations.push(x.to_owned());
        let last = self.layers.len() - 1;
        for (i, layer) in self.layers.iter().enumerate() {
            let mut next = layer.forward(activations[i].view());
            if i < last {
                next.mapv_inplace(relu);
            }
            activations.push(next);
        }
        let output = activations[self.layers.len()][0];
        (output, MlpTrace { activations })
    }

    /// Stochastic forward pass with inverted dropout on hidden activations.
    ///
    /// Each post-ReLU hidden unit is zeroed with probability `p`; survivors
    /// are scaled by `1/(1-p)` so the expected magnitude is preserved.
    pub fn forward_scalar_dropout<R: Rng + ?Sized>(
        &self,
        x: ArrayView1<f64>,
        p: f64,
        rng: &mut R,
    ) -> f64 {
        let keep_scale = 1.0 / (1.0 - p);
        let mut activation = x.to_owned();
        let last = self.layers.len() - 1;
        for (i, layer) in self.layers.iter().enumerate() {
            activation = layer.forward(activation.view());
            if i < last {
                activation.mapv_inplace(|v| {
                    if rng.random::<f64>() < p {
                        0.0
                    } else {
                        relu(v) * keep_scale
                    }
                });
            }
        }
        activation[0]
    }

    /// Analytic backward pass from an upstream scalar gradient.
    ///
    /// Returns per-layer parameter gradients and the gradient with respect
    /// to the input vector.
    pub fn backward(&self, trace: &MlpTrace, upstream: f64) -> (MlpGradient, Array1<f64>) {
        let n = self.layers.len();
        let mut grads: Vec<(Array2<f64>, Array1<f64>)> = Vec::with_capacity(n);
        // dL/dz for the output layer; the output is linear.
        let mut delta = Array1::from_elem(1, upstream);
        let mut d_input = Array1::zeros(0);
        for i in (0..n).rev() {
            let layer_input = &trace.activations[i];
            grads.push((outer(delta.view(), layer_input.view()), delta.clone()));
            let d_layer_input = self.layers[i].weight.t().dot(&delta);
            if i > 0 {
                // ReLU derivative from the sign of the post-activation.
                delta = d_layer_input
                    * trace.activations[i].mapv(|a| if a > 0.0 { 1.0 } else { 0.0 });
            } else {
                d_input = d_layer_input;
            }
        }
        grads.reverse();
        (MlpGradient { layers: grads }, d_input)
    }

    /// Gradient-descent update: `θ ← θ − lr·∇θ`.
    pub fn apply_gradient(&mut self, gradient: &MlpGradient, learning_rate: f64) {
        for (layer, (d_weight, d_bias)) in self.layers.iter_mut().zip(&gradient.layers) {
            layer.weight.scaled_add(-learning_rate, d_weight);
            layer.bias.scaled_add(-learning_rate, d_bias);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn softmax_sums_to_one_and_is_nonnegative() {
        let weights = stable_softmax(array![0.3, -1.2, 4.0, 0.0].view());
        assert_abs_diff_eq!(weights.sum(), 1.0, epsilon = 1e-12);
        assert!(weights.iter().all(|&w| w >= 0.0));
    }

    #[test]
    fn softmax_survives_extreme_logits() {
        let weights = stable_softmax(array![1e4, -1e4, 0.0].view());
        assert!(weights.iter().all(|w| w.is_finite()));
        assert_abs_diff_eq!(weights.sum(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(weights[0], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn softmax_of_equal_logits_is_uniform() {
        let weights = stable_softmax(array![2.5, 2.5, 2.5, 2.5].view());
        for &w in weights.iter() {
            assert_abs_diff_eq!(w, 0.25, epsilon = 1e-12);
        }
    }

    #[test]
    fn softmax_of_empty_input_is_empty() {
        let weights = stable_softmax(Array1::zeros(0).view());
        assert!(weights.is_empty());
    }

    #[test]
    fn mlp_forward_matches_trace_forward() {
        let mut rng = StdRng::seed_from_u64(7);
        let mlp = Mlp::init(&[4, 8, 1], &mut rng);
        let x = array![0.2, 0.8, 0.1, 0.5];
        let (traced, _) = mlp.forward_with_trace(x.view());
        assert_abs_diff_eq!(mlp.forward_scalar(x.view()), traced, epsilon = 1e-12);
    }

    #[test]
    fn mlp_gradient_matches_finite_differences() {
        let mut rng = StdRng::seed_from_u64(11);
        let mlp = Mlp::init(&[3, 6, 6, 1], &mut rng);
        let x = array![0.4, 0.9, 0.3];
        let (_, trace) = mlp.forward_with_trace(x.view());
        let (grad, _) = mlp.backward(&trace, 1.0);

        let h = 1e-5;
        for layer_idx in 0..mlp.layers.len() {
            for &(row, col) in &[(0usize, 0usize), (1, 1)] {
                if row >= mlp.layers[layer_idx].weight.nrows()
                    || col >= mlp.layers[layer_idx].weight.ncols()
                {
                    continue;
                }
                let mut plus = mlp.clone();
                plus.layers[layer_idx].weight[[row, col]] += h;
                let mut minus = mlp.clone();
                minus.layers[layer_idx].weight[[row, col]] -= h;
                let numeric =
                    (plus.forward_scalar(x.view()) - minus.forward_scalar(x.view())) / (2.0 * h);
                assert_abs_diff_eq!(
                    grad.layers[layer_idx].0[[row, col]],
                    numeric,
                    epsilon = 1e-6
                );
            }
        }
    }

    #[test]
    fn dropout_with_zero_probability_is_deterministic_forward() {
        let mut rng = StdRng::seed_from_u64(3);
        let mlp = Mlp::init(&[4, 8, 1], &mut rng);
        let x = array![0.1, 0.2, 0.3, 0.4];
        let mut sample_rng = StdRng::seed_from_u64(99);
        let dropped = mlp.forward_scalar_dropout(x.view(), 0.0, &mut sample_rng);
        assert_abs_diff_eq!(dropped, mlp.forward_scalar(x.view()), epsilon = 1e-12);
    }
}
