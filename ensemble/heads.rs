//! # Predictor Heads
//!
//! Four independently-parameterized scalar predictors with different
//! inductive biases over the encoded patient input:
//!
//! - [`FeedForwardHead`]: affine stack over the static vector.
//! - [`RecurrentHead`]: tanh recurrence over the temporal matrix.
//! - [`FirHead`]: learned finite-impulse-response taps over the most recent
//!   steps, followed by a small feed-forward network.
//! - [`AttentionHead`]: simplified scaled dot-product self-attention with
//!   time-averaged values.
//!
//! Each head exposes a deterministic `predict` and an analytic `backward`
//! that maps an upstream scalar gradient `∂L/∂ŷ` to parameter gradients.
//! Heads are plain parameter containers; they are cloned into immutable
//! snapshots by the model layer, so none of the methods here mutate state
//! except the explicit gradient-descent `apply_gradient` calls.

use crate::encode::{EncodedInput, STATIC_DIM, TEMPORAL_CHANNELS};
use crate::math::{Mlp, MlpGradient, gaussian_matrix, gaussian_vector, outer, stable_softmax};
use ndarray::{Array1, Array2, ArrayView2, Axis, s};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Number of predictor heads in the ensemble.
pub const HEAD_COUNT: usize = 4;

/// Identifies one head variant. The order of [`HeadKind::ALL`] is the
/// canonical order of per-head estimates and ensemble weights everywhere in
/// this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeadKind {
    FeedForward,
    Recurrent,
    Fir,
    Attention,
}

impl HeadKind {
    pub const ALL: [HeadKind; HEAD_COUNT] = [
        HeadKind::FeedForward,
        HeadKind::Recurrent,
        HeadKind::Fir,
        HeadKind::Attention,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            HeadKind::FeedForward => "feed_forward",
            HeadKind::Recurrent => "recurrent",
            HeadKind::Fir => "fir",
            HeadKind::Attention => "attention",
        }
    }
}

// --- Feed-forward head ---

/// Affine stack with ReLU hidden activations over the static feature vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedForwardHead {
    pub mlp: Mlp,
}

impl FeedForwardHead {
    pub fn init<R: Rng + ?Sized>(hidden_dim: usize, rng: &mut R) -> Self {
        Self {
            mlp: Mlp::init(&[STATIC_DIM, hidden_dim, hidden_dim, 1], rng),
        }
    }

    pub fn predict(&self, input: &EncodedInput) -> f64 {
        self.mlp.forward_scalar(input.static_features.view())
    }

    /// Stochastic forward pass with inverted dropout on hidden units; the
    /// sampling primitive behind Monte-Carlo uncertainty estimation.
    pub fn predict_dropout<R: Rng + ?Sized>(
        &self,
        input: &EncodedInput,
        dropout: f64,
        rng: &mut R,
    ) -> f64 {
        self.mlp
            .forward_scalar_dropout(input.static_features.view(), dropout, rng)
    }

    pub fn backward(&self, input: &EncodedInput, upstream: f64) -> MlpGradient {
        let (_, trace) = self.mlp.forward_with_trace(input.static_features.view());
        let (grad, _) = self.mlp.backward(&trace, upstream);
        grad
    }

    pub fn apply_gradient(&mut self, gradient: &MlpGradient, learning_rate: f64) {
        self.mlp.apply_gradient(gradient, learning_rate);
    }
}

// --- Recurrent head ---

/// Simple tanh recurrence `h_t = tanh(W·x_t + U·h_{t-1} + b)` with a linear
/// projection of the final hidden state.
///
/// Time steps are processed oldest to newest. That order is an invariant:
/// reversing it changes the semantics of the final hidden state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurrentHead {
    pub input_weight: Array2<f64>,
    pub recurrent_weight: Array2<f64>,
    pub bias: Array1<f64>,
    pub output_weight: Array1<f64>,
    pub output_bias: f64,
}

/// Parameter gradients for [`RecurrentHead`], from backpropagation through
/// time.
#[derive(Debug, Clone)]
pub struct RecurrentGradient {
    pub d_input_weight: Array2<f64>,
    pub d_recurrent_weight: Array2<f64>,
    pub d_bias: Array1<f64>,
    pub d_output_weight: Array1<f64>,
    pub d_output_bias: f64,
}

impl RecurrentHead {
    pub fn init<R: Rng + ?Sized>(hidden_dim: usize, rng: &mut R) -> Self {
        Self {
            input_weight: gaussian_matrix(
                hidden_dim,
                TEMPORAL_CHANNELS,
                (1.0 / TEMPORAL_CHANNELS as f64).sqrt(),
                rng,
            ),
            recurrent_weight: gaussian_matrix(
                hidden_dim,
                hidden_dim,
                (1.0 / hidden_dim as f64).sqrt(),
                rng,
            ),
            bias: Array1::zeros(hidden_dim),
            output_weight: gaussian_vector(hidden_dim, (1.0 / hidden_dim as f64).sqrt(), rng),
            output_bias: 0.0,
        }
    }

    /// Runs the recurrence and returns every hidden state, `states[0]` being
    /// the zero initial state and `states[t]` the state after step `t - 1`.
    fn hidden_states(&self, temporal: ArrayView2<f64>) -> Vec<Array1<f64>> {
        let hidden_dim = self.bias.len();
        let mut states = Vec::with_capacity(temporal.nrows() + 1);
        states.push(Array1::zeros(hidden_dim));
        for step in temporal.rows() {
            let previous = states.last().unwrap();
            let pre = self.input_weight.dot(&step) + self.recurrent_weight.dot(previous) + &self.bias;
            states.push(pre.mapv(f64::tanh));
        }
        states
    }

    pub fn predict(&self, input: &EncodedInput) -> f64 {
        let states = self.hidden_states(input.temporal.view());
        self.output_weight.dot(states.last().unwrap()) + self.output_bias
    }

    pub fn backward(&self, input: &EncodedInput, upstream: f64) -> RecurrentGradient {
        let temporal = input.temporal.view();
        let states = self.hidden_states(temporal);
        let steps = temporal.nrows();

        let final_state = states.last().unwrap();
        let d_output_weight = final_state * upstream;
        let d_output_bias = upstream;

        let mut d_input_weight = Array2::zeros(self.input_weight.raw_dim());
        let mut d_recurrent_weight = Array2::zeros(self.recurrent_weight.raw_dim());
        let mut d_bias = Array1::zeros(self.bias.len());
        let mut d_state = &self.output_weight * upstream;

        for t in (0..steps).rev() {
            let state = &states[t + 1];
            let previous = &states[t];
            // tanh' from the stored post-activation.
            let d_pre = &d_state * &state.mapv(|h| 1.0 - h * h);
            d_input_weight += &outer(d_pre.view(), temporal.row(t));
            d_recurrent_weight += &outer(d_pre.view(), previous.view());
            d_bias += &d_pre;
            d_state = self.recurrent_weight.t().dot(&d_pre);
        }

        RecurrentGradient {
            d_input_weight,
            d_recurrent_weight,
            d_bias,
            d_output_weight,
            d_output_bias,
        }
    }

    pub fn apply_gradient(&mut self, gradient: &RecurrentGradient, learning_rate: f64) {
        self.input_weight
            .scaled_add(-learning_rate, &gradient.d_input_weight);
        self.recurrent_weight
            .scaled_add(-learning_rate, &gradient.d_recurrent_weight);
        self.bias.scaled_add(-learning_rate, &gradient.d_bias);
        self.output_weight
            .scaled_add(-learning_rate, &gradient.d_output_weight);
        self.output_bias -= learning_rate * gradient.d_output_bias;
    }
}

// --- FIR head ---

/// Learned weighted sum over the most recent taps of each temporal channel,
/// fed through a small feed-forward network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirHead {
    /// Filter coefficients, shape `[taps, TEMPORAL_CHANNELS]`, row 0 being
    /// the oldest tap inside the window.
    pub taps: Array2<f64>,
    pub mlp: Mlp,
}

#[derive(Debug, Clone)]
pub struct FirGradient {
    pub d_taps: Array2<f64>,
    pub mlp: MlpGradient,
}

impl FirHead {
    pub fn init<R: Rng + ?Sized>(taps: usize, hidden_dim: usize, rng: &mut R) -> Self {
        Self {
            taps: gaussian_matrix(taps, TEMPORAL_CHANNELS, (1.0 / taps as f64).sqrt(), rng),
            mlp: Mlp::init(&[TEMPORAL_CHANNELS, hidden_dim, 1], rng),
        }
    }

    /// Applies the taps to the trailing window of the temporal matrix. A
    /// window shorter than the filter (already zero-padded upstream) aligns
    /// against the most recent taps.
    fn filtered(&self, temporal: ArrayView2<f64>) -> Array1<f64> {
        let tap_count = self.taps.nrows();
        let start = temporal.nrows().saturating_sub(tap_count);
        let window = temporal.slice(s![start.., ..]);
        let offset = tap_count - window.nrows();
        let mut filtered = Array1::zeros(TEMPORAL_CHANNELS);
        for (row, step) in window.rows().into_iter().enumerate() {
            for channel in 0..TEMPORAL_CHANNELS {
                filtered[channel] += self.taps[[offset + row, channel]] * step[channel];
            }
        }
        filtered
    }

    pub fn predict(&self, input: &EncodedInput) -> f64 {
        self.mlp.forward_scalar(self.filtered(input.temporal.view()).view())
    }

    pub fn backward(&self, input: &EncodedInput, upstream: f64) -> FirGradient {
        let temporal = input.temporal.view();
        let filtered = self.filtered(temporal);
        let (_, trace) = self.mlp.forward_with_trace(filtered.view());
        let (mlp_grad, d_filtered) = self.mlp.backward(&trace, upstream);

        let tap_count = self.taps.nrows();
        let start = temporal.nrows().saturating_sub(tap_count);
        let window = temporal.slice(s![start.., ..]);
        let offset = tap_count - window.nrows();
        let mut d_taps = Array2::zeros(self.taps.raw_dim());
        for (row, step) in window.rows().into_iter().enumerate() {
            for channel in 0..TEMPORAL_CHANNELS {
                d_taps[[offset + row, channel]] = d_filtered[channel] * step[channel];
            }
        }

        FirGradient {
            d_taps,
            mlp: mlp_grad,
        }
    }

    pub fn apply_gradient(&mut self, gradient: &FirGradient, learning_rate: f64) {
        self.taps.scaled_add(-learning_rate, &gradient.d_taps);
        self.mlp.apply_gradient(&gradient.mlp, learning_rate);
    }
}

// --- Attention head ---

/// Simplified scaled dot-product self-attention: Q/K/V projections of the
/// temporal matrix, per-row max-subtracted softmax, time-averaged attended
/// values, and a linear output projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttentionHead {
    pub query_weight: Array2<f64>,
    pub key_weight: Array2<f64>,
    pub value_weight: Array2<f64>,
    pub output_weight: Array1<f64>,
    pub output_bias: f64,
}

#[derive(Debug, Clone)]
pub struct AttentionGradient {
    pub d_query_weight: Array2<f64>,
    pub d_key_weight: Array2<f64>,
    pub d_value_weight: Array2<f64>,
    pub d_output_weight: Array1<f64>,
    pub d_output_bias: f64,
}

/// Intermediate activations of one attention forward pass.
struct AttentionTrace {
    query: Array2<f64>,
    key: Array2<f64>,
    value: Array2<f64>,
    attention: Array2<f64>,
    pooled: Array1<f64>,
}

impl AttentionHead {
    pub fn init<R: Rng + ?Sized>(attention_dim: usize, rng: &mut R) -> Self {
        let projection_std = (1.0 / TEMPORAL_CHANNELS as f64).sqrt();
        Self {
            query_weight: gaussian_matrix(TEMPORAL_CHANNELS, attention_dim, projection_std, rng),
            key_weight: gaussian_matrix(TEMPORAL_CHANNELS, attention_dim, projection_std, rng),
            value_weight: gaussian_matrix(TEMPORAL_CHANNELS, attention_dim, projection_std, rng),
            output_weight: gaussian_vector(attention_dim, (1.0 / attention_dim as f64).sqrt(), rng),
            output_bias: 0.0,
        }
    }

    fn attention_dim(&self) -> usize {
        self.query_weight.ncols()
    }

    fn forward_trace(&self, temporal: ArrayView2<f64>) -> AttentionTrace {
        let attention_dim = self.attention_dim();
        let steps = temporal.nrows();
        let query = temporal.dot(&self.query_weight);
        let key = temporal.dot(&self.key_weight);
        let value = temporal.dot(&self.value_weight);

        let scale = 1.0 / (attention_dim as f64).sqrt();
        let scores = query.dot(&key.t()) * scale;
        let mut attention = Array2::zeros((steps, steps));
        for (row, score_row) in scores.rows().into_iter().enumerate() {
            attention.row_mut(row).assign(&stable_softmax(score_row));
        }

        let attended = attention.dot(&value);
        // Empty history: fall back to a zero vector instead of dividing by
        // a zero step count.
        let pooled = attended
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(attention_dim));

        AttentionTrace {
            query,
            key,
            value,
            attention,
            pooled,
        }
    }

    pub fn predict(&self, input: &EncodedInput) -> f64 {
        let trace = self.forward_trace(input.temporal.view());
        self.output_weight.dot(&trace.pooled) + self.output_bias
    }

    pub fn backward(&self, input: &EncodedInput, upstream: f64) -> AttentionGradient {
        let temporal = input.temporal.view();
        let trace = self.forward_trace(temporal);
        let steps = temporal.nrows();
        let attention_dim = self.attention_dim();

        let d_output_weight = &trace.pooled * upstream;
        let d_output_bias = upstream;

        if steps == 0 {
            return AttentionGradient {
                d_query_weight: Array2::zeros(self.query_weight.raw_dim()),
                d_key_weight: Array2::zeros(self.key_weight.raw_dim()),
                d_value_weight: Array2::zeros(self.value_weight.raw_dim()),
                d_output_weight,
                d_output_bias,
            };
        }

        let d_pooled = &self.output_weight * upstream;
        // Mean pooling spreads the pooled gradient uniformly over time.
        let d_attended =
            Array2::from_shape_fn((steps, attention_dim), |(_, j)| d_pooled[j] / steps as f64);

        let d_attention = d_attended.dot(&trace.value.t());
        let d_value = trace.attention.t().dot(&d_attended);

        // Row-wise softmax Jacobian: dS = A ⊙ (dA − (dA·A)).
        let mut d_scores = Array2::zeros((steps, steps));
        for row in 0..steps {
            let attention_row = trace.attention.row(row);
            let upstream_row = d_attention.row(row);
            let dot = attention_row.dot(&upstream_row);
            for col in 0..steps {
                d_scores[[row, col]] = attention_row[col] * (upstream_row[col] - dot);
            }
        }

        let scale = 1.0 / (attention_dim as f64).sqrt();
        let d_query = d_scores.dot(&trace.key) * scale;
        let d_key = d_scores.t().dot(&trace.query) * scale;

        AttentionGradient {
            d_query_weight: temporal.t().dot(&d_query),
            d_key_weight: temporal.t().dot(&d_key),
            d_value_weight: temporal.t().dot(&d_value),
            d_output_weight,
            d_output_bias,
        }
    }

    pub fn apply_gradient(&mut self, gradient: &AttentionGradient, learning_rate: f64) {
        self.query_weight
            .scaled_add(-learning_rate, &gradient.d_query_weight);
        self.key_weight
            .scaled_add(-learning_rate, &gradient.d_key_weight);
        self.value_weight
            .scaled_add(-learning_rate, &gradient.d_value_weight);
        self.output_weight
            .scaled_add(-learning_rate, &gradient.d_output_weight);
        self.output_bias -= learning_rate * gradient.d_output_bias;
    }
}

// --- Head set ---

/// All four heads bundled in canonical order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadSet {
    pub feed_forward: FeedForwardHead,
    pub recurrent: RecurrentHead,
    pub fir: FirHead,
    pub attention: AttentionHead,
}

/// Per-head parameter gradients, mirroring [`HeadSet`].
#[derive(Debug, Clone)]
pub struct HeadSetGradients {
    pub feed_forward: MlpGradient,
    pub recurrent: RecurrentGradient,
    pub fir: FirGradient,
    pub attention: AttentionGradient,
}

impl HeadSet {
    pub fn init<R: Rng + ?Sized>(
        hidden_dim: usize,
        attention_dim: usize,
        fir_taps: usize,
        rng: &mut R,
    ) -> Self {
        Self {
            feed_forward: FeedForwardHead::init(hidden_dim, rng),
            recurrent: RecurrentHead::init(hidden_dim, rng),
            fir: FirHead::init(fir_taps, hidden_dim, rng),
            attention: AttentionHead::init(attention_dim, rng),
        }
    }

    /// Per-head point estimates in [`HeadKind::ALL`] order.
    pub fn predict_all(&self, input: &EncodedInput) -> Array1<f64> {
        Array1::from_vec(vec![
            self.feed_forward.predict(input),
            self.recurrent.predict(input),
            self.fir.predict(input),
            self.attention.predict(input),
        ])
    }

    /// Backward pass for every head from its own upstream scalar gradient,
    /// ordered like [`HeadKind::ALL`].
    pub fn backward_all(&self, input: &EncodedInput, upstream: &[f64; HEAD_COUNT]) -> HeadSetGradients {
        HeadSetGradients {
            feed_forward: self.feed_forward.backward(input, upstream[0]),
            recurrent: self.recurrent.backward(input, upstream[1]),
            fir: self.fir.backward(input, upstream[2]),
            attention: self.attention.backward(input, upstream[3]),
        }
    }

    pub fn apply_gradients(&mut self, gradients: &HeadSetGradients, learning_rate: f64) {
        self.feed_forward
            .apply_gradient(&gradients.feed_forward, learning_rate);
        self.recurrent
            .apply_gradient(&gradients.recurrent, learning_rate);
        self.fir.apply_gradient(&gradients.fir, learning_rate);
        self.attention
            .apply_gradient(&gradients.attention, learning_rate);
    }
}
