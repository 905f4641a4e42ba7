//! # Ensemble Predictor
//!
//! The public façade tying the encoder, heads, combiner, uncertainty
//! estimator, and training step together.
//!
//! ## Parameter snapshots
//!
//! Parameters live in an immutable, versioned [`ParamSet`] behind an
//! `Arc`. Every prediction clones the `Arc` once and computes against that
//! consistent snapshot; a training step builds an updated parameter set and
//! swaps it in atomically with a bumped version. Predictions therefore never
//! observe a partially-updated parameter set. Training steps themselves are
//! expected to be serialized by the caller — two interleaved steps would
//! race on which snapshot survives, not corrupt one.
//!
//! ## Units
//!
//! The heads operate in the encoder's normalized space. [`PredictionResult`]
//! reports everything denormalized to ng/mL, with the point estimate clamped
//! into the physically plausible concentration window.

use crate::attribution::{Attribution, attribute};
use crate::combine;
use crate::encode::{CONCENTRATION_SCALE, EncodedInput, STATIC_DIM, TEMPORAL_CHANNELS, encode};
use crate::heads::{HEAD_COUNT, HeadKind, HeadSet};
use crate::record::{PatientRecord, RecordDefaults};
use crate::train::{LossBreakdown, heteroscedastic_loss, loss_gradient, weight_gradient};
use crate::uncertainty::{McEstimate, estimate_uncertainty};
use ndarray::Array1;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Upper bound of the physically plausible plasma-concentration range, in
/// ng/mL. Reported point estimates are clamped into `[0, this]`.
pub const PLAUSIBLE_CONCENTRATION_MAX_NG_ML: f64 = 1000.0;

/// Structural and training hyperparameters of the ensemble.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Fixed temporal window length `T`; histories are padded/truncated to
    /// this many observations.
    pub history_len: usize,
    /// FIR filter length `L`; must not exceed `history_len`.
    pub fir_taps: usize,
    /// Hidden width of the feed-forward, recurrent, and FIR networks.
    pub hidden_dim: usize,
    /// Dimension of the attention query/key/value projections.
    pub attention_dim: usize,
    /// Monte-Carlo forward passes per prediction. Values below ~10 give
    /// noisy uncertainty estimates.
    pub mc_samples: usize,
    /// Hidden-unit dropout probability used for Monte-Carlo sampling.
    pub dropout: f64,
    /// Gradient-descent step size.
    pub learning_rate: f64,
    /// Substitutes for missing static record fields.
    pub defaults: RecordDefaults,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            history_len: 10,
            fir_taps: 5,
            hidden_dim: 16,
            attention_dim: 8,
            mc_samples: 50,
            dropout: 0.2,
            learning_rate: 0.01,
            defaults: RecordDefaults::default(),
        }
    }
}

/// Errors from model construction, encoded-input validation, and artifact
/// persistence.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error(
        "Encoded {section} input has shape {found:?}, but the model expects {expected:?}. Refusing to truncate silently."
    )]
    DimensionMismatch {
        section: &'static str,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("Dropout probability must lie in [0, 1), but was {0}.")]
    InvalidDropout(f64),
    #[error("Learning rate must be positive and finite, but was {0}.")]
    InvalidLearningRate(f64),
    #[error("FIR filter length ({taps}) must not exceed the history window ({history_len}).")]
    FirExceedsHistory { taps: usize, history_len: usize },
    #[error("Model dimension '{0}' must be at least 1.")]
    ZeroDimension(&'static str),
    #[error("Failed to read or write model artifact: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML model artifact: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize model artifact to TOML: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
}

fn validate_config(config: &ModelConfig) -> Result<(), ModelError> {
    for (value, name) in [
        (config.history_len, "history_len"),
        (config.fir_taps, "fir_taps"),
        (config.hidden_dim, "hidden_dim"),
        (config.attention_dim, "attention_dim"),
    ] {
        if value == 0 {
            return Err(ModelError::ZeroDimension(name));
        }
    }
    if !(0.0..1.0).contains(&config.dropout) {
        return Err(ModelError::InvalidDropout(config.dropout));
    }
    if !config.learning_rate.is_finite() || config.learning_rate <= 0.0 {
        return Err(ModelError::InvalidLearningRate(config.learning_rate));
    }
    if config.fir_taps > config.history_len {
        return Err(ModelError::FirExceedsHistory {
            taps: config.fir_taps,
            history_len: config.history_len,
        });
    }
    Ok(())
}

/// One immutable, versioned set of all trainable parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSet {
    /// Monotonically increasing; bumped by every training step.
    pub version: u64,
    pub heads: HeadSet,
    /// Raw (pre-softmax) ensemble weights `β`.
    pub raw_weights: Array1<f64>,
}

/// One head's contribution to an ensemble prediction.
#[derive(Debug, Clone, PartialEq)]
pub struct HeadContribution {
    pub kind: HeadKind,
    /// The head's own point estimate, in ng/mL.
    pub estimate_ng_ml: f64,
    /// The normalized ensemble weight `α_i` applied to this head.
    pub weight: f64,
}

/// The full prediction report. Constructed fresh per call; the caller owns
/// its lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionResult {
    /// Ensemble point estimate in ng/mL, clamped to the plausible window.
    pub point_estimate: f64,
    /// `sqrt(σ²_disagreement + σ²_MC)`, in ng/mL. The additive combination
    /// is an approximation, not a derived variance decomposition.
    pub total_uncertainty: f64,
    /// Equal to `total_uncertainty`: both modeled components — Monte-Carlo
    /// spread and cross-head disagreement — are epistemic.
    pub epistemic_uncertainty: f64,
    /// Always zero. This core does not separately model aleatoric noise
    /// beyond the NLL loss term; the field exists so callers can consume a
    /// stable report shape.
    pub aleatoric_uncertainty: f64,
    /// Per-head estimates and normalized weights, in [`HeadKind::ALL`] order.
    pub per_head: Vec<HeadContribution>,
    /// Normalized importance proxy per input feature.
    pub feature_attributions: Vec<Attribution>,
    /// The Monte-Carlo summary behind the uncertainty report, in ng/mL.
    pub monte_carlo: McEstimate,
    /// Version of the parameter snapshot this prediction was computed on.
    pub parameter_version: u64,
}

/// The trained ensemble: configuration plus the current parameter snapshot.
#[derive(Debug)]
pub struct EnsemblePredictor {
    config: ModelConfig,
    params: RwLock<Arc<ParamSet>>,
}

impl EnsemblePredictor {
    /// Initializes all head parameters from a seeded RNG and uniform
    /// ensemble weights (zero raw weights).
    pub fn new(config: ModelConfig, seed: u64) -> Result<Self, ModelError> {
        validate_config(&config)?;
        let mut rng = StdRng::seed_from_u64(seed);
        let heads = HeadSet::init(
            config.hidden_dim,
            config.attention_dim,
            config.fir_taps,
            &mut rng,
        );
        log::info!(
            "initialized ensemble predictor: {} heads, history window {}, {} MC samples",
            HEAD_COUNT,
            config.history_len,
            config.mc_samples
        );
        Ok(Self {
            config,
            params: RwLock::new(Arc::new(ParamSet {
                version: 0,
                heads,
                raw_weights: Array1::zeros(HEAD_COUNT),
            })),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Version of the current parameter snapshot.
    pub fn parameter_version(&self) -> u64 {
        self.snapshot().version
    }

    fn snapshot(&self) -> Arc<ParamSet> {
        Arc::clone(&self.params.read().expect("parameter lock poisoned"))
    }

    /// Encodes a record and predicts. Total over record contents: missing
    /// fields are defaulted and out-of-range values clamped by the encoder.
    pub fn predict<R: Rng + ?Sized>(&self, record: &PatientRecord, rng: &mut R) -> PredictionResult {
        let input = encode(record, &self.config.defaults, self.config.history_len);
        self.predict_inner(&input, rng)
    }

    /// Predicts from a caller-built [`EncodedInput`].
    ///
    /// Unlike malformed record fields, a wrong input shape is a programming
    /// error and fails loudly instead of being truncated.
    pub fn predict_encoded<R: Rng + ?Sized>(
        &self,
        input: &EncodedInput,
        rng: &mut R,
    ) -> Result<PredictionResult, ModelError> {
        if input.static_features.len() != STATIC_DIM {
            return Err(ModelError::DimensionMismatch {
                section: "static",
                expected: vec![STATIC_DIM],
                found: vec![input.static_features.len()],
            });
        }
        let expected_temporal = [self.config.history_len, TEMPORAL_CHANNELS];
        if input.temporal.shape() != expected_temporal {
            return Err(ModelError::DimensionMismatch {
                section: "temporal",
                expected: expected_temporal.to_vec(),
                found: input.temporal.shape().to_vec(),
            });
        }
        Ok(self.predict_inner(input, rng))
    }

    fn predict_inner<R: Rng + ?Sized>(&self, input: &EncodedInput, rng: &mut R) -> PredictionResult {
        let snapshot = self.snapshot();
        let estimates = snapshot.heads.predict_all(input);
        let weights = combine::normalized_weights(snapshot.raw_weights.view());
        let ensemble_mean = combine::weighted_mean(estimates.view(), weights.view());
        let disagreement =
            combine::disagreement_variance(estimates.view(), weights.view(), ensemble_mean);
        let mc = estimate_uncertainty(
            &snapshot.heads.feed_forward,
            input,
            self.config.mc_samples,
            self.config.dropout,
            rng,
        );
        let total = combine::total_uncertainty(disagreement, mc.stddev * mc.stddev);

        let raw_point = ensemble_mean * CONCENTRATION_SCALE;
        let point_estimate = raw_point.clamp(0.0, PLAUSIBLE_CONCENTRATION_MAX_NG_ML);
        if point_estimate != raw_point {
            log::warn!(
                "ensemble point estimate {raw_point:.2} ng/mL outside the plausible window, \
                 clamping to {point_estimate:.2}"
            );
        }

        let per_head = HeadKind::ALL
            .iter()
            .zip(estimates.iter())
            .zip(weights.iter())
            .map(|((&kind, &estimate), &weight)| HeadContribution {
                kind,
                estimate_ng_ml: estimate * CONCENTRATION_SCALE,
                weight,
            })
            .collect();

        let total_uncertainty = total * CONCENTRATION_SCALE;
        PredictionResult {
            point_estimate,
            total_uncertainty,
            epistemic_uncertainty: total_uncertainty,
            aleatoric_uncertainty: 0.0,
            per_head,
            feature_attributions: attribute(input),
            monte_carlo: McEstimate {
                mean: mc.mean * CONCENTRATION_SCALE,
                stddev: mc.stddev * CONCENTRATION_SCALE,
                samples: mc.samples.iter().map(|s| s * CONCENTRATION_SCALE).collect(),
            },
            parameter_version: snapshot.version,
        }
    }

    /// One gradient-descent step on all head parameters and the raw
    /// ensemble weights. Returns the loss evaluated before the update.
    ///
    /// The target concentration is normalized by the same scale constant the
    /// encoder uses, and clamped into the plausible window first.
    pub fn train_step<R: Rng + ?Sized>(
        &self,
        record: &PatientRecord,
        target_ng_ml: f64,
        rng: &mut R,
    ) -> LossBreakdown {
        let input = encode(record, &self.config.defaults, self.config.history_len);
        let target = (target_ng_ml / CONCENTRATION_SCALE)
            .clamp(0.0, PLAUSIBLE_CONCENTRATION_MAX_NG_ML / CONCENTRATION_SCALE);

        let snapshot = self.snapshot();
        let estimates = snapshot.heads.predict_all(&input);
        let weights = combine::normalized_weights(snapshot.raw_weights.view());
        let ensemble_mean = combine::weighted_mean(estimates.view(), weights.view());
        let disagreement =
            combine::disagreement_variance(estimates.view(), weights.view(), ensemble_mean);
        let mc = estimate_uncertainty(
            &snapshot.heads.feed_forward,
            &input,
            self.config.mc_samples,
            self.config.dropout,
            rng,
        );
        let variance = disagreement + mc.stddev * mc.stddev;

        let loss = heteroscedastic_loss(ensemble_mean, target, variance);
        let upstream = loss_gradient(ensemble_mean, target, variance);

        let mut per_head_upstream = [0.0; HEAD_COUNT];
        for (slot, &weight) in per_head_upstream.iter_mut().zip(weights.iter()) {
            *slot = upstream * weight;
        }
        let head_gradients = snapshot.heads.backward_all(&input, &per_head_upstream);
        let raw_weight_gradient =
            weight_gradient(estimates.view(), weights.view(), ensemble_mean, upstream);

        let mut guard = self.params.write().expect("parameter lock poisoned");
        let mut updated = (**guard).clone();
        updated
            .heads
            .apply_gradients(&head_gradients, self.config.learning_rate);
        updated
            .raw_weights
            .scaled_add(-self.config.learning_rate, &raw_weight_gradient);
        updated.version += 1;
        let version = updated.version;
        *guard = Arc::new(updated);
        drop(guard);

        log::debug!(
            "train step -> version {version}, loss {:.6} (mse {:.6}, nll {:.6})",
            loss.total,
            loss.squared_error,
            loss.negative_log_likelihood
        );
        loss
    }

    /// Captures the configuration and current parameters as a serializable
    /// artifact.
    pub fn artifact(&self) -> ModelArtifact {
        ModelArtifact {
            config: self.config,
            params: (*self.snapshot()).clone(),
        }
    }

    /// Rebuilds a predictor from a saved artifact.
    pub fn from_artifact(artifact: ModelArtifact) -> Result<Self, ModelError> {
        validate_config(&artifact.config)?;
        Ok(Self {
            config: artifact.config,
            params: RwLock::new(Arc::new(artifact.params)),
        })
    }
}

/// The self-contained, persistable model: configuration plus parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub config: ModelConfig,
    pub params: ParamSet,
}

impl ModelArtifact {
    /// Saves the artifact to a human-readable TOML file.
    pub fn save(&self, path: &str) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        log::info!("saved model artifact (version {}) to '{path}'", self.params.version);
        Ok(())
    }

    /// Loads an artifact from a TOML file.
    pub fn load(path: &str) -> Result<Self, ModelError> {
        let artifact: Self = toml::from_str(&fs::read_to_string(path)?)?;
        log::info!(
            "loaded model artifact (version {}) from '{path}'",
            artifact.params.version
        );
        Ok(artifact)
    }
}
