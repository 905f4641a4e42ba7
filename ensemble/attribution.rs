//! # Feature Attribution
//!
//! A cheap, normalized importance score per input feature: the magnitude of
//! each normalized static feature, and the per-channel standard deviation of
//! the temporal history. Scores are non-negative and sum to one.
//!
//! This is explicitly a proxy for explainability, not an attribution method
//! with formal guarantees — no Shapley-value axioms are satisfied, and the
//! scores must not be presented as a certified explanation of a prediction.

use crate::encode::{EncodedInput, STATIC_FEATURE_NAMES, TEMPORAL_CHANNEL_NAMES};

/// One named importance score.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribution {
    pub name: &'static str,
    pub score: f64,
}

fn channel_stddev(input: &EncodedInput, channel: usize) -> f64 {
    let column = input.temporal.column(channel);
    let n = column.len();
    if n == 0 {
        return 0.0;
    }
    let mean = column.sum() / n as f64;
    let variance = column.iter().map(|&v| (v - mean).powi(2)).sum::<f64>() / n as f64;
    variance.sqrt()
}

/// Computes normalized importance scores over all static features and
/// temporal channels.
///
/// When every raw score is zero (e.g. an all-default, no-history record) the
/// importance is spread uniformly instead of dividing by zero.
pub fn attribute(input: &EncodedInput) -> Vec<Attribution> {
    let mut attributions: Vec<Attribution> = STATIC_FEATURE_NAMES
        .iter()
        .zip(input.static_features.iter())
        .map(|(&name, &value)| Attribution {
            name,
            score: value.abs(),
        })
        .collect();

    for (channel, &name) in TEMPORAL_CHANNEL_NAMES.iter().enumerate() {
        attributions.push(Attribution {
            name,
            score: channel_stddev(input, channel),
        });
    }

    let total: f64 = attributions.iter().map(|a| a.score).sum();
    if total > 0.0 && total.is_finite() {
        for attribution in &mut attributions {
            attribution.score /= total;
        }
    } else {
        let uniform = 1.0 / attributions.len() as f64;
        for attribution in &mut attributions {
            attribution.score = uniform;
        }
    }

    attributions
}
