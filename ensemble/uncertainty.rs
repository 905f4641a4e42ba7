//! # Monte-Carlo Uncertainty Estimation
//!
//! Estimates model uncertainty by running the feed-forward head's forward
//! pass repeatedly, each time independently zeroing a fraction of hidden
//! activations (inverted dropout), and summarizing the spread of the
//! resulting scalar outputs.
//!
//! The caller threads an explicit RNG handle, so results are reproducible
//! given a seed and concurrent callers never share hidden mutable RNG
//! state. One child seed is derived per sample up front; the samples are
//! then evaluated in parallel with rayon, which is safe because samples are
//! independent and no ordering guarantee is required between them.
//!
//! Caveat: very small sample counts (below ~10) yield noisy spread
//! estimates. That is a documented property of the estimator, not an error
//! condition.

use crate::encode::EncodedInput;
use crate::heads::FeedForwardHead;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

/// Empirical summary of repeated stochastic forward passes.
#[derive(Debug, Clone, PartialEq)]
pub struct McEstimate {
    /// Mean of the sampled outputs.
    pub mean: f64,
    /// Population standard deviation of the sampled outputs.
    pub stddev: f64,
    /// The raw sampled outputs, in sampling order.
    pub samples: Vec<f64>,
}

/// Runs `n_samples` dropout-perturbed forward passes and returns the
/// empirical mean, standard deviation, and raw samples.
///
/// With `n_samples == 0` the deterministic forward pass is reported with
/// zero spread instead of dividing by a zero sample count.
pub fn estimate_uncertainty<R: Rng + ?Sized>(
    head: &FeedForwardHead,
    input: &EncodedInput,
    n_samples: usize,
    dropout: f64,
    rng: &mut R,
) -> McEstimate {
    if n_samples == 0 {
        return McEstimate {
            mean: head.predict(input),
            stddev: 0.0,
            samples: Vec::new(),
        };
    }

    let seeds: Vec<u64> = (0..n_samples).map(|_| rng.random()).collect();
    let samples: Vec<f64> = seeds
        .into_par_iter()
        .map(|seed| {
            let mut sample_rng = StdRng::seed_from_u64(seed);
            head.predict_dropout(input, dropout, &mut sample_rng)
        })
        .collect();

    let mean = samples.iter().sum::<f64>() / n_samples as f64;
    let variance = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n_samples as f64;

    McEstimate {
        mean,
        stddev: variance.sqrt(),
        samples,
    }
}
