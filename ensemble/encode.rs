//! # Feature Encoding
//!
//! Turns a [`PatientRecord`](crate::record::PatientRecord) into the
//! fixed-shape numeric representation the predictor heads consume: a static
//! vector of length [`STATIC_DIM`] and a temporal matrix of shape
//! `[history_len, TEMPORAL_CHANNELS]`.
//!
//! Encoding is a total function: missing static fields take their value from
//! an explicit [`RecordDefaults`](crate::record::RecordDefaults), every
//! numeric field is scaled by a fixed, documented constant into roughly
//! `[0, 1]`, and out-of-range inputs are clamped rather than rejected.
//! Histories shorter than the window are left-padded with zeros (padding
//! rows represent "earlier than observed history"); longer histories keep
//! only the most recent entries.

use crate::record::{PatientRecord, RecordDefaults};
use ndarray::{Array1, Array2};

/// Number of static features: age, weight, sex, creatinine, CYP3A4 score,
/// adherence.
pub const STATIC_DIM: usize = 6;

/// Number of temporal channels per history step: dose, concentration,
/// time offset.
pub const TEMPORAL_CHANNELS: usize = 3;

/// Canonical static feature names, in encoding order.
pub const STATIC_FEATURE_NAMES: [&str; STATIC_DIM] = [
    "age",
    "weight",
    "sex",
    "creatinine",
    "cyp3a4_score",
    "adherence",
];

/// Canonical temporal channel names, in encoding order.
pub const TEMPORAL_CHANNEL_NAMES: [&str; TEMPORAL_CHANNELS] =
    ["dose_history", "concentration_history", "time_offsets"];

/// Scale divisor for age in years. 100 years maps to 1.0.
pub const AGE_SCALE: f64 = 100.0;
/// Scale divisor for weight in kilograms. 200 kg maps to 1.0.
pub const WEIGHT_SCALE: f64 = 200.0;
/// Scale divisor for serum creatinine in mg/dL. 10 mg/dL maps to 1.0.
pub const CREATININE_SCALE: f64 = 10.0;
/// Scale divisor for doses in milligrams. 1000 mg maps to 1.0.
pub const DOSE_SCALE: f64 = 1000.0;
/// Scale divisor for plasma concentrations in ng/mL. 500 ng/mL maps to 1.0.
pub const CONCENTRATION_SCALE: f64 = 500.0;
/// Scale divisor for observation age in hours. Two weeks maps to 1.0.
pub const TIME_OFFSET_SCALE: f64 = 336.0;

/// The fixed-shape numeric representation of one patient record.
///
/// Owned exclusively by the prediction call that created it.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedInput {
    /// Normalized static features, length [`STATIC_DIM`].
    pub static_features: Array1<f64>,
    /// Normalized temporal features, shape `[history_len, TEMPORAL_CHANNELS]`,
    /// rows ordered oldest first with zero left-padding.
    pub temporal: Array2<f64>,
}

fn scaled(value: f64, scale: f64) -> f64 {
    (value / scale).clamp(0.0, 1.0)
}

/// Encodes a record into fixed-shape normalized arrays.
///
/// Never fails: missing fields are defaulted, out-of-range values clamped,
/// and non-finite values treated as missing.
pub fn encode(
    record: &PatientRecord,
    defaults: &RecordDefaults,
    history_len: usize,
) -> EncodedInput {
    let field = |value: Option<f64>, default: f64| -> f64 {
        match value {
            Some(v) if v.is_finite() => v,
            _ => default,
        }
    };

    let static_features = Array1::from_vec(vec![
        scaled(field(record.age_years, defaults.age_years), AGE_SCALE),
        scaled(field(record.weight_kg, defaults.weight_kg), WEIGHT_SCALE),
        field(record.sex, defaults.sex).clamp(0.0, 1.0),
        scaled(
            field(record.creatinine_mg_dl, defaults.creatinine_mg_dl),
            CREATININE_SCALE,
        ),
        field(record.cyp3a4_score, defaults.cyp3a4_score).clamp(0.0, 1.0),
        field(record.adherence, defaults.adherence).clamp(0.0, 1.0),
    ]);

    let mut temporal = Array2::zeros((history_len, TEMPORAL_CHANNELS));
    // Keep the most recent `history_len` observations; `history` is ordered
    // oldest first, so truncation drops from the front.
    let kept = record.history.len().min(history_len);
    let skipped = record.history.len() - kept;
    let pad = history_len - kept;
    for (row, obs) in record.history[skipped..].iter().enumerate() {
        let finite = |v: f64| if v.is_finite() { v } else { 0.0 };
        temporal[[pad + row, 0]] = scaled(finite(obs.dose_mg), DOSE_SCALE);
        temporal[[pad + row, 1]] = scaled(finite(obs.concentration_ng_ml), CONCENTRATION_SCALE);
        temporal[[pad + row, 2]] = scaled(finite(obs.hours_before_now), TIME_OFFSET_SCALE);
    }

    EncodedInput {
        static_features,
        temporal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::DoseObservation;
    use approx::assert_abs_diff_eq;

    fn observation(dose: f64, conc: f64, hours: f64) -> DoseObservation {
        DoseObservation {
            dose_mg: dose,
            concentration_ng_ml: conc,
            hours_before_now: hours,
        }
    }

    #[test]
    fn missing_fields_take_explicit_defaults() {
        let defaults = RecordDefaults::default();
        let encoded = encode(&PatientRecord::default(), &defaults, 4);
        assert_abs_diff_eq!(encoded.static_features[0], 60.0 / AGE_SCALE);
        assert_abs_diff_eq!(encoded.static_features[1], 70.0 / WEIGHT_SCALE);
        assert_abs_diff_eq!(encoded.static_features[5], 1.0);
    }

    #[test]
    fn out_of_range_values_are_clamped_not_rejected() {
        let record = PatientRecord {
            age_years: Some(400.0),
            weight_kg: Some(-5.0),
            adherence: Some(3.0),
            ..PatientRecord::default()
        };
        let encoded = encode(&record, &RecordDefaults::default(), 2);
        assert_abs_diff_eq!(encoded.static_features[0], 1.0);
        assert_abs_diff_eq!(encoded.static_features[1], 0.0);
        assert_abs_diff_eq!(encoded.static_features[5], 1.0);
    }

    #[test]
    fn non_finite_values_fall_back_to_defaults() {
        let record = PatientRecord {
            age_years: Some(f64::NAN),
            creatinine_mg_dl: Some(f64::INFINITY),
            ..PatientRecord::default()
        };
        let encoded = encode(&record, &RecordDefaults::default(), 2);
        assert_abs_diff_eq!(encoded.static_features[0], 60.0 / AGE_SCALE);
        assert_abs_diff_eq!(encoded.static_features[3], 1.0 / CREATININE_SCALE);
        assert!(encoded.static_features.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn short_history_is_left_padded_with_exact_zeros() {
        let record = PatientRecord {
            history: vec![
                observation(300.0, 180.0, 48.0),
                observation(320.0, 220.0, 24.0),
            ],
            ..PatientRecord::default()
        };
        let encoded = encode(&record, &RecordDefaults::default(), 5);
        assert_eq!(encoded.temporal.shape(), &[5, TEMPORAL_CHANNELS]);
        // Padded rows are exactly zero.
        for row in 0..3 {
            for channel in 0..TEMPORAL_CHANNELS {
                assert_eq!(encoded.temporal[[row, channel]], 0.0);
            }
        }
        // Observed rows are exactly the normalized inputs, oldest first.
        assert_abs_diff_eq!(encoded.temporal[[3, 0]], 300.0 / DOSE_SCALE);
        assert_abs_diff_eq!(encoded.temporal[[3, 1]], 180.0 / CONCENTRATION_SCALE);
        assert_abs_diff_eq!(encoded.temporal[[3, 2]], 48.0 / TIME_OFFSET_SCALE);
        assert_abs_diff_eq!(encoded.temporal[[4, 0]], 320.0 / DOSE_SCALE);
    }

    #[test]
    fn long_history_keeps_most_recent_entries() {
        let history = (0..8)
            .map(|i| observation(100.0 + i as f64, 50.0, (8 - i) as f64))
            .collect();
        let record = PatientRecord {
            history,
            ..PatientRecord::default()
        };
        let encoded = encode(&record, &RecordDefaults::default(), 3);
        // The last three observations survive, oldest first.
        assert_abs_diff_eq!(encoded.temporal[[0, 0]], 105.0 / DOSE_SCALE);
        assert_abs_diff_eq!(encoded.temporal[[1, 0]], 106.0 / DOSE_SCALE);
        assert_abs_diff_eq!(encoded.temporal[[2, 0]], 107.0 / DOSE_SCALE);
    }

    #[test]
    fn empty_history_encodes_to_all_zeros() {
        let encoded = encode(&PatientRecord::default(), &RecordDefaults::default(), 6);
        assert!(encoded.temporal.iter().all(|&v| v == 0.0));
    }
}
