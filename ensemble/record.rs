//! # Patient Record Data Model
//!
//! This module defines the typed input record consumed by the prediction
//! engine. The source of truth for patient data is an upstream clinical
//! pipeline that may deliver incomplete records; every static attribute is
//! therefore optional, and the values substituted for missing attributes
//! are an explicit, caller-visible parameter (`RecordDefaults`) rather than
//! a constant hidden inside the encoder.
//!
//! - Explicit Schema: fields are named and typed. There is no dynamic
//!   key lookup and no "missing key silently becomes zero" behavior.
//! - Graceful Degradation: missing or out-of-range values are defaulted
//!   and clamped downstream, never rejected. Malformed patient data must
//!   degrade a prediction, not abort a clinical pipeline.

use serde::{Deserialize, Serialize};

/// One historical dosing observation: the administered dose, the measured
/// plasma concentration, and how long before "now" the measurement was taken.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DoseObservation {
    /// Administered dose in milligrams.
    pub dose_mg: f64,
    /// Measured plasma concentration in ng/mL.
    pub concentration_ng_ml: f64,
    /// Hours elapsed between this observation and the prediction request.
    pub hours_before_now: f64,
}

/// A single patient's data for one prediction request.
///
/// The record is immutable for the duration of the request. `history` is
/// ordered oldest first; the encoder keeps the most recent entries when the
/// history is longer than the configured window.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PatientRecord {
    /// Age in years.
    pub age_years: Option<f64>,
    /// Body weight in kilograms.
    pub weight_kg: Option<f64>,
    /// Binary-coded sex: 0.0 for female, 1.0 for male.
    pub sex: Option<f64>,
    /// Serum creatinine in mg/dL.
    pub creatinine_mg_dl: Option<f64>,
    /// CYP3A4 metabolizer score in `[0, 1]` (0 = poor, 1 = ultrarapid).
    pub cyp3a4_score: Option<f64>,
    /// Medication adherence fraction in `[0, 1]`.
    pub adherence: Option<f64>,
    /// Dosing history, ordered oldest first.
    pub history: Vec<DoseObservation>,
}

/// Assumed spacing between consecutive history observations when the caller
/// supplies parallel dose/concentration series without explicit timestamps.
pub const DEFAULT_OBSERVATION_SPACING_HOURS: f64 = 24.0;

impl PatientRecord {
    /// Builds a record from parallel dose and concentration series, assuming
    /// one observation per dosing interval (24h spacing, most recent last).
    ///
    /// The series are zipped by index; if their lengths differ, the extra
    /// trailing entries of the longer series are ignored.
    pub fn from_series(doses_mg: &[f64], concentrations_ng_ml: &[f64]) -> Self {
        let n = doses_mg.len().min(concentrations_ng_ml.len());
        let history = (0..n)
            .map(|i| DoseObservation {
                dose_mg: doses_mg[i],
                concentration_ng_ml: concentrations_ng_ml[i],
                hours_before_now: (n - i) as f64 * DEFAULT_OBSERVATION_SPACING_HOURS,
            })
            .collect();
        Self {
            history,
            ..Self::default()
        }
    }
}

/// Fixed substitutes for missing static attributes.
///
/// These are population-typical values for an adult patient. They are a
/// constructor parameter of the encoder so that callers can see — and, where
/// clinically appropriate, override — what a missing field turns into.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecordDefaults {
    pub age_years: f64,
    pub weight_kg: f64,
    pub sex: f64,
    pub creatinine_mg_dl: f64,
    pub cyp3a4_score: f64,
    pub adherence: f64,
}

impl Default for RecordDefaults {
    fn default() -> Self {
        Self {
            age_years: 60.0,
            weight_kg: 70.0,
            sex: 0.0,
            creatinine_mg_dl: 1.0,
            cyp3a4_score: 0.5,
            adherence: 1.0,
        }
    }
}
