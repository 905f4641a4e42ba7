//! End-to-end behavior of the ensemble predictor: the clinical scenario,
//! uncertainty bounds, graceful degradation on malformed records, and the
//! gradient-descent sanity check.

use posology::model::{EnsemblePredictor, ModelConfig, PLAUSIBLE_CONCENTRATION_MAX_NG_ML};
use posology::record::PatientRecord;
use rand::SeedableRng;
use rand::rngs::StdRng;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// The reference scenario: a 65-year-old patient with five days of dosing
/// history.
fn reference_record() -> PatientRecord {
    let mut record = PatientRecord::from_series(
        &[300.0, 320.0, 310.0, 305.0, 315.0],
        &[180.0, 220.0, 210.0, 200.0, 230.0],
    );
    record.age_years = Some(65.0);
    record.weight_kg = Some(75.0);
    record.creatinine_mg_dl = Some(1.8);
    record.cyp3a4_score = Some(0.5);
    record.adherence = Some(0.9);
    record
}

#[test]
fn reference_scenario_yields_a_plausible_estimate() {
    init_logging();
    let model = EnsemblePredictor::new(ModelConfig::default(), 42).unwrap();
    let mut rng = StdRng::seed_from_u64(1);
    let result = model.predict(&reference_record(), &mut rng);

    assert!(result.point_estimate >= 0.0);
    assert!(result.point_estimate <= PLAUSIBLE_CONCENTRATION_MAX_NG_ML);
    assert!(result.total_uncertainty >= 0.0);
    assert!(result.total_uncertainty.is_finite());
    assert_eq!(result.per_head.len(), 4);
    assert!(result.per_head.iter().all(|c| c.estimate_ng_ml.is_finite()));

    let weight_sum: f64 = result.per_head.iter().map(|c| c.weight).sum();
    assert!((weight_sum - 1.0).abs() < 1e-9);

    let attribution_sum: f64 = result.feature_attributions.iter().map(|a| a.score).sum();
    assert!((attribution_sum - 1.0).abs() < 1e-9);
}

#[test]
fn empty_history_still_produces_a_finite_prediction() {
    let model = EnsemblePredictor::new(ModelConfig::default(), 7).unwrap();
    let record = PatientRecord {
        age_years: Some(50.0),
        ..PatientRecord::default()
    };
    let mut rng = StdRng::seed_from_u64(3);
    let result = model.predict(&record, &mut rng);
    assert!(result.point_estimate.is_finite());
    assert!(result.total_uncertainty.is_finite());
    assert!(result.total_uncertainty >= 0.0);
}

#[test]
fn garbage_records_degrade_gracefully() {
    let model = EnsemblePredictor::new(ModelConfig::default(), 7).unwrap();
    let mut record = reference_record();
    record.age_years = Some(f64::NAN);
    record.weight_kg = Some(-1e12);
    record.creatinine_mg_dl = Some(f64::INFINITY);
    record.history[2].concentration_ng_ml = f64::NAN;
    let mut rng = StdRng::seed_from_u64(5);
    let result = model.predict(&record, &mut rng);
    assert!(result.point_estimate.is_finite());
    assert!(result.total_uncertainty.is_finite());
}

#[test]
fn deterministic_path_is_reproducible_across_calls() {
    let model = EnsemblePredictor::new(ModelConfig::default(), 19).unwrap();
    let record = reference_record();
    let mut rng_a = StdRng::seed_from_u64(400);
    let mut rng_b = StdRng::seed_from_u64(8_000);
    let a = model.predict(&record, &mut rng_a);
    let b = model.predict(&record, &mut rng_b);
    // Different sampling RNGs: the deterministic combination must agree
    // exactly; only the Monte-Carlo spread may differ.
    assert_eq!(a.point_estimate, b.point_estimate);
    assert_eq!(a.parameter_version, b.parameter_version);
}

#[test]
fn repeated_training_reduces_the_loss_on_average() {
    init_logging();
    let config = ModelConfig {
        mc_samples: 20,
        ..ModelConfig::default()
    };
    let model = EnsemblePredictor::new(config, 23).unwrap();
    let record = reference_record();
    let target = 210.0;
    let mut rng = StdRng::seed_from_u64(9);

    let losses: Vec<f64> = (0..150)
        .map(|_| model.train_step(&record, target, &mut rng).total)
        .collect();

    let early: f64 = losses[..10].iter().sum::<f64>() / 10.0;
    let late: f64 = losses[losses.len() - 10..].iter().sum::<f64>() / 10.0;
    assert!(
        late < early,
        "average loss should fall over training: early {early:.4}, late {late:.4}"
    );
    assert!(losses.iter().all(|l| l.is_finite()));
    assert_eq!(model.parameter_version(), 150);
}

#[test]
fn training_moves_the_prediction_toward_the_target() {
    let config = ModelConfig {
        mc_samples: 20,
        ..ModelConfig::default()
    };
    let model = EnsemblePredictor::new(config, 29).unwrap();
    let record = reference_record();
    let target = 210.0;
    let mut rng = StdRng::seed_from_u64(11);

    let before = model.predict(&record, &mut rng).point_estimate;
    for _ in 0..200 {
        model.train_step(&record, target, &mut rng);
    }
    let after = model.predict(&record, &mut rng).point_estimate;
    assert!(
        (after - target).abs() < (before - target).abs(),
        "prediction should approach the target: before {before:.2}, after {after:.2}"
    );
}
