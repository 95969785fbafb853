//! Accuracy regression tests for stem-tree.
//!
//! These guard against algorithmic changes that degrade a single tree on
//! deterministic synthetic data.

use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use stem_tree::{DecisionTreeConfig, TreeKind};

/// 300 samples, 6 features, 3 classes (values 10, 20, 30).
///
/// Features 0-1 are informative (class index * 3.0 + noise in [0, 0.5]),
/// features 2-5 are pure noise.
fn make_classification(seed: u64) -> (Vec<Vec<f64>>, Vec<f64>) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut features = Vec::with_capacity(300);
    let mut targets = Vec::with_capacity(300);
    for i in 0..300 {
        let class = i % 3;
        targets.push((class as f64 + 1.0) * 10.0);
        let row: Vec<f64> = (0..6)
            .map(|f| {
                let base = if f < 2 { class as f64 * 3.0 } else { 0.0 };
                base + rng.r#gen::<f64>() * 0.5
            })
            .collect();
        features.push(row);
    }
    (features, targets)
}

/// y = 4 * x0 + noise, x1..x3 uninformative.
fn make_regression(seed: u64) -> (Vec<Vec<f64>>, Vec<f64>) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut features = Vec::with_capacity(400);
    let mut targets = Vec::with_capacity(400);
    for _ in 0..400 {
        let row: Vec<f64> = (0..4).map(|_| rng.r#gen::<f64>() * 10.0).collect();
        targets.push(4.0 * row[0] + rng.r#gen::<f64>() * 0.1);
        features.push(row);
    }
    (features, targets)
}

#[test]
fn classifier_holdout_accuracy_above_threshold() {
    let (train_x, train_y) = make_classification(42);
    let (test_x, test_y) = make_classification(7);

    let tree = DecisionTreeConfig::new()
        .with_seed(42)
        .fit_classifier(&train_x, &train_y)
        .unwrap();
    let predictions = tree.predict_batch(&test_x).unwrap();
    let correct = predictions.iter().zip(&test_y).filter(|(p, t)| p == t).count();
    let accuracy = correct as f64 / test_y.len() as f64;

    assert!(accuracy > 0.95, "holdout accuracy {accuracy} <= 0.95");
    assert_eq!(
        tree.kind(),
        &TreeKind::Classifier {
            classes: vec![10.0, 20.0, 30.0]
        }
    );
}

#[test]
fn regressor_holdout_mae_below_threshold() {
    let (train_x, train_y) = make_regression(42);
    let (test_x, test_y) = make_regression(9);

    let tree = DecisionTreeConfig::new()
        .with_min_samples_leaf(2)
        .fit_regressor(&train_x, &train_y)
        .unwrap();
    let predictions = tree.predict_batch(&test_x).unwrap();
    let mae = predictions
        .iter()
        .zip(&test_y)
        .map(|(p, t)| (p - t).abs())
        .sum::<f64>()
        / test_y.len() as f64;

    assert!(mae < 1.5, "holdout MAE {mae} >= 1.5");
    let importances = tree.feature_importances();
    assert!(importances[0] > 0.9, "signal importance {}", importances[0]);
}

#[test]
fn forced_feature_keeps_signal_available_under_subsampling() {
    let (x, y) = make_regression(3);
    // With one drawn candidate per split the signal feature would often be
    // missed; forcing it keeps the fit close to the unrestricted one.
    let tree = DecisionTreeConfig::new()
        .with_max_features(Some(1))
        .with_forced_features(vec![0])
        .with_min_samples_leaf(2)
        .fit_regressor(&x, &y)
        .unwrap();
    assert!(tree.feature_importances()[0] > 0.9);
}
