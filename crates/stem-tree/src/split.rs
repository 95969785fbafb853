use rand::Rng;

use crate::node::{FeatureIndex, Impurity};

/// Node impurity at or below this value is treated as pure.
pub(crate) const PURE_TOLERANCE: f64 = 1e-12;

/// Impurity measure for classification trees.
///
/// Regression trees always split on variance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SplitCriterion {
    /// `1 - sum(p^2)`
    Gini,
    /// `-sum(p ln p)`
    Entropy,
}

impl SplitCriterion {
    /// Impurity of a node with the given per-class counts; an empty node is pure.
    #[must_use]
    pub fn impurity(&self, class_counts: &[usize], n_samples: usize) -> Impurity {
        if n_samples == 0 {
            return Impurity::new(0.0);
        }
        let n = n_samples as f64;
        let shares = class_counts.iter().filter(|&&c| c > 0).map(|&c| c as f64 / n);
        Impurity::new(match self {
            SplitCriterion::Gini => 1.0 - shares.map(|p| p * p).sum::<f64>(),
            SplitCriterion::Entropy => -shares.map(|p| p * p.ln()).sum::<f64>(),
        })
    }
}

/// Variance of a node computed from running sums.
pub(crate) fn variance(sum: f64, sum_sq: f64, n_samples: usize) -> Impurity {
    if n_samples == 0 {
        return Impurity::new(0.0);
    }
    let n = n_samples as f64;
    let mean = sum / n;
    Impurity::new((sum_sq / n - mean * mean).max(0.0))
}

/// Borrowed view of the training targets in the form a split scan needs.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Targets<'a> {
    /// Zero-based class indices plus the class count.
    Classes {
        labels: &'a [usize],
        n_classes: usize,
        criterion: SplitCriterion,
    },
    /// Continuous responses.
    Values(&'a [f64]),
}

impl Targets<'_> {
    /// Impurity of the node holding `sample_indices`.
    pub(crate) fn node_impurity(&self, sample_indices: &[usize]) -> Impurity {
        match *self {
            Targets::Classes {
                labels,
                n_classes,
                criterion,
            } => {
                let counts = class_counts(labels, sample_indices, n_classes);
                criterion.impurity(&counts, sample_indices.len())
            }
            Targets::Values(values) => {
                let (sum, sum_sq) = sums(values, sample_indices);
                variance(sum, sum_sq, sample_indices.len())
            }
        }
    }
}

pub(crate) fn class_counts(labels: &[usize], sample_indices: &[usize], n_classes: usize) -> Vec<usize> {
    let mut counts = vec![0usize; n_classes];
    for &si in sample_indices {
        counts[labels[si]] += 1;
    }
    counts
}

fn sums(values: &[f64], sample_indices: &[usize]) -> (f64, f64) {
    sample_indices.iter().fold((0.0, 0.0), |(s, sq), &si| {
        let v = values[si];
        (s + v, sq + v * v)
    })
}

/// Pick the candidate features for one split.
///
/// Every `forced` feature is always a candidate. When `max_features` is
/// set, up to that many of the remaining features are drawn without
/// replacement (partial Fisher-Yates); otherwise all of them are used.
pub(crate) fn candidate_features(
    n_features: usize,
    max_features: Option<usize>,
    forced: &[usize],
    rng: &mut impl Rng,
) -> Vec<usize> {
    let mut pool: Vec<usize> = (0..n_features).filter(|f| !forced.contains(f)).collect();
    let take = max_features.map_or(pool.len(), |m| m.min(pool.len()));
    for i in 0..take {
        let j = rng.gen_range(i..pool.len());
        pool.swap(i, j);
    }
    let mut selected = forced.to_vec();
    selected.extend_from_slice(&pool[..take]);
    selected
}

/// Winning split of a node and the partition it induces.
#[derive(Debug, Clone)]
pub(crate) struct BestSplit {
    pub(crate) feature: FeatureIndex,
    pub(crate) threshold: f64,
    /// `n * parent - n_left * left - n_right * right`.
    pub(crate) gain: f64,
    pub(crate) left_indices: Vec<usize>,
    pub(crate) right_indices: Vec<usize>,
}

/// Running left/right statistics during a sorted scan.
enum ScanState {
    Classes {
        left: Vec<usize>,
        right: Vec<usize>,
    },
    Values {
        left_sum: f64,
        left_sq: f64,
        right_sum: f64,
        right_sq: f64,
    },
}

impl ScanState {
    fn start(targets: &Targets<'_>, sample_indices: &[usize]) -> Self {
        match *targets {
            Targets::Classes {
                labels, n_classes, ..
            } => ScanState::Classes {
                left: vec![0; n_classes],
                right: class_counts(labels, sample_indices, n_classes),
            },
            Targets::Values(values) => {
                let (sum, sq) = sums(values, sample_indices);
                ScanState::Values {
                    left_sum: 0.0,
                    left_sq: 0.0,
                    right_sum: sum,
                    right_sq: sq,
                }
            }
        }
    }

    fn move_left(&mut self, targets: &Targets<'_>, si: usize) {
        match (self, targets) {
            (ScanState::Classes { left, right }, Targets::Classes { labels, .. }) => {
                left[labels[si]] += 1;
                right[labels[si]] -= 1;
            }
            (
                ScanState::Values {
                    left_sum,
                    left_sq,
                    right_sum,
                    right_sq,
                },
                Targets::Values(values),
            ) => {
                let v = values[si];
                *left_sum += v;
                *left_sq += v * v;
                *right_sum -= v;
                *right_sq -= v * v;
            }
            _ => unreachable!("scan state always matches the target kind"),
        }
    }

    fn child_impurities(&self, targets: &Targets<'_>, n_left: usize, n_right: usize) -> (f64, f64) {
        match (self, targets) {
            (ScanState::Classes { left, right }, Targets::Classes { criterion, .. }) => (
                criterion.impurity(left, n_left).value(),
                criterion.impurity(right, n_right).value(),
            ),
            (
                ScanState::Values {
                    left_sum,
                    left_sq,
                    right_sum,
                    right_sq,
                },
                Targets::Values(_),
            ) => (
                variance(*left_sum, *left_sq, n_left).value(),
                variance(*right_sum, *right_sq, n_right).value(),
            ),
            _ => unreachable!("scan state always matches the target kind"),
        }
    }
}

/// Scan every candidate feature for the threshold with the largest gain.
///
/// Thresholds sit midway between consecutive distinct sorted values. A
/// split must leave `min_samples_leaf` samples on each side and gain more
/// than [`PURE_TOLERANCE`]; `None` when nothing qualifies.
///
/// `features` is column-major: `features[feature][sample]`.
pub(crate) fn find_best_split(
    features: &[Vec<f64>],
    targets: &Targets<'_>,
    sample_indices: &[usize],
    candidates: &[usize],
    min_samples_leaf: usize,
) -> Option<BestSplit> {
    let n = sample_indices.len();
    if n < 2 || candidates.is_empty() {
        return None;
    }

    let weighted_parent = n as f64 * targets.node_impurity(sample_indices).value();
    let mut best_gain = PURE_TOLERANCE;
    let mut best: Option<(FeatureIndex, f64)> = None;
    let mut order: Vec<(f64, usize)> = Vec::with_capacity(n);

    for &feature in candidates {
        let column = &features[feature];
        order.clear();
        order.extend(sample_indices.iter().map(|&si| (column[si], si)));
        order.sort_unstable_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        let mut state = ScanState::start(targets, sample_indices);
        for (n_left, pair) in (1..n).zip(order.windows(2)) {
            let [(below, si), (above, _)] = [pair[0], pair[1]];
            state.move_left(targets, si);

            let n_right = n - n_left;
            if below == above || n_left.min(n_right) < min_samples_leaf {
                continue;
            }
            let (left, right) = state.child_impurities(targets, n_left, n_right);
            let gain = weighted_parent - n_left as f64 * left - n_right as f64 * right;
            if gain > best_gain {
                best_gain = gain;
                best = Some((FeatureIndex::new(feature), below + (above - below) / 2.0));
            }
        }
    }

    let (feature, threshold) = best?;
    let column = &features[feature.index()];
    let (left_indices, right_indices) = sample_indices.iter().partition(|&&si| column[si] <= threshold);

    Some(BestSplit {
        feature,
        threshold,
        gain: best_gain,
        left_indices,
        right_indices,
    })
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::{SplitCriterion, Targets, candidate_features, find_best_split, variance};

    #[test]
    fn gini_pure_and_balanced() {
        let pure = SplitCriterion::Gini.impurity(&[10, 0, 0], 10);
        let balanced = SplitCriterion::Gini.impurity(&[5, 5], 10);
        assert!(pure.value().abs() < f64::EPSILON);
        assert!((balanced.value() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn entropy_binary_balanced() {
        let imp = SplitCriterion::Entropy.impurity(&[5, 5], 10);
        assert!((imp.value() - 2.0_f64.ln()).abs() < 1e-10);
    }

    #[test]
    fn variance_of_known_values() {
        // values 1, 2, 3: mean 2, population variance 2/3
        let imp = variance(6.0, 14.0, 3);
        assert!((imp.value() - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn classification_split_separates_groups() {
        let features = vec![vec![1.0, 2.0, 3.0, 10.0, 11.0, 12.0]];
        let labels = vec![0, 0, 0, 1, 1, 1];
        let targets = Targets::Classes {
            labels: &labels,
            n_classes: 2,
            criterion: SplitCriterion::Gini,
        };
        let indices: Vec<usize> = (0..6).collect();

        let split = find_best_split(&features, &targets, &indices, &[0], 1).expect("split");
        assert_eq!(split.feature.index(), 0);
        assert!(split.threshold > 3.0 && split.threshold < 10.0);
        assert_eq!(split.left_indices, vec![0, 1, 2]);
        assert_eq!(split.right_indices, vec![3, 4, 5]);
    }

    #[test]
    fn regression_split_picks_informative_feature() {
        // Feature 0 is noise, feature 1 separates low and high responses.
        let features = vec![
            vec![5.0, 1.0, 4.0, 2.0, 3.0, 6.0],
            vec![0.0, 0.1, 0.2, 5.0, 5.1, 5.2],
        ];
        let values = vec![1.0, 1.1, 0.9, 9.0, 9.2, 8.8];
        let targets = Targets::Values(&values);
        let indices: Vec<usize> = (0..6).collect();

        let split = find_best_split(&features, &targets, &indices, &[0, 1], 1).expect("split");
        assert_eq!(split.feature.index(), 1);
        assert_eq!(split.left_indices.len(), 3);
    }

    #[test]
    fn constant_feature_returns_none() {
        let features = vec![vec![5.0, 5.0, 5.0, 5.0]];
        let labels = vec![0, 0, 1, 1];
        let targets = Targets::Classes {
            labels: &labels,
            n_classes: 2,
            criterion: SplitCriterion::Gini,
        };
        let indices: Vec<usize> = (0..4).collect();
        assert!(find_best_split(&features, &targets, &indices, &[0], 1).is_none());
    }

    #[test]
    fn min_samples_leaf_enforced() {
        let features = vec![vec![1.0, 10.0]];
        let values = vec![0.0, 1.0];
        let targets = Targets::Values(&values);
        assert!(find_best_split(&features, &targets, &[0, 1], &[0], 2).is_none());
    }

    #[test]
    fn forced_features_always_candidates() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..20 {
            let selected = candidate_features(6, Some(2), &[4, 5], &mut rng);
            assert_eq!(selected.len(), 4);
            assert!(selected.contains(&4) && selected.contains(&5));
            assert!(selected[2..].iter().all(|&f| f < 4));
        }
    }

    #[test]
    fn no_max_features_uses_all() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut selected = candidate_features(3, None, &[], &mut rng);
        selected.sort_unstable();
        assert_eq!(selected, vec![0, 1, 2]);
    }
}
