use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, instrument};

use crate::{
    TreeError,
    node::{LeafOutput, Node, NodeIndex, NodeStats},
    split::{PURE_TOLERANCE, SplitCriterion, Targets, candidate_features, class_counts, find_best_split},
};

/// Growth settings for the tree fitted on one support set.
///
/// Start from [`DecisionTreeConfig::new`] and override with the `with_*` builders.
///
/// # Defaults
///
/// | Parameter           | Default               |
/// |---------------------|-----------------------|
/// | `criterion`         | `Gini`                |
/// | `max_depth`         | `None` (unlimited)    |
/// | `min_samples_split` | 2                     |
/// | `min_samples_leaf`  | 1                     |
/// | `max_features`      | `None` (all features) |
/// | `forced_features`   | empty                 |
/// | `output_cap`        | `None`                |
/// | `seed`              | 42                    |
#[derive(Debug, Clone)]
pub struct DecisionTreeConfig {
    pub(crate) criterion: SplitCriterion,
    pub(crate) max_depth: Option<usize>,
    pub(crate) min_samples_split: usize,
    pub(crate) min_samples_leaf: usize,
    pub(crate) max_features: Option<usize>,
    pub(crate) forced_features: Vec<usize>,
    pub(crate) output_cap: Option<f64>,
    pub(crate) seed: u64,
}

impl DecisionTreeConfig {
    /// Settings from the table above.
    #[must_use]
    pub fn new() -> Self {
        Self {
            criterion: SplitCriterion::Gini,
            max_depth: None,
            min_samples_split: 2,
            min_samples_leaf: 1,
            max_features: None,
            forced_features: Vec::new(),
            output_cap: None,
            seed: 42,
        }
    }

    /// Set the classification split criterion. Regression ignores it.
    #[must_use]
    pub fn with_criterion(mut self, criterion: SplitCriterion) -> Self {
        self.criterion = criterion;
        self
    }

    /// Set the maximum tree depth (root is depth 0). `None` means unlimited.
    #[must_use]
    pub fn with_max_depth(mut self, max_depth: Option<usize>) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Nodes with fewer samples become leaves.
    #[must_use]
    pub fn with_min_samples_split(mut self, min_samples_split: usize) -> Self {
        self.min_samples_split = min_samples_split;
        self
    }

    /// Splits leaving fewer samples on either side are skipped.
    #[must_use]
    pub fn with_min_samples_leaf(mut self, min_samples_leaf: usize) -> Self {
        self.min_samples_leaf = min_samples_leaf;
        self
    }

    /// Set how many non-forced features are drawn as candidates at each split.
    ///
    /// `None` means every feature is a candidate.
    #[must_use]
    pub fn with_max_features(mut self, max_features: Option<usize>) -> Self {
        self.max_features = max_features;
        self
    }

    /// Set features that are candidates at every split regardless of
    /// `max_features`.
    #[must_use]
    pub fn with_forced_features(mut self, forced_features: Vec<usize>) -> Self {
        self.forced_features = forced_features;
        self
    }

    /// Set an upper bound applied to every prediction of the fitted tree.
    #[must_use]
    pub fn with_output_cap(mut self, output_cap: Option<f64>) -> Self {
        self.output_cap = output_cap;
        self
    }

    /// Seed of the per-split predictor draw.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    #[must_use]
    pub fn max_depth(&self) -> Option<usize> {
        self.max_depth
    }

    /// Return the per-split feature subsample size, if set.
    #[must_use]
    pub fn max_features(&self) -> Option<usize> {
        self.max_features
    }

    /// Return the features considered at every split.
    #[must_use]
    pub fn forced_features(&self) -> &[usize] {
        &self.forced_features
    }

    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Fit a classification tree.
    ///
    /// `features[sample_idx][feature_idx]` is row-major. `targets` holds the
    /// class value of each sample; the distinct values (sorted ascending)
    /// become the tree's classes and predictions return one of them.
    ///
    /// # Errors
    ///
    /// | Variant | When |
    /// |---|---|
    /// | [`TreeError::EmptyDataset`] | `features` is empty |
    /// | [`TreeError::ZeroFeatures`] | rows have zero feature columns |
    /// | [`TreeError::TargetCountMismatch`] | `targets.len() != features.len()` |
    /// | [`TreeError::FeatureCountMismatch`] | rows have inconsistent lengths |
    /// | [`TreeError::NonFiniteValue`] / [`TreeError::NonFiniteTarget`] | NaN or infinite input |
    /// | [`TreeError::DegenerateTarget`] | fewer than two distinct classes |
    /// | config variants | invalid depth, split, leaf, or feature settings |
    #[instrument(skip_all, fields(n_samples = features.len(), kind = "classifier"))]
    pub fn fit_classifier(&self, features: &[Vec<f64>], targets: &[f64]) -> Result<DecisionTree, TreeError> {
        let n_features = self.validate(features, targets)?;

        let mut classes: Vec<f64> = targets.to_vec();
        classes.sort_unstable_by(f64::total_cmp);
        classes.dedup();
        if classes.len() < 2 {
            return Err(TreeError::DegenerateTarget {
                n_distinct: classes.len(),
            });
        }

        let labels: Vec<usize> = targets
            .iter()
            .map(|t| classes.partition_point(|c| c < t))
            .collect();

        let view = Targets::Classes {
            labels: &labels,
            n_classes: classes.len(),
            criterion: self.criterion,
        };
        let nodes = self.grow(features, &view, Some(&classes), n_features);

        Ok(DecisionTree {
            nodes,
            n_features,
            kind: TreeKind::Classifier { classes },
            output_cap: self.output_cap,
        })
    }

    /// Fit a squared-error regression tree.
    ///
    /// # Errors
    ///
    /// Same as [`fit_classifier`](Self::fit_classifier);
    /// [`TreeError::DegenerateTarget`] when every target is identical.
    #[instrument(skip_all, fields(n_samples = features.len(), kind = "regressor"))]
    pub fn fit_regressor(&self, features: &[Vec<f64>], targets: &[f64]) -> Result<DecisionTree, TreeError> {
        let n_features = self.validate(features, targets)?;

        if targets.iter().all(|&t| t == targets[0]) {
            return Err(TreeError::DegenerateTarget { n_distinct: 1 });
        }

        let view = Targets::Values(targets);
        let nodes = self.grow(features, &view, None, n_features);

        Ok(DecisionTree {
            nodes,
            n_features,
            kind: TreeKind::Regressor,
            output_cap: self.output_cap,
        })
    }

    /// Check data and config, returning the feature count.
    fn validate(&self, features: &[Vec<f64>], targets: &[f64]) -> Result<usize, TreeError> {
        if features.is_empty() {
            return Err(TreeError::EmptyDataset);
        }
        if targets.len() != features.len() {
            return Err(TreeError::TargetCountMismatch {
                samples: features.len(),
                targets: targets.len(),
            });
        }

        let n_features = features[0].len();
        if n_features == 0 {
            return Err(TreeError::ZeroFeatures);
        }

        for (sample_index, row) in features.iter().enumerate() {
            if row.len() != n_features {
                return Err(TreeError::FeatureCountMismatch {
                    expected: n_features,
                    got: row.len(),
                    sample_index,
                });
            }
            if let Some(feature_index) = row.iter().position(|v| !v.is_finite()) {
                return Err(TreeError::NonFiniteValue {
                    sample_index,
                    feature_index,
                });
            }
        }
        if let Some(sample_index) = targets.iter().position(|t| !t.is_finite()) {
            return Err(TreeError::NonFiniteTarget { sample_index });
        }

        if let Some(d) = self.max_depth
            && d == 0
        {
            return Err(TreeError::InvalidMaxDepth { max_depth: 0 });
        }
        if self.min_samples_split < 2 {
            return Err(TreeError::InvalidMinSamplesSplit {
                min_samples_split: self.min_samples_split,
            });
        }
        if self.min_samples_leaf < 1 {
            return Err(TreeError::InvalidMinSamplesLeaf {
                min_samples_leaf: self.min_samples_leaf,
            });
        }
        if let Some(m) = self.max_features
            && (m == 0 || m > n_features)
        {
            return Err(TreeError::InvalidMaxFeatures {
                max_features: m,
                n_features,
            });
        }
        if let Some(&feature) = self.forced_features.iter().find(|&&f| f >= n_features) {
            return Err(TreeError::ForcedFeatureOutOfRange { feature, n_features });
        }

        Ok(n_features)
    }

    fn grow(
        &self,
        features: &[Vec<f64>],
        targets: &Targets<'_>,
        classes: Option<&[f64]>,
        n_features: usize,
    ) -> Vec<Node> {
        // Column-major copy for the split scans.
        let col_features: Vec<Vec<f64>> = (0..n_features)
            .map(|feat_idx| features.iter().map(|row| row[feat_idx]).collect())
            .collect();

        let sample_indices: Vec<usize> = (0..features.len()).collect();
        let mut builder = Builder {
            config: self,
            col_features: &col_features,
            targets,
            classes,
            rng: ChaCha8Rng::seed_from_u64(self.seed),
            arena: Vec::new(),
        };
        builder.build(&sample_indices, 0);

        debug!(n_nodes = builder.arena.len(), n_features, "decision tree built");
        builder.arena
    }
}

impl Default for DecisionTreeConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Recursive arena builder state.
struct Builder<'a> {
    config: &'a DecisionTreeConfig,
    col_features: &'a [Vec<f64>],
    targets: &'a Targets<'a>,
    classes: Option<&'a [f64]>,
    rng: ChaCha8Rng,
    arena: Vec<Node>,
}

impl Builder<'_> {
    fn output(&self, sample_indices: &[usize]) -> LeafOutput {
        let total = sample_indices.len() as f64;
        match (*self.targets, self.classes) {
            (Targets::Classes { labels, n_classes, .. }, Some(classes)) => {
                let counts = class_counts(labels, sample_indices, n_classes);
                // First maximum wins, so ties go to the smallest class value.
                let mut majority = 0;
                for (label, &count) in counts.iter().enumerate() {
                    if count > counts[majority] {
                        majority = label;
                    }
                }
                LeafOutput::Class {
                    label: classes[majority],
                    proportions: counts.iter().map(|&c| c as f64 / total).collect(),
                }
            }
            (Targets::Values(values), _) => {
                LeafOutput::Mean(sample_indices.iter().map(|&si| values[si]).sum::<f64>() / total)
            }
            (Targets::Classes { .. }, None) => unreachable!("classification always carries classes"),
        }
    }

    fn push(&mut self, node: Node) -> NodeIndex {
        self.arena.push(node);
        NodeIndex::new(self.arena.len() - 1)
    }

    fn build(&mut self, sample_indices: &[usize], depth: usize) -> NodeIndex {
        let stats = NodeStats {
            impurity: self.targets.node_impurity(sample_indices),
            n_samples: sample_indices.len(),
        };
        let stop = stats.n_samples < self.config.min_samples_split
            || stats.impurity.value() <= PURE_TOLERANCE
            || self.config.max_depth.is_some_and(|limit| depth >= limit);

        let split = if stop {
            None
        } else {
            let candidates = candidate_features(
                self.col_features.len(),
                self.config.max_features,
                &self.config.forced_features,
                &mut self.rng,
            );
            find_best_split(
                self.col_features,
                self.targets,
                sample_indices,
                &candidates,
                self.config.min_samples_leaf,
            )
        };

        let output = self.output(sample_indices);
        let slot = self.push(Node::Leaf { output, stats });
        let Some(split) = split else {
            return slot;
        };

        // Children are appended after the parent's slot, which is then
        // turned into a branch.
        let left = self.build(&split.left_indices, depth + 1);
        let right = self.build(&split.right_indices, depth + 1);
        self.arena[slot.index()] = Node::Branch {
            feature: split.feature,
            threshold: split.threshold,
            left,
            right,
            stats,
            gain: split.gain,
        };
        slot
    }
}

/// What a fitted tree predicts.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum TreeKind {
    /// Predicts one of the sorted distinct training classes.
    Classifier {
        /// Class values, ascending.
        classes: Vec<f64>,
    },
    /// Predicts the mean response of a leaf.
    Regressor,
}

/// Binary CART tree stored as a node arena rooted at slot 0.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DecisionTree {
    pub(crate) nodes: Vec<Node>,
    pub(crate) n_features: usize,
    pub(crate) kind: TreeKind,
    pub(crate) output_cap: Option<f64>,
}

impl DecisionTree {
    /// Predict the target for a single sample.
    ///
    /// Goes left at a split when `sample[feature] <= threshold`. The leaf
    /// value is clamped to the output cap when one is set.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::PredictionFeatureMismatch`] when `sample.len() != n_features`.
    pub fn predict(&self, sample: &[f64]) -> Result<f64, TreeError> {
        if sample.len() != self.n_features {
            return Err(TreeError::PredictionFeatureMismatch {
                expected: self.n_features,
                got: sample.len(),
            });
        }
        let value = self.leaf(sample).value();
        Ok(match self.output_cap {
            Some(cap) => value.min(cap),
            None => value,
        })
    }

    /// Predict every row of a batch.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::PredictionFeatureMismatch`] on the first row with
    /// the wrong feature count.
    pub fn predict_batch(&self, samples: &[Vec<f64>]) -> Result<Vec<f64>, TreeError> {
        samples.iter().map(|s| self.predict(s)).collect()
    }

    /// Per-predictor mean decrease in impurity.
    ///
    /// Accumulates each branch's impurity gain by feature and
    /// normalizes the totals to sum to 1.0. All zeros for a single-leaf tree.
    #[must_use]
    pub fn feature_importances(&self) -> Vec<f64> {
        let mut totals = vec![0.0f64; self.n_features];
        for node in &self.nodes {
            if let Node::Branch { feature, gain, .. } = node {
                totals[feature.index()] += gain;
            }
        }
        let sum: f64 = totals.iter().sum();
        if sum > 0.0 {
            totals.iter_mut().for_each(|v| *v /= sum);
        }
        totals
    }

    /// Return what the tree predicts.
    #[must_use]
    pub fn kind(&self) -> &TreeKind {
        &self.kind
    }

    /// Return the number of features the tree was trained on.
    #[must_use]
    pub fn n_features(&self) -> usize {
        self.n_features
    }

    /// Return the prediction cap, if any.
    #[must_use]
    pub fn output_cap(&self) -> Option<f64> {
        self.output_cap
    }

    /// Return the total number of nodes (splits and leaves).
    #[must_use]
    pub fn n_nodes(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn n_leaves(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_leaf()).count()
    }

    /// Return the maximum depth of the tree; a lone root leaf has depth 0.
    #[must_use]
    pub fn depth(&self) -> usize {
        fn below(nodes: &[Node], slot: NodeIndex) -> usize {
            match &nodes[slot.index()] {
                Node::Leaf { .. } => 0,
                Node::Branch { left, right, .. } => 1 + below(nodes, *left).max(below(nodes, *right)),
            }
        }
        below(&self.nodes, NodeIndex::new(0))
    }

    /// Walk from the root to the leaf that `sample` falls in.
    fn leaf(&self, sample: &[f64]) -> &LeafOutput {
        let mut slot = 0usize;
        loop {
            match &self.nodes[slot] {
                Node::Leaf { output, .. } => return output,
                Node::Branch {
                    feature,
                    threshold,
                    left,
                    right,
                    ..
                } => {
                    let next = if sample[feature.index()] <= *threshold { left } else { right };
                    slot = next.index();
                }
            }
        }
    }
}
