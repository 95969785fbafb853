//! One estimator per support set.

use std::path::{Path, PathBuf};

use rand::Rng;
use stem_tree::{DecisionTree, DecisionTreeConfig, SplitCriterion};
use tracing::{debug, instrument};

use crate::domain::{Membership, ModelType, Role, SampleTable, SetId, SupportSet, TrainedSet};
use crate::rng::{Purpose, stream_rng};
use crate::sampler::SetSample;
use crate::EnsembleError;

/// Configuration for fitting and persisting per-set estimators.
///
/// # Defaults
///
/// | Parameter | Default |
/// |---|---|
/// | `forced_features` | none |
/// | `output_cap` | `None` |
/// | `max_depth` | `None` (unlimited) |
/// | `min_samples_leaf` | `1` |
/// | `file_prefix` | `"stem"` |
/// | `seed` | `42` |
#[derive(Debug, Clone)]
pub struct TrainerConfig {
    model_type: ModelType,
    model_dir: PathBuf,
    file_prefix: String,
    forced_features: Vec<usize>,
    output_cap: Option<f64>,
    max_depth: Option<usize>,
    min_samples_leaf: usize,
    seed: u64,
}

impl TrainerConfig {
    /// Create a trainer writing estimators into `model_dir`.
    #[must_use]
    pub fn new(model_type: ModelType, model_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_type,
            model_dir: model_dir.into(),
            file_prefix: "stem".to_string(),
            forced_features: Vec::new(),
            output_cap: None,
            max_depth: None,
            min_samples_leaf: 1,
            seed: 42,
        }
    }

    /// Set the estimator file name prefix (the run stamp).
    #[must_use]
    pub fn with_file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.file_prefix = prefix.into();
        self
    }

    /// Predictor positions considered at every split regardless of `max_features`.
    #[must_use]
    pub fn with_forced_features(mut self, forced_features: Vec<usize>) -> Self {
        self.forced_features = forced_features;
        self
    }

    /// Upper bound applied to every prediction.
    #[must_use]
    pub fn with_output_cap(mut self, output_cap: Option<f64>) -> Self {
        self.output_cap = output_cap;
        self
    }

    /// Limit tree depth.
    #[must_use]
    pub fn with_max_depth(mut self, max_depth: Option<usize>) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Minimum samples per leaf.
    #[must_use]
    pub fn with_min_samples_leaf(mut self, min_samples_leaf: usize) -> Self {
        self.min_samples_leaf = min_samples_leaf;
        self
    }

    /// Set the run seed that per-set tree seeds derive from.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Return the model type.
    #[must_use]
    pub fn model_type(&self) -> ModelType {
        self.model_type
    }

    /// Return the estimator directory.
    #[must_use]
    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    /// Path the estimator for `set_id` is written to.
    #[must_use]
    pub fn model_path(&self, set_id: SetId) -> PathBuf {
        self.model_dir
            .join(format!("{}_decisiontree_{}.bin", self.file_prefix, set_id))
    }

    /// Fit one set's estimator, persist it, and emit its membership rows.
    ///
    /// # Errors
    ///
    /// | Variant | Condition |
    /// |---|---|
    /// | [`EnsembleError::Fit`] | the tree rejected the data (e.g. one class) |
    /// | [`EnsembleError::SaveEstimator`] | the estimator file could not be written |
    #[instrument(skip_all, fields(set_id = %set.id, n_fit = split.fit.len()))]
    pub fn train(
        &self,
        set: &SupportSet,
        split: &SetSample,
        samples: &SampleTable,
    ) -> Result<(TrainedSet, Vec<Membership>), EnsembleError> {
        let rows = samples.samples();
        let features: Vec<Vec<f64>> = split.fit.iter().map(|&i| rows[i].predictors.clone()).collect();
        let targets: Vec<f64> = split.fit.iter().map(|&i| rows[i].target).collect();

        let tree_seed = stream_rng(self.seed, Purpose::Tree, set.id.get()).r#gen();
        let config = DecisionTreeConfig::new()
            .with_max_depth(self.max_depth)
            .with_min_samples_leaf(self.min_samples_leaf)
            .with_max_features(set.max_features)
            .with_forced_features(self.forced_features.clone())
            .with_output_cap(self.output_cap)
            .with_seed(tree_seed);

        let fitted = match self.model_type {
            ModelType::Classifier => config
                .with_criterion(SplitCriterion::Gini)
                .fit_classifier(&features, &targets),
            ModelType::Regressor => config.fit_regressor(&features, &targets),
        };
        let estimator: DecisionTree = fitted.map_err(|source| EnsembleError::Fit {
            set_id: set.id,
            source,
        })?;

        let dt_file = self.model_path(set.id);
        estimator.save(&dt_file).map_err(|source| EnsembleError::SaveEstimator {
            set_id: set.id,
            source,
        })?;

        let memberships: Vec<Membership> = split
            .train
            .iter()
            .map(|&i| (i, Role::Train))
            .chain(split.oob.iter().map(|&i| (i, Role::Oob)))
            .map(|(i, role)| Membership {
                sample_id: rows[i].id,
                set_id: set.id,
                role,
            })
            .collect();

        debug!(
            n_train = split.train.len(),
            n_oob = split.oob.len(),
            n_nodes = estimator.n_nodes(),
            "set trained"
        );

        let trained = TrainedSet {
            set: set.clone(),
            n_samples: split.enclosed(),
            n_train: split.train.len(),
            n_oob: split.oob.len(),
            dt_file,
            importances: estimator.feature_importances(),
            estimator,
        };
        Ok((trained, memberships))
    }
}
