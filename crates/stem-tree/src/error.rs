use std::path::PathBuf;

/// Errors raised while fitting, querying, or persisting a [`DecisionTree`](crate::DecisionTree).
#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    // --- configuration ---
    #[error("tree depth limit of {max_depth} leaves no room for a split; use at least 1")]
    InvalidMaxDepth { max_depth: usize },

    #[error("a node needs at least 2 samples to split; min_samples_split is {min_samples_split}")]
    InvalidMinSamplesSplit { min_samples_split: usize },

    #[error("leaves must hold at least one sample; min_samples_leaf is {min_samples_leaf}")]
    InvalidMinSamplesLeaf { min_samples_leaf: usize },

    /// The per-split predictor draw must be between 1 and the predictor count.
    #[error("cannot draw {max_features} of {n_features} predictors per split")]
    InvalidMaxFeatures { max_features: usize, n_features: usize },

    /// An always-considered predictor column does not exist.
    #[error("forced predictor column {feature} does not exist ({n_features} predictors)")]
    ForcedFeatureOutOfRange { feature: usize, n_features: usize },

    // --- training data ---
    #[error("no training samples")]
    EmptyDataset,

    #[error("training rows carry no predictors")]
    ZeroFeatures,

    #[error("{targets} target values for {samples} training rows")]
    TargetCountMismatch { samples: usize, targets: usize },

    /// A training row is shorter or longer than the first row.
    #[error("training row {sample_index} has {got} predictors where row 0 has {expected}")]
    FeatureCountMismatch {
        expected: usize,
        got: usize,
        sample_index: usize,
    },

    #[error("predictor {feature_index} of training row {sample_index} is NaN or infinite")]
    NonFiniteValue { sample_index: usize, feature_index: usize },

    #[error("target of training row {sample_index} is NaN or infinite")]
    NonFiniteTarget { sample_index: usize },

    /// Nothing to learn: one class, or a constant response.
    #[error("target takes {n_distinct} distinct value(s); a tree needs at least 2")]
    DegenerateTarget { n_distinct: usize },

    // --- prediction ---
    #[error("query row has {got} predictors, the tree was fitted on {expected}")]
    PredictionFeatureMismatch { expected: usize, got: usize },

    // --- persistence ---
    #[error("could not encode tree")]
    SerializeModel { source: Box<bincode::ErrorKind> },

    #[error("{path} is not a readable tree file")]
    DeserializeModel {
        path: PathBuf,
        source: Box<bincode::ErrorKind>,
    },

    #[error("could not write tree file {path}")]
    WriteModel { path: PathBuf, source: std::io::Error },

    #[error("could not read tree file {path}")]
    ReadModel { path: PathBuf, source: std::io::Error },

    /// The file was written by a build with a different on-disk layout.
    #[error("tree file {path} has layout version {found}; this build reads version {expected}")]
    IncompatibleModelVersion {
        expected: u32,
        found: u32,
        path: PathBuf,
    },
}
