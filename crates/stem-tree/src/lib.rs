//! CART decision trees for per-support-set estimation.
//!
//! Provides a classification tree (Gini/Entropy) and a squared-error
//! regression tree with per-split feature subsampling, Mean Decrease in
//! Impurity importances, and versioned bincode persistence.

mod error;
mod node;
mod serialize;
mod split;
mod tree;

pub use error::TreeError;
pub use node::{FeatureIndex, Impurity, LeafOutput, Node, NodeIndex, NodeStats};
pub use split::SplitCriterion;
pub use tree::{DecisionTree, DecisionTreeConfig, TreeKind};
