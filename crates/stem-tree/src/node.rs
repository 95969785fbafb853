//! Arena nodes of a fitted tree.
//!
//! A tree is a flat `Vec<Node>` with the root at slot 0; branches point at
//! their children by [`NodeIndex`], so the arena round-trips through bincode
//! as plain data.

/// Column of a predictor in the feature matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct FeatureIndex(usize);

impl FeatureIndex {
    pub(crate) fn new(column: usize) -> Self {
        Self(column)
    }

    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

/// Slot of a node in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct NodeIndex(usize);

impl NodeIndex {
    pub(crate) fn new(slot: usize) -> Self {
        Self(slot)
    }

    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

/// Impurity of the samples at a node (Gini, entropy, or variance).
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, serde::Serialize, serde::Deserialize)]
pub struct Impurity(f64);

impl Impurity {
    pub(crate) fn new(value: f64) -> Self {
        Self(value)
    }

    #[must_use]
    pub fn value(self) -> f64 {
        self.0
    }
}

/// Training statistics shared by branches and leaves.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct NodeStats {
    pub impurity: Impurity,
    /// Training samples that reached the node.
    pub n_samples: usize,
}

/// Prediction stored at a leaf.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum LeafOutput {
    /// Majority class of the leaf. `proportions` follows the tree's sorted
    /// class list.
    Class { label: f64, proportions: Vec<f64> },
    /// Mean response of the leaf.
    Mean(f64),
}

impl LeafOutput {
    /// The value a prediction returns before any output cap.
    #[must_use]
    pub fn value(&self) -> f64 {
        match self {
            LeafOutput::Class { label, .. } => *label,
            LeafOutput::Mean(mean) => *mean,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Node {
    /// Routes a sample to `left` when `sample[feature] <= threshold`.
    Branch {
        feature: FeatureIndex,
        threshold: f64,
        left: NodeIndex,
        right: NodeIndex,
        stats: NodeStats,
        /// Sample-weighted impurity reduction; feeds the MDI importances.
        gain: f64,
    },
    Leaf {
        output: LeafOutput,
        stats: NodeStats,
    },
}

impl Node {
    #[must_use]
    pub fn stats(&self) -> NodeStats {
        match self {
            Node::Branch { stats, .. } | Node::Leaf { stats, .. } => *stats,
        }
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf { .. })
    }
}
