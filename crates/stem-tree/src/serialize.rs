//! One-file-per-tree persistence.
//!
//! Each file is a bincode-encoded [`TreeFile`]: a layout version checked on
//! load, a few header fields for logging, then the tree itself.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use tracing::{debug, instrument};

use crate::error::TreeError;
use crate::tree::{DecisionTree, TreeKind};

/// Bumped whenever [`Node`](crate::Node) or [`DecisionTree`] change shape.
const LAYOUT_VERSION: u32 = 2;

#[derive(serde::Serialize, serde::Deserialize)]
struct TreeFile<T> {
    layout_version: u32,
    classifier: bool,
    n_nodes: usize,
    tree: T,
}

impl DecisionTree {
    /// Write the tree to `path`, replacing any existing file.
    ///
    /// # Errors
    ///
    /// [`TreeError::WriteModel`] when the file cannot be created or flushed,
    /// [`TreeError::SerializeModel`] when encoding fails.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), TreeError> {
        let path = path.as_ref();
        let write_err = |source| TreeError::WriteModel {
            path: path.to_path_buf(),
            source,
        };

        let file = TreeFile {
            layout_version: LAYOUT_VERSION,
            classifier: matches!(self.kind, TreeKind::Classifier { .. }),
            n_nodes: self.nodes.len(),
            tree: self,
        };
        let mut out = BufWriter::new(File::create(path).map_err(write_err)?);
        bincode::serialize_into(&mut out, &file).map_err(|source| TreeError::SerializeModel { source })?;
        out.flush().map_err(write_err)?;

        debug!(n_nodes = file.n_nodes, "tree saved");
        Ok(())
    }

    /// Read a tree written by [`save`](Self::save).
    ///
    /// # Errors
    ///
    /// | Variant | When |
    /// |---|---|
    /// | [`TreeError::ReadModel`] | the file cannot be opened |
    /// | [`TreeError::DeserializeModel`] | the bytes are not a tree file |
    /// | [`TreeError::IncompatibleModelVersion`] | written with another layout version |
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TreeError> {
        let path = path.as_ref();
        let reader = File::open(path).map(BufReader::new).map_err(|source| TreeError::ReadModel {
            path: path.to_path_buf(),
            source,
        })?;
        let file: TreeFile<DecisionTree> =
            bincode::deserialize_from(reader).map_err(|source| TreeError::DeserializeModel {
                path: path.to_path_buf(),
                source,
            })?;

        if file.layout_version != LAYOUT_VERSION {
            return Err(TreeError::IncompatibleModelVersion {
                expected: LAYOUT_VERSION,
                found: file.layout_version,
                path: path.to_path_buf(),
            });
        }
        debug!(n_nodes = file.n_nodes, classifier = file.classifier, "tree loaded");
        Ok(file.tree)
    }
}
