use stem_tree::TreeError;

use crate::domain::{SampleId, SetId};

/// Errors from support-set generation, training, OOB scoring, and mapping.
#[derive(Debug, thiserror::Error)]
pub enum EnsembleError {
    /// Returned when a cell or support dimension is not a positive finite number.
    #[error("{name} must be positive and finite, got ({x}, {y})")]
    InvalidSize {
        /// Which size was invalid (`cell_size` or `support_size`).
        name: &'static str,
        /// The x extent provided.
        x: f64,
        /// The y extent provided.
        y: f64,
    },

    /// Returned when a footprint would be smaller than its cell on one axis.
    #[error("support_size {axis} ({support}) must be at least cell_size {axis} ({cell})")]
    SupportSmallerThanCell {
        /// `"x"` or `"y"`.
        axis: &'static str,
        /// Support size along that axis.
        support: f64,
        /// Cell size along that axis.
        cell: f64,
    },

    /// Returned when sets_per_cell is zero.
    #[error("sets_per_cell must be at least 1")]
    InvalidSetsPerCell,

    /// Returned when min_obs is zero.
    #[error("min_obs must be at least 1")]
    InvalidMinObs,

    /// Returned when the snap resolution is not positive.
    #[error("snap resolution must be positive and finite, got {resolution}")]
    InvalidResolution {
        /// The resolution provided.
        resolution: f64,
    },

    /// Returned when snapping is on and a size is not a whole number of lattice steps.
    #[error("{name} ({x}, {y}) must be a multiple of the snap resolution {resolution}")]
    SizeOffLattice {
        /// `cell_size` or `support_size`.
        name: &'static str,
        x: f64,
        y: f64,
        resolution: f64,
    },

    /// Returned when the study-area extent is empty or inverted.
    #[error("study-area extent is empty: ({min_x}, {min_y}) - ({max_x}, {max_y})")]
    EmptyExtent {
        /// Minimum x.
        min_x: f64,
        /// Minimum y.
        min_y: f64,
        /// Maximum x.
        max_x: f64,
        /// Maximum y.
        max_y: f64,
    },

    /// Returned when pct_train is outside (0, 1].
    #[error("pct_train must be in (0.0, 1.0], got {pct_train}")]
    InvalidPctTrain {
        /// The value provided.
        pct_train: f64,
    },

    /// Returned when min_per_class is requested for a regressor.
    #[error("min_per_class only applies to classifier models")]
    MinPerClassForRegressor,

    /// Returned when n_jobs is zero.
    #[error("n_jobs must be at least 1")]
    InvalidJobCount,

    /// Returned when the tile grid has a zero dimension.
    #[error("n_tiles must be at least 1 x 1, got {rows} x {cols}")]
    InvalidTileCount {
        /// Tile rows requested.
        rows: usize,
        /// Tile columns requested.
        cols: usize,
    },

    /// Returned when two samples share an id.
    #[error("duplicate sample id {sample_id}")]
    DuplicateSampleId {
        /// The repeated id.
        sample_id: SampleId,
    },

    /// Returned when a sample's predictor vector has the wrong length.
    #[error("sample {sample_id} has {got} predictors, expected {expected}")]
    SamplePredictorMismatch {
        /// The offending sample.
        sample_id: SampleId,
        /// Number of predictor names.
        expected: usize,
        /// Length of the sample's vector.
        got: usize,
    },

    /// Returned when a membership row references a sample that is not loaded.
    #[error("set {set_id} references unknown sample {sample_id}")]
    UnknownSample {
        /// The set holding the membership row.
        set_id: SetId,
        /// The missing sample.
        sample_id: SampleId,
    },

    /// Returned when fitting a set's estimator fails.
    #[error("failed to fit estimator for set {set_id}")]
    Fit {
        /// The set being trained.
        set_id: SetId,
        /// The underlying tree error.
        source: TreeError,
    },

    /// Returned when a fitted estimator cannot be written.
    #[error("failed to persist estimator for set {set_id}")]
    SaveEstimator {
        /// The set being trained.
        set_id: SetId,
        /// The underlying tree error.
        source: TreeError,
    },

    /// Returned when predicting OOB samples fails.
    #[error("failed to predict OOB samples for set {set_id}")]
    Predict {
        /// The set being scored.
        set_id: SetId,
        /// The underlying tree error.
        source: TreeError,
    },

    /// Returned when the worker pool cannot be created.
    #[error("failed to build a worker pool with {n_jobs} threads")]
    ThreadPool {
        /// Requested thread count.
        n_jobs: usize,
        /// The underlying rayon error.
        source: rayon::ThreadPoolBuildError,
    },

    /// Returned when every support set was dropped before or during training.
    #[error("no support set trained successfully ({n_sets} generated, {n_dropped} dropped)")]
    NoSetsTrained {
        /// Number of sets generated.
        n_sets: usize,
        /// Number of sets dropped.
        n_dropped: usize,
    },

    /// Returned when a drop expression cannot be parsed.
    #[error("invalid drop expression \"{expr}\" at offset {position}: {message}")]
    DropExpressionSyntax {
        /// The full expression text.
        expr: String,
        /// Byte offset of the problem.
        position: usize,
        /// What went wrong.
        message: String,
    },

    /// Returned when a drop expression names a column a set does not have.
    #[error("drop expression references unknown column \"{column}\" (set {set_id})")]
    UnknownDropColumn {
        /// The set being evaluated.
        set_id: SetId,
        /// The unresolved column name.
        column: String,
    },

    /// Returned when a raster is empty or not north-up.
    #[error("unsupported raster grid: {width} x {height}, pixel size ({pixel_width}, {pixel_height})")]
    InvalidRasterGrid {
        /// Columns.
        width: usize,
        /// Rows.
        height: usize,
        /// Pixel width (must be positive).
        pixel_width: f64,
        /// Pixel height (must be negative).
        pixel_height: f64,
    },

    /// Returned when the mask length does not match the raster size.
    #[error("mask has {got} pixels, raster has {expected}")]
    MaskSizeMismatch {
        /// width * height.
        expected: usize,
        /// Mask length.
        got: usize,
    },
}
