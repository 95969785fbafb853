//! I/O error types for stem-io.

use std::path::PathBuf;

use stem_ensemble::EnsembleError;

/// Errors from parameter files, sample tables, rasters, the run store, and
/// run artifacts.
#[derive(Debug, thiserror::Error)]
pub enum IoError {
    /// Returned when an input file does not exist or is unreadable.
    #[error("cannot open {path}")]
    FileNotFound {
        /// Offending path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Returned when the parameter file is not valid TOML or has unknown,
    /// missing, or mistyped keys.
    #[error("invalid parameter file {path}")]
    ParseParams {
        /// Path to the parameter file.
        path: PathBuf,
        /// Underlying TOML error (names the offending key).
        source: toml::de::Error,
    },

    /// Returned when a parameter value is out of range or inconsistent.
    #[error("invalid parameter `{field}`: {message}")]
    InvalidParam {
        /// Parameter name.
        field: &'static str,
        /// What is wrong with it.
        message: String,
    },

    /// Returned when a path-valued parameter names a file that does not exist.
    #[error("parameter `{field}` points to a missing path: {path}")]
    PathNotFound {
        /// Parameter name.
        field: &'static str,
        /// The missing path.
        path: PathBuf,
    },

    /// Returned when a tab-separated table has a malformed record.
    #[error("malformed table {path} near byte {offset}")]
    CsvParse {
        /// Path to the table.
        path: PathBuf,
        /// Byte position reported by the parser.
        offset: u64,
        /// Underlying CSV error.
        source: csv::Error,
    },

    /// Returned when a table contains a header but zero data rows.
    #[error("{path} has a header but no rows")]
    EmptyDataset {
        /// Path to the table.
        path: PathBuf,
    },

    /// Returned when a required column is absent from a table header.
    #[error("column \"{column}\" not found in {path}")]
    MissingColumn {
        /// Path to the table.
        path: PathBuf,
        /// The missing column name.
        column: String,
    },

    /// Returned when variable names match no sample column.
    #[error("variables in {path} match no sample column: {}", names.join(", "))]
    UnmatchedVarNames {
        /// Path to the variable table.
        path: PathBuf,
        /// Every unmatched name.
        names: Vec<String>,
    },

    /// Returned when a row is wider or narrower than the header.
    #[error("inconsistent row length in {path}: row {row_index} has {got} columns, expected {expected}")]
    InconsistentRowLength {
        /// Path to the table.
        path: PathBuf,
        /// Data row, zero-based, header excluded.
        row_index: usize,
        /// Header width.
        expected: usize,
        /// Row width.
        got: usize,
    },

    /// Returned when a numeric cell does not parse to a finite number.
    #[error("non-finite value in {path}: row {row_index}, column \"{column}\", raw value \"{raw}\"")]
    NonFiniteValue {
        /// Path to the table.
        path: PathBuf,
        /// Data row, zero-based, header excluded.
        row_index: usize,
        /// Column name.
        column: String,
        /// Cell text as read.
        raw: String,
    },

    /// Returned when an `obs_id` cell is not a non-negative integer.
    #[error("invalid sample id in {path}: row {row_index}, raw value \"{raw}\"")]
    InvalidSampleId {
        /// Path to the table.
        path: PathBuf,
        /// Data row, zero-based, header excluded.
        row_index: usize,
        /// The raw string value.
        raw: String,
    },

    /// Returned when the same sample id appears more than once.
    #[error("duplicate sample id {sample_id} in {path}: first at row {first_row}, again at row {second_row}")]
    DuplicateSampleId {
        /// Path to the table.
        path: PathBuf,
        /// The duplicated id.
        sample_id: u64,
        /// Row that first used the id.
        first_row: usize,
        /// Row that repeated it.
        second_row: usize,
    },

    /// Returned when a raster cannot be decoded or encoded.
    #[error("TIFF error in {path}")]
    Tiff {
        /// Path to the raster.
        path: PathBuf,
        /// Underlying TIFF error.
        source: tiff::TiffError,
    },

    /// Returned when a mosaic has a sample format the reader does not handle.
    #[error("unsupported pixel type {kind} in {path}")]
    UnsupportedPixelType {
        /// Path to the raster.
        path: PathBuf,
        /// Decoded sample format.
        kind: String,
    },

    /// Returned when neither GeoTIFF tags nor a world file locate the mosaic.
    #[error("no georeferencing for {path}: {message}")]
    Georeference {
        /// Path to the raster.
        path: PathBuf,
        /// What was missing or malformed.
        message: String,
    },

    /// Returned when the run store cannot be opened, written, or queried.
    #[error("run store error in {path}")]
    Store {
        /// Path to the SQLite file.
        path: PathBuf,
        /// Underlying SQLite error.
        source: rusqlite::Error,
    },

    /// Returned when a stored row holds a value the reader cannot interpret.
    #[error("corrupt run store {path}: {message}")]
    StoreContent {
        /// Path to the SQLite file.
        path: PathBuf,
        /// What was wrong.
        message: String,
    },

    /// Returned when a run or model directory cannot be created.
    #[error("cannot create directory {path}")]
    OutputDirCreate {
        /// Offending path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Returned when a run directory with the same stamp is already on disk.
    #[error("run directory {path} already exists; refusing to overwrite an earlier run")]
    RunDirExists {
        /// The existing run directory.
        path: PathBuf,
    },

    /// Returned when a run artifact cannot be written.
    #[error("cannot write {path}")]
    WriteFile {
        /// Offending path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Returned when a table row cannot be serialized.
    #[error("cannot write table {path}")]
    CsvWrite {
        /// Offending path.
        path: PathBuf,
        /// Underlying CSV error.
        source: csv::Error,
    },

    /// Returned when GeoJSON serialization fails.
    #[error("cannot serialize {path}")]
    Json {
        /// Offending path.
        path: PathBuf,
        /// Underlying JSON error.
        source: serde_json::Error,
    },

    /// Returned when loaded data violates a core invariant.
    #[error(transparent)]
    Ensemble(#[from] EnsembleError),
}
