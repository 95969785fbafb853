//! Parameter files, sample tables, rasters, and the run store for stem.

mod error;
mod params;
mod raster;
mod records;
mod sample_reader;
mod store;
mod writer;

pub use error::IoError;
pub use params::{ParamFile, RunConfig};
pub use raster::{Mosaic, ScoreRasterPaths, read_mosaic, write_score_map};
pub use records::{SetRecord, collect_records, unscored_records};
pub use sample_reader::{OBS_ID_COL, SampleData, SampleReader, VAR_NAME_COL, read_var_names};
pub use store::{RunStore, StoredSets};
pub use writer::{
    InventoryRow, KEPT_GEOJSON, LOW_OOB_GEOJSON, MODEL_DIR, RunWriter, SUPPORT_SETS_TXT, update_inventory,
};
