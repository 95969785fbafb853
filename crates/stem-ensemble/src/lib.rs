//! Spatiotemporal ensemble core.
//!
//! Partitions a study area into overlapping support sets, trains one
//! decision tree per set in parallel, scores each set on its out-of-bag
//! samples, prunes unreliable sets, and rasterizes the kept sets into a
//! per-pixel OOB score map.
//!
//! Pipeline: [`GridConfig::generate`] -> [`SamplerConfig::sample`] ->
//! [`TrainingOrchestrator::run`] (calls [`TrainerConfig::train`] per set) ->
//! [`OobConfig::score`] -> [`ScoreMapConfig::map`].

mod domain;
mod drop_expr;
mod error;
mod grid;
mod oob;
mod orchestrator;
mod rng;
mod sampler;
mod score_map;
mod trainer;

pub use domain::{
    Bounds, DropReason, DroppedSet, Membership, ModelType, Role, Sample, SampleId, SampleTable, SetId,
    SetStatus, SupportSet, TrainedSet,
};
pub use drop_expr::{CompareOp, DropExpr};
pub use error::EnsembleError;
pub use grid::{GridConfig, SnapGrid};
pub use oob::{OobConfig, OobMetric, OobRecord, OobReport, SET_ATTRIBUTES, ScoredSet};
pub use orchestrator::{SetOutcome, TrainingOrchestrator, TrainingReport};
pub use sampler::{SampleOutcome, SamplerConfig, SetSample};
pub use score_map::{GeoTransform, NODATA, RasterExtent, ScoreMap, ScoreMapConfig, ScoredFootprint, Window};
pub use trainer::TrainerConfig;
