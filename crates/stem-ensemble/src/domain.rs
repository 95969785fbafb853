//! Domain types shared by every stage of the pipeline.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use stem_tree::DecisionTree;

use crate::EnsembleError;

/// Unique identifier of a training sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct SampleId(u64);

impl SampleId {
    /// Wrap a raw sample id.
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Return the raw id.
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SampleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Globally unique, stable identifier of a support set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct SetId(u64);

impl SetId {
    /// Wrap a raw set id.
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Return the raw id.
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Axis-aligned rectangle in map units (y increases northward).
///
/// A point is inside when `min_x <= x < max_x` and `min_y < y <= max_y`,
/// so footprints sharing an edge never both claim a point on it.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Bounds {
    /// Western edge (upper-left x).
    pub min_x: f64,
    /// Southern edge (lower-right y).
    pub min_y: f64,
    /// Eastern edge (lower-right x).
    pub max_x: f64,
    /// Northern edge (upper-left y).
    pub max_y: f64,
}

impl Bounds {
    /// Build bounds from upper-left and lower-right corners.
    #[must_use]
    pub fn from_corners(ul_x: f64, ul_y: f64, lr_x: f64, lr_y: f64) -> Self {
        Self {
            min_x: ul_x,
            min_y: lr_y,
            max_x: lr_x,
            max_y: ul_y,
        }
    }

    /// Return `true` if the point lies inside under the half-open rule.
    #[must_use]
    pub fn contains(&self, x: f64, y: f64) -> bool {
        self.min_x <= x && x < self.max_x && self.min_y < y && y <= self.max_y
    }

    /// Return `true` if the two rectangles share interior area.
    #[must_use]
    pub fn intersects(&self, other: &Bounds) -> bool {
        self.min_x < other.max_x && other.min_x < self.max_x && self.min_y < other.max_y && other.min_y < self.max_y
    }

    /// Return `true` if `other` lies entirely inside `self`.
    #[must_use]
    pub fn encloses(&self, other: &Bounds) -> bool {
        self.min_x <= other.min_x && other.max_x <= self.max_x && self.min_y <= other.min_y && other.max_y <= self.max_y
    }

    /// Return `true` when the rectangle has positive, finite area.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        [self.min_x, self.min_y, self.max_x, self.max_y].iter().all(|v| v.is_finite())
            && self.min_x < self.max_x
            && self.min_y < self.max_y
    }

    /// Width in map units.
    #[must_use]
    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    /// Height in map units.
    #[must_use]
    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }
}

/// Whether per-set estimators classify or regress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    /// Decision tree classifier; OOB metric is the misclassification rate.
    Classifier,
    /// Decision tree regressor; OOB metric is the mean absolute error.
    Regressor,
}

impl ModelType {
    /// Lowercase name as used in parameter files.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ModelType::Classifier => "classifier",
            ModelType::Regressor => "regressor",
        }
    }
}

impl FromStr for ModelType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "classifier" => Ok(ModelType::Classifier),
            "regressor" => Ok(ModelType::Regressor),
            other => Err(format!("unknown model type \"{other}\" (expected classifier or regressor)")),
        }
    }
}

/// One observation: id, location, predictors, and target.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Unique id.
    pub id: SampleId,
    /// Easting.
    pub x: f64,
    /// Northing.
    pub y: f64,
    /// Predictor values, ordered as [`SampleTable::predictor_names`].
    pub predictors: Vec<f64>,
    /// Target value (class code or response).
    pub target: f64,
}

/// The read-only sample collection shared by every worker.
///
/// Keeps an x-sorted index so footprint queries touch only the samples in
/// the footprint's x range.
#[derive(Debug)]
pub struct SampleTable {
    predictor_names: Vec<String>,
    target_name: String,
    samples: Vec<Sample>,
    by_x: Vec<usize>,
    by_id: HashMap<SampleId, usize>,
}

impl SampleTable {
    /// Build a table, checking id uniqueness and predictor vector lengths.
    ///
    /// # Errors
    ///
    /// | Variant | Condition |
    /// |---|---|
    /// | [`EnsembleError::DuplicateSampleId`] | two samples share an id |
    /// | [`EnsembleError::SamplePredictorMismatch`] | a predictor vector has the wrong length |
    pub fn new(
        predictor_names: Vec<String>,
        target_name: String,
        samples: Vec<Sample>,
    ) -> Result<Self, EnsembleError> {
        let mut by_id = HashMap::with_capacity(samples.len());
        for (idx, sample) in samples.iter().enumerate() {
            if sample.predictors.len() != predictor_names.len() {
                return Err(EnsembleError::SamplePredictorMismatch {
                    sample_id: sample.id,
                    expected: predictor_names.len(),
                    got: sample.predictors.len(),
                });
            }
            if by_id.insert(sample.id, idx).is_some() {
                return Err(EnsembleError::DuplicateSampleId { sample_id: sample.id });
            }
        }

        let mut by_x: Vec<usize> = (0..samples.len()).collect();
        by_x.sort_by(|&a, &b| samples[a].x.total_cmp(&samples[b].x).then(a.cmp(&b)));

        Ok(Self {
            predictor_names,
            target_name,
            samples,
            by_x,
            by_id,
        })
    }

    /// Return the predictor column names.
    #[must_use]
    pub fn predictor_names(&self) -> &[String] {
        &self.predictor_names
    }

    /// Return the target column name.
    #[must_use]
    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    /// Return all samples in load order.
    #[must_use]
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Return the number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Return `true` if the table holds no samples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Look up a sample's position by id.
    #[must_use]
    pub fn index_of(&self, id: SampleId) -> Option<usize> {
        self.by_id.get(&id).copied()
    }

    /// Largest target value, or `None` for an empty table.
    #[must_use]
    pub fn max_target(&self) -> Option<f64> {
        self.samples.iter().map(|s| s.target).reduce(f64::max)
    }

    /// Positions of the samples inside `bounds`, ascending.
    #[must_use]
    pub fn enclosed(&self, bounds: &Bounds) -> Vec<usize> {
        let start = self.by_x.partition_point(|&i| self.samples[i].x < bounds.min_x);
        let end = self.by_x.partition_point(|&i| self.samples[i].x < bounds.max_x);
        let mut inside: Vec<usize> = self.by_x[start..end]
            .iter()
            .copied()
            .filter(|&i| bounds.contains(self.samples[i].x, self.samples[i].y))
            .collect();
        inside.sort_unstable();
        inside
    }
}

/// A generated support-set footprint, before any training.
#[derive(Debug, Clone, PartialEq)]
pub struct SupportSet {
    /// Stable, globally unique id.
    pub id: SetId,
    /// Footprint rectangle.
    pub bounds: Bounds,
    /// Minimum enclosed samples required to train.
    pub min_obs: usize,
    /// Per-split feature subsample size for this set's estimator.
    pub max_features: Option<usize>,
}

/// Role a sample plays within one support set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Used to fit the set's estimator.
    Train,
    /// Held out and used to score the set.
    Oob,
}

impl Role {
    /// Lowercase name as stored in the run store.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Train => "train",
            Role::Oob => "oob",
        }
    }
}

/// One row of the sample/set relationship table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Membership {
    /// The sample.
    pub sample_id: SampleId,
    /// The set it belongs to.
    pub set_id: SetId,
    /// Its role within that set.
    pub role: Role,
}

/// A support set with a fitted, persisted estimator.
#[derive(Debug, Clone)]
pub struct TrainedSet {
    /// The footprint this estimator covers.
    pub set: SupportSet,
    /// Samples enclosed by the footprint.
    pub n_samples: usize,
    /// Distinct samples with the train role.
    pub n_train: usize,
    /// Samples with the OOB role.
    pub n_oob: usize,
    /// Where the estimator was written.
    pub dt_file: PathBuf,
    /// MDI importance per predictor, in predictor order.
    pub importances: Vec<f64>,
    /// The fitted estimator.
    pub estimator: DecisionTree,
}

/// Why a set was dropped before it received an estimator.
#[derive(Debug, Clone, PartialEq)]
pub enum DropReason {
    /// Fewer enclosed samples than the set's `min_obs`.
    Insufficient {
        /// Samples inside the footprint.
        enclosed: usize,
        /// Threshold that was not met.
        min_obs: usize,
    },
    /// Fitting or persisting the estimator failed.
    Failed {
        /// Samples inside the footprint.
        enclosed: usize,
        /// Rendered error chain.
        message: String,
    },
}

/// A set that never received an estimator.
#[derive(Debug, Clone, PartialEq)]
pub struct DroppedSet {
    /// The footprint.
    pub set: SupportSet,
    /// Why it was dropped.
    pub reason: DropReason,
}

impl DroppedSet {
    /// Samples that were inside the footprint.
    #[must_use]
    pub fn enclosed(&self) -> usize {
        match self.reason {
            DropReason::Insufficient { enclosed, .. } | DropReason::Failed { enclosed, .. } => enclosed,
        }
    }
}

/// Lifecycle state of a set as persisted in the run store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetStatus {
    /// Trained, scored, and retained.
    Kept,
    /// Trained and scored, then separated by the OOB drop policy.
    LowOob,
    /// Trained but had no OOB samples to score it.
    Unscored,
    /// Dropped for having fewer than `min_obs` samples.
    Insufficient,
    /// Dropped because fitting failed.
    Failed,
}

impl SetStatus {
    /// Lowercase name as stored in the run store.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SetStatus::Kept => "kept",
            SetStatus::LowOob => "low_oob",
            SetStatus::Unscored => "unscored",
            SetStatus::Insufficient => "insufficient",
            SetStatus::Failed => "failed",
        }
    }
}

impl FromStr for SetStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "kept" => Ok(SetStatus::Kept),
            "low_oob" => Ok(SetStatus::LowOob),
            "unscored" => Ok(SetStatus::Unscored),
            "insufficient" => Ok(SetStatus::Insufficient),
            "failed" => Ok(SetStatus::Failed),
            other => Err(format!("unknown set status \"{other}\"")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: u64, x: f64, y: f64) -> Sample {
        Sample {
            id: SampleId::new(id),
            x,
            y,
            predictors: vec![0.0],
            target: 1.0,
        }
    }

    #[test]
    fn bounds_half_open_membership() {
        let b = Bounds::from_corners(0.0, 10.0, 10.0, 0.0);
        assert!(b.contains(0.0, 10.0));
        assert!(!b.contains(10.0, 5.0));
        assert!(!b.contains(5.0, 0.0));
        assert!(b.contains(9.999, 0.001));
    }

    #[test]
    fn adjacent_bounds_do_not_intersect() {
        let a = Bounds::from_corners(0.0, 10.0, 10.0, 0.0);
        let b = Bounds::from_corners(10.0, 10.0, 20.0, 0.0);
        assert!(!a.intersects(&b));
        assert!(a.intersects(&Bounds::from_corners(9.0, 5.0, 12.0, 4.0)));
    }

    #[test]
    fn enclosed_uses_x_index_and_y_filter() {
        let table = SampleTable::new(
            vec!["p".into()],
            "t".into(),
            vec![
                sample(1, 5.0, 5.0),
                sample(2, 15.0, 5.0),
                sample(3, 2.0, 50.0),
                sample(4, 0.0, 1.0),
            ],
        )
        .unwrap();
        let b = Bounds::from_corners(0.0, 10.0, 10.0, 0.0);
        assert_eq!(table.enclosed(&b), vec![0, 3]);
    }

    #[test]
    fn duplicate_sample_ids_rejected() {
        let err = SampleTable::new(vec!["p".into()], "t".into(), vec![sample(1, 0.0, 0.0), sample(1, 1.0, 1.0)])
            .unwrap_err();
        assert!(matches!(err, EnsembleError::DuplicateSampleId { .. }));
    }

    #[test]
    fn model_type_parses_case_insensitively() {
        assert_eq!("Classifier".parse::<ModelType>().unwrap(), ModelType::Classifier);
        assert!("forest".parse::<ModelType>().is_err());
    }
}
