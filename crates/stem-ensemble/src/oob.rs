//! Out-of-bag scoring and the per-set drop policy.

use std::collections::HashMap;
use std::str::FromStr;

use rayon::prelude::*;
use tracing::{debug, info, instrument};

use crate::domain::{Membership, ModelType, Role, SampleId, SampleTable, SetId, TrainedSet};
use crate::drop_expr::DropExpr;
use crate::score_map::ScoredFootprint;
use crate::EnsembleError;

/// OOB statistics of one set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OobRecord {
    /// Misclassification fraction (classifier) or mean absolute error (regressor).
    pub oob_rate: f64,
    /// OOB samples the rate was computed from. Always at least 1.
    pub oob_count: usize,
}

/// Which OOB statistic a score map averages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OobMetric {
    /// [`OobRecord::oob_rate`].
    OobRate,
    /// [`OobRecord::oob_count`].
    OobCount,
}

impl OobMetric {
    /// Column name of the metric.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            OobMetric::OobRate => "oob_rate",
            OobMetric::OobCount => "oob_count",
        }
    }
}

impl FromStr for OobMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "oob_rate" => Ok(OobMetric::OobRate),
            "oob_count" => Ok(OobMetric::OobCount),
            other => Err(format!("unknown OOB metric \"{other}\" (expected oob_rate or oob_count)")),
        }
    }
}

impl OobRecord {
    /// Value of the selected metric.
    #[must_use]
    pub fn metric(&self, metric: OobMetric) -> f64 {
        match metric {
            OobMetric::OobRate => self.oob_rate,
            OobMetric::OobCount => self.oob_count as f64,
        }
    }
}

/// Set attributes a drop expression can name, besides `importance_<predictor>`.
pub const SET_ATTRIBUTES: [&str; 9] = [
    "oob_rate", "oob_count", "n_samples", "n_train", "ul_x", "ul_y", "lr_x", "lr_y", "set_id",
];

fn resolvable(column: &str, predictor_names: &[String]) -> bool {
    SET_ATTRIBUTES.contains(&column)
        || column
            .strip_prefix("importance_")
            .is_some_and(|name| predictor_names.iter().any(|p| p == name))
}

/// A trained set with its OOB record attached.
#[derive(Debug, Clone)]
pub struct ScoredSet {
    /// The trained set.
    pub trained: TrainedSet,
    /// Its OOB statistics.
    pub oob: OobRecord,
}

impl ScoredSet {
    /// Resolve a drop-expression column for this set.
    ///
    /// Recognized: `oob_rate`, `oob_count`, `n_samples`, `n_train`, `ul_x`,
    /// `ul_y`, `lr_x`, `lr_y`, `set_id`, and `importance_<predictor>`.
    #[must_use]
    pub fn attribute(&self, column: &str, predictor_names: &[String]) -> Option<f64> {
        let t = &self.trained;
        let b = &t.set.bounds;
        Some(match column {
            "oob_rate" => self.oob.oob_rate,
            "oob_count" => self.oob.oob_count as f64,
            "n_samples" => t.n_samples as f64,
            "n_train" => t.n_train as f64,
            "ul_x" => b.min_x,
            "ul_y" => b.max_y,
            "lr_x" => b.max_x,
            "lr_y" => b.min_y,
            "set_id" => t.set.id.get() as f64,
            other => {
                let name = other.strip_prefix("importance_")?;
                let pos = predictor_names.iter().position(|p| p == name)?;
                *t.importances.get(pos)?
            }
        })
    }

    /// Footprint and metric value for score mapping.
    #[must_use]
    pub fn footprint(&self, metric: OobMetric) -> ScoredFootprint {
        ScoredFootprint {
            set_id: self.trained.set.id,
            bounds: self.trained.set.bounds,
            value: self.oob.metric(metric),
        }
    }
}

/// Trained sets split by the drop policy.
#[derive(Debug, Default)]
pub struct OobReport {
    /// Scored sets that passed the policy, ascending by id.
    pub kept: Vec<ScoredSet>,
    /// Scored sets the policy removed, ascending by id.
    pub low_oob: Vec<ScoredSet>,
    /// Sets with no OOB samples, ascending by id.
    pub unscored: Vec<TrainedSet>,
}

impl OobReport {
    /// Mean `oob_rate` over kept sets, or `None` if none were kept.
    #[must_use]
    pub fn mean_kept_oob_rate(&self) -> Option<f64> {
        if self.kept.is_empty() {
            return None;
        }
        Some(self.kept.iter().map(|s| s.oob.oob_rate).sum::<f64>() / self.kept.len() as f64)
    }
}

enum Verdict {
    Kept(ScoredSet),
    LowOob(ScoredSet),
    Unscored(TrainedSet),
}

/// Configuration for OOB scoring and set pruning.
///
/// A set is `low_oob` when `oob_rate > min_oob` or the drop expression is
/// true for it. The decision reads only that set's attributes.
///
/// # Defaults
///
/// | Parameter | Default |
/// |---|---|
/// | `min_oob` | `None` (no threshold) |
/// | `drop_expr` | `None` |
#[derive(Debug, Clone)]
pub struct OobConfig {
    model_type: ModelType,
    min_oob: Option<f64>,
    drop_expr: Option<DropExpr>,
}

impl OobConfig {
    /// Create an OOB configuration for the given model type.
    #[must_use]
    pub fn new(model_type: ModelType) -> Self {
        Self {
            model_type,
            min_oob: None,
            drop_expr: None,
        }
    }

    /// Drop sets whose `oob_rate` exceeds this threshold.
    #[must_use]
    pub fn with_min_oob(mut self, min_oob: Option<f64>) -> Self {
        self.min_oob = min_oob;
        self
    }

    /// Drop sets for which this expression is true.
    #[must_use]
    pub fn with_drop_expr(mut self, drop_expr: Option<DropExpr>) -> Self {
        self.drop_expr = drop_expr;
        self
    }

    /// Return the OOB threshold.
    #[must_use]
    pub fn min_oob(&self) -> Option<f64> {
        self.min_oob
    }

    /// Drop-expression columns no set could resolve with these predictors.
    ///
    /// Empty when there is no drop expression.
    #[must_use]
    pub fn unresolved_drop_columns(&self, predictor_names: &[String]) -> Vec<String> {
        self.drop_expr.as_ref().map_or_else(Vec::new, |expr| {
            expr.columns()
                .into_iter()
                .filter(|c| !resolvable(c, predictor_names))
                .map(str::to_string)
                .collect()
        })
    }

    /// Predict every set's OOB samples, attach records, and apply the drop policy.
    ///
    /// Sets are scored in parallel and independently, so input order does
    /// not affect any record or decision.
    ///
    /// # Errors
    ///
    /// | Variant | Condition |
    /// |---|---|
    /// | [`EnsembleError::UnknownSample`] | a membership row names a sample not in `samples` |
    /// | [`EnsembleError::Predict`] | an estimator rejected a sample |
    /// | [`EnsembleError::UnknownDropColumn`] | the drop expression names an unknown column |
    #[instrument(skip_all, fields(n_sets = trained.len(), n_memberships = memberships.len()))]
    pub fn score(
        &self,
        trained: Vec<TrainedSet>,
        memberships: &[Membership],
        samples: &SampleTable,
    ) -> Result<OobReport, EnsembleError> {
        let mut oob_rows: HashMap<SetId, Vec<SampleId>> = HashMap::new();
        for m in memberships.iter().filter(|m| m.role == Role::Oob) {
            oob_rows.entry(m.set_id).or_default().push(m.sample_id);
        }
        // Fixed summation order regardless of membership row order.
        oob_rows.values_mut().for_each(|ids| ids.sort_unstable());

        let verdicts: Vec<Verdict> = trained
            .into_par_iter()
            .map(|set| -> Result<Verdict, EnsembleError> {
                let ids = oob_rows.get(&set.set.id).map_or(&[][..], Vec::as_slice);
                let Some(oob) = self.record(&set, ids, samples)? else {
                    debug!(set_id = %set.set.id, "no OOB samples, set unscored");
                    return Ok(Verdict::Unscored(set));
                };
                let scored = ScoredSet { trained: set, oob };
                if self.is_low(&scored, samples.predictor_names())? {
                    Ok(Verdict::LowOob(scored))
                } else {
                    Ok(Verdict::Kept(scored))
                }
            })
            .collect::<Result<_, _>>()?;

        let mut report = OobReport::default();
        for verdict in verdicts {
            match verdict {
                Verdict::Kept(s) => report.kept.push(s),
                Verdict::LowOob(s) => report.low_oob.push(s),
                Verdict::Unscored(t) => report.unscored.push(t),
            }
        }
        report.kept.sort_by_key(|s| s.trained.set.id);
        report.low_oob.sort_by_key(|s| s.trained.set.id);
        report.unscored.sort_by_key(|t| t.set.id);

        info!(
            n_kept = report.kept.len(),
            n_low_oob = report.low_oob.len(),
            n_unscored = report.unscored.len(),
            mean_oob_rate = report.mean_kept_oob_rate().unwrap_or(f64::NAN),
            "OOB scoring complete"
        );
        Ok(report)
    }

    /// OOB record of one set, or `None` when it has no OOB samples.
    fn record(
        &self,
        set: &TrainedSet,
        oob_ids: &[SampleId],
        samples: &SampleTable,
    ) -> Result<Option<OobRecord>, EnsembleError> {
        if oob_ids.is_empty() {
            return Ok(None);
        }
        let rows = samples.samples();
        let mut total = 0.0;
        for &sample_id in oob_ids {
            let idx = samples.index_of(sample_id).ok_or(EnsembleError::UnknownSample {
                set_id: set.set.id,
                sample_id,
            })?;
            let sample = &rows[idx];
            let predicted = set
                .estimator
                .predict(&sample.predictors)
                .map_err(|source| EnsembleError::Predict {
                    set_id: set.set.id,
                    source,
                })?;
            total += match self.model_type {
                ModelType::Classifier => f64::from(predicted != sample.target),
                ModelType::Regressor => (predicted - sample.target).abs(),
            };
        }
        Ok(Some(OobRecord {
            oob_rate: total / oob_ids.len() as f64,
            oob_count: oob_ids.len(),
        }))
    }

    fn is_low(&self, scored: &ScoredSet, predictor_names: &[String]) -> Result<bool, EnsembleError> {
        if let Some(min) = self.min_oob
            && scored.oob.oob_rate > min
        {
            return Ok(true);
        }
        match &self.drop_expr {
            Some(expr) => expr
                .evaluate(&|column: &str| scored.attribute(column, predictor_names))
                .map_err(|column| EnsembleError::UnknownDropColumn {
                    set_id: scored.trained.set.id,
                    column,
                }),
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use stem_tree::DecisionTreeConfig;

    use super::*;
    use crate::domain::{Bounds, Sample, SupportSet};

    fn table() -> SampleTable {
        let samples = (0..8u64)
            .map(|i| Sample {
                id: SampleId::new(i),
                x: i as f64,
                y: 0.5,
                predictors: vec![i as f64],
                target: f64::from(i >= 4),
            })
            .collect();
        SampleTable::new(vec!["elev".into()], "t".into(), samples).unwrap()
    }

    /// A classifier trained on x = 0..8 that predicts class 1 for x >= 4.
    fn trained(id: u64) -> TrainedSet {
        let features: Vec<Vec<f64>> = (0..8).map(|i| vec![f64::from(i)]).collect();
        let targets: Vec<f64> = (0..8).map(|i| f64::from(i >= 4)).collect();
        let estimator = DecisionTreeConfig::new().fit_classifier(&features, &targets).unwrap();
        TrainedSet {
            set: SupportSet {
                id: SetId::new(id),
                bounds: Bounds::from_corners(0.0, 1.0, 8.0, 0.0),
                min_obs: 1,
                max_features: None,
            },
            n_samples: 8,
            n_train: 4,
            n_oob: 4,
            dt_file: format!("set_{id}.bin").into(),
            importances: estimator.feature_importances(),
            estimator,
        }
    }

    fn oob(set: u64, samples: &[u64]) -> Vec<Membership> {
        samples
            .iter()
            .map(|&s| Membership {
                sample_id: SampleId::new(s),
                set_id: SetId::new(set),
                role: Role::Oob,
            })
            .collect()
    }

    #[test]
    fn classifier_rate_is_misclassification_fraction() {
        // Relabel sample 5 so the tree gets exactly one of four wrong.
        let mut rows: Vec<Sample> = table().samples().to_vec();
        rows[5].target = 0.0;
        let flipped = SampleTable::new(vec!["elev".into()], "t".into(), rows).unwrap();

        let report = OobConfig::new(ModelType::Classifier)
            .score(vec![trained(0)], &oob(0, &[2, 3, 5, 6]), &flipped)
            .unwrap();
        assert_eq!(report.kept.len(), 1);
        assert_eq!(report.kept[0].oob, OobRecord { oob_rate: 0.25, oob_count: 4 });
    }

    #[test]
    fn regressor_rate_is_mean_absolute_error() {
        let features: Vec<Vec<f64>> = (0..4).map(|i| vec![f64::from(i)]).collect();
        let estimator = DecisionTreeConfig::new()
            .fit_regressor(&features, &[0.0, 0.0, 2.0, 2.0])
            .unwrap();
        let mut set = trained(0);
        set.estimator = estimator;
        let samples: Vec<Sample> = [(0, 1.0), (3, 2.5)]
            .iter()
            .map(|&(i, target)| Sample {
                id: SampleId::new(i),
                x: 0.0,
                y: 0.0,
                predictors: vec![i as f64],
                target,
            })
            .collect();
        let table = SampleTable::new(vec!["elev".into()], "t".into(), samples).unwrap();
        let report = OobConfig::new(ModelType::Regressor)
            .score(vec![set], &oob(0, &[0, 3]), &table)
            .unwrap();
        assert_eq!(report.kept[0].oob.oob_rate, 0.75);
    }

    #[test]
    fn zero_oob_samples_is_unscored() {
        let report = OobConfig::new(ModelType::Classifier)
            .with_min_oob(Some(0.0))
            .score(vec![trained(4), trained(5)], &oob(5, &[1]), &table())
            .unwrap();
        assert_eq!(report.unscored.len(), 1);
        assert_eq!(report.unscored[0].set.id, SetId::new(4));
        assert_eq!(report.kept.len(), 1);
        assert!(report.low_oob.is_empty());
    }

    #[test]
    fn min_oob_and_expression_split_sets() {
        let mut table_rows = table().samples().to_vec();
        table_rows[1].target = 1.0;
        let table = SampleTable::new(vec!["elev".into()], "t".into(), table_rows).unwrap();

        let mut memberships = oob(0, &[1]);
        memberships.extend(oob(1, &[2]));
        memberships.extend(oob(2, &[3]));
        let report = OobConfig::new(ModelType::Classifier)
            .with_min_oob(Some(0.4))
            .with_drop_expr(Some(DropExpr::parse("set_id == 2 or importance_elev < 0").unwrap()))
            .score(vec![trained(0), trained(1), trained(2)], &memberships, &table)
            .unwrap();

        let kept: Vec<u64> = report.kept.iter().map(|s| s.trained.set.id.get()).collect();
        let low: Vec<u64> = report.low_oob.iter().map(|s| s.trained.set.id.get()).collect();
        assert_eq!(kept, vec![1]);
        assert_eq!(low, vec![0, 2]);
    }

    #[test]
    fn unknown_drop_column_is_error() {
        let err = OobConfig::new(ModelType::Classifier)
            .with_drop_expr(Some(DropExpr::parse("importance_slope > 0.1").unwrap()))
            .score(vec![trained(9)], &oob(9, &[0]), &table())
            .unwrap_err();
        assert!(matches!(err, EnsembleError::UnknownDropColumn { column, .. } if column == "importance_slope"));
    }

    #[test]
    fn unresolved_columns_listed_before_scoring() {
        let names = vec!["elev".to_string()];
        let config = OobConfig::new(ModelType::Classifier).with_drop_expr(Some(
            DropExpr::parse("oob_count < 3 or importance_elev > 0.9 or importance_slope > 0.1 or area > 2").unwrap(),
        ));
        assert_eq!(config.unresolved_drop_columns(&names), vec!["importance_slope", "area"]);
        assert!(OobConfig::new(ModelType::Classifier).unresolved_drop_columns(&names).is_empty());
    }

    #[test]
    fn input_order_does_not_change_results() {
        let mut memberships = Vec::new();
        for id in 0..5 {
            memberships.extend(oob(id, &[id, id + 3]));
        }
        let config = OobConfig::new(ModelType::Classifier).with_min_oob(Some(0.3));
        let forward = config
            .score((0..5).map(trained).collect(), &memberships, &table())
            .unwrap();
        memberships.reverse();
        let backward = config
            .score((0..5).rev().map(trained).collect(), &memberships, &table())
            .unwrap();
        let records = |r: &OobReport| -> Vec<(SetId, OobRecord)> {
            r.kept
                .iter()
                .chain(&r.low_oob)
                .map(|s| (s.trained.set.id, s.oob))
                .collect()
        };
        assert_eq!(records(&forward), records(&backward));
    }
}
