//! Flat per-set rows shared by the run store and the summary artifacts.

use stem_ensemble::{
    Bounds, DropReason, DroppedSet, OobMetric, OobReport, ScoredFootprint, ScoredSet, SetId, SetStatus,
    TrainedSet,
};

/// One support set as persisted, whatever happened to it.
#[derive(Debug, Clone, PartialEq)]
pub struct SetRecord {
    pub set_id: SetId,
    pub status: SetStatus,
    pub bounds: Bounds,
    pub min_obs: usize,
    pub max_features: Option<usize>,
    /// Samples inside the footprint.
    pub n_samples: usize,
    pub n_train: Option<usize>,
    pub n_oob: Option<usize>,
    /// Estimator file name relative to the model directory.
    pub dt_file: Option<String>,
    pub oob_rate: Option<f64>,
    pub oob_count: Option<usize>,
    /// MDI importance per predictor; empty for sets without an estimator.
    pub importances: Vec<f64>,
    /// Error chain for failed sets.
    pub message: Option<String>,
}

impl SetRecord {
    fn trained(t: &TrainedSet, status: SetStatus) -> Self {
        Self {
            set_id: t.set.id,
            status,
            bounds: t.set.bounds,
            min_obs: t.set.min_obs,
            max_features: t.set.max_features,
            n_samples: t.n_samples,
            n_train: Some(t.n_train),
            n_oob: Some(t.n_oob),
            dt_file: t
                .dt_file
                .file_name()
                .map(|name| name.to_string_lossy().into_owned()),
            oob_rate: None,
            oob_count: None,
            importances: t.importances.clone(),
            message: None,
        }
    }

    fn scored(s: &ScoredSet, status: SetStatus) -> Self {
        Self {
            oob_rate: Some(s.oob.oob_rate),
            oob_count: Some(s.oob.oob_count),
            ..Self::trained(&s.trained, status)
        }
    }

    fn dropped(d: &DroppedSet) -> Self {
        let (status, message) = match &d.reason {
            DropReason::Insufficient { .. } => (SetStatus::Insufficient, None),
            DropReason::Failed { message, .. } => (SetStatus::Failed, Some(message.clone())),
        };
        Self {
            set_id: d.set.id,
            status,
            bounds: d.set.bounds,
            min_obs: d.set.min_obs,
            max_features: d.set.max_features,
            n_samples: d.enclosed(),
            n_train: None,
            n_oob: None,
            dt_file: None,
            oob_rate: None,
            oob_count: None,
            importances: Vec::new(),
            message,
        }
    }

    /// Footprint for score mapping, if the set was scored.
    #[must_use]
    pub fn footprint(&self, metric: OobMetric) -> Option<ScoredFootprint> {
        let value = match metric {
            OobMetric::OobRate => self.oob_rate?,
            OobMetric::OobCount => self.oob_count? as f64,
        };
        Some(ScoredFootprint {
            set_id: self.set_id,
            bounds: self.bounds,
            value,
        })
    }
}

/// Flatten every generated set into one row each, ascending by id.
#[must_use]
pub fn collect_records(dropped: &[DroppedSet], oob: &OobReport) -> Vec<SetRecord> {
    let mut records: Vec<SetRecord> = oob
        .kept
        .iter()
        .map(|s| SetRecord::scored(s, SetStatus::Kept))
        .chain(oob.low_oob.iter().map(|s| SetRecord::scored(s, SetStatus::LowOob)))
        .chain(oob.unscored.iter().map(|t| SetRecord::trained(t, SetStatus::Unscored)))
        .chain(dropped.iter().map(SetRecord::dropped))
        .collect();
    records.sort_by_key(|r| r.set_id);
    records
}

/// Rows for sets that were trained but never scored, e.g. when the drop
/// policy failed and the trained sets still need to be recorded.
#[must_use]
pub fn unscored_records(dropped: &[DroppedSet], trained: &[TrainedSet]) -> Vec<SetRecord> {
    let mut records: Vec<SetRecord> = trained
        .iter()
        .map(|t| SetRecord::trained(t, SetStatus::Unscored))
        .chain(dropped.iter().map(SetRecord::dropped))
        .collect();
    records.sort_by_key(|r| r.set_id);
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use stem_ensemble::SupportSet;

    fn dropped(id: u64, reason: DropReason) -> DroppedSet {
        DroppedSet {
            set: SupportSet {
                id: SetId::new(id),
                bounds: Bounds::from_corners(0.0, 10.0, 10.0, 0.0),
                min_obs: 5,
                max_features: None,
            },
            reason,
        }
    }

    #[test]
    fn dropped_sets_flattened_in_id_order() {
        let sets = vec![
            dropped(
                7,
                DropReason::Failed {
                    enclosed: 9,
                    message: "degenerate target".into(),
                },
            ),
            dropped(2, DropReason::Insufficient { enclosed: 3, min_obs: 5 }),
        ];
        let records = collect_records(&sets, &OobReport::default());
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].set_id, SetId::new(2));
        assert_eq!(records[0].status, SetStatus::Insufficient);
        assert_eq!(records[0].n_samples, 3);
        assert_eq!(records[1].status, SetStatus::Failed);
        assert_eq!(records[1].message.as_deref(), Some("degenerate target"));
        assert!(records[1].footprint(OobMetric::OobRate).is_none());
    }
}
