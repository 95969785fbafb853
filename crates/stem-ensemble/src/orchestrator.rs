//! Parallel fan-out of per-set training over a bounded worker pool.

use std::sync::atomic::{AtomicUsize, Ordering};

use rayon::prelude::*;
use tracing::{debug, info, instrument, warn};

use crate::domain::{DropReason, DroppedSet, Membership, SampleTable, SupportSet, TrainedSet};
use crate::sampler::{SampleOutcome, SamplerConfig};
use crate::trainer::TrainerConfig;
use crate::EnsembleError;

/// Typed result of one training task.
#[derive(Debug)]
pub enum SetOutcome {
    /// The set trained; carries its record and membership rows.
    Trained(Box<TrainedSet>, Vec<Membership>),
    /// The set was dropped before or during fitting.
    Dropped(DroppedSet),
}

/// Everything the training phase produced, assembled after the join.
#[derive(Debug)]
pub struct TrainingReport {
    /// Sets with a fitted estimator, ascending by id.
    pub trained: Vec<TrainedSet>,
    /// Sets that never received an estimator, ascending by id.
    pub dropped: Vec<DroppedSet>,
    /// Membership rows of every trained set, grouped by set id.
    pub memberships: Vec<Membership>,
}

/// Runs sampling and training for every set on a local thread pool.
#[derive(Debug, Clone)]
pub struct TrainingOrchestrator {
    n_jobs: usize,
}

impl TrainingOrchestrator {
    /// Create an orchestrator with `n_jobs` worker threads.
    ///
    /// # Errors
    ///
    /// Returns [`EnsembleError::InvalidJobCount`] if `n_jobs == 0`.
    pub fn new(n_jobs: usize) -> Result<Self, EnsembleError> {
        if n_jobs == 0 {
            return Err(EnsembleError::InvalidJobCount);
        }
        Ok(Self { n_jobs })
    }

    /// Return the worker count.
    #[must_use]
    pub fn n_jobs(&self) -> usize {
        self.n_jobs
    }

    /// Sample and train every set, then partition results into trained and dropped.
    ///
    /// Workers share only the read-only sample table; each writes its own
    /// estimator file. Per-set failures become [`SetOutcome::Dropped`].
    ///
    /// # Errors
    ///
    /// | Variant | Condition |
    /// |---|---|
    /// | [`EnsembleError::ThreadPool`] | the worker pool could not be built |
    /// | [`EnsembleError::NoSetsTrained`] | every set was dropped |
    #[instrument(skip_all, fields(n_sets = sets.len(), n_jobs = self.n_jobs))]
    pub fn run(
        &self,
        sets: Vec<SupportSet>,
        samples: &SampleTable,
        sampler: &SamplerConfig,
        trainer: &TrainerConfig,
    ) -> Result<TrainingReport, EnsembleError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.n_jobs)
            .build()
            .map_err(|source| EnsembleError::ThreadPool {
                n_jobs: self.n_jobs,
                source,
            })?;

        let n_sets = sets.len();
        let done = AtomicUsize::new(0);
        let step = (n_sets / 10).max(1);

        let outcomes: Vec<SetOutcome> = pool.install(|| {
            sets.into_par_iter()
                .map(|set| {
                    let outcome = train_one(set, samples, sampler, trainer);
                    let finished = done.fetch_add(1, Ordering::Relaxed) + 1;
                    if finished % step == 0 || finished == n_sets {
                        info!(finished, n_sets, "training progress");
                    }
                    outcome
                })
                .collect()
        });

        let report = join(outcomes);
        info!(
            n_trained = report.trained.len(),
            n_dropped = report.dropped.len(),
            n_memberships = report.memberships.len(),
            "training complete"
        );

        if report.trained.is_empty() {
            return Err(EnsembleError::NoSetsTrained {
                n_sets,
                n_dropped: report.dropped.len(),
            });
        }
        Ok(report)
    }
}

/// Sample and train a single set, converting every per-set failure into a drop.
fn train_one(
    set: SupportSet,
    samples: &SampleTable,
    sampler: &SamplerConfig,
    trainer: &TrainerConfig,
) -> SetOutcome {
    let split = match sampler.sample(&set, samples) {
        SampleOutcome::Sampled(split) => split,
        SampleOutcome::Insufficient { enclosed } => {
            debug!(set_id = %set.id, enclosed, min_obs = set.min_obs, "insufficient samples");
            let min_obs = set.min_obs;
            return SetOutcome::Dropped(DroppedSet {
                set,
                reason: DropReason::Insufficient { enclosed, min_obs },
            });
        }
    };

    match trainer.train(&set, &split, samples) {
        Ok((trained, memberships)) => SetOutcome::Trained(Box::new(trained), memberships),
        Err(e) => {
            let message = error_chain(&e);
            warn!(set_id = %set.id, error = %message, "set dropped");
            SetOutcome::Dropped(DroppedSet {
                set,
                reason: DropReason::Failed {
                    enclosed: split.enclosed(),
                    message,
                },
            })
        }
    }
}

/// Partition outcomes and order everything by set id.
fn join(outcomes: Vec<SetOutcome>) -> TrainingReport {
    let mut trained = Vec::new();
    let mut dropped = Vec::new();
    let mut memberships = Vec::new();
    for outcome in outcomes {
        match outcome {
            SetOutcome::Trained(set, rows) => {
                trained.push(*set);
                memberships.extend(rows);
            }
            SetOutcome::Dropped(set) => dropped.push(set),
        }
    }
    trained.sort_by_key(|t| t.set.id);
    dropped.sort_by_key(|d| d.set.id);
    memberships.sort_by_key(|m| (m.set_id, m.sample_id));
    TrainingReport {
        trained,
        dropped,
        memberships,
    }
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::domain::{Bounds, ModelType, Role, Sample, SampleId, SetId};

    fn table() -> SampleTable {
        // 6 x 6 points on a unit lattice; class flips at x = 3.
        let samples = (0..36u64)
            .map(|i| {
                let (col, row) = (i % 6, i / 6);
                Sample {
                    id: SampleId::new(i),
                    x: col as f64 + 0.5,
                    y: row as f64 + 0.5,
                    predictors: vec![col as f64, row as f64],
                    target: f64::from(col >= 3),
                }
            })
            .collect();
        SampleTable::new(vec!["c".into(), "r".into()], "t".into(), samples).unwrap()
    }

    fn set(id: u64, bounds: Bounds) -> SupportSet {
        SupportSet {
            id: SetId::new(id),
            bounds,
            min_obs: 5,
            max_features: None,
        }
    }

    #[test]
    fn drops_insufficient_and_degenerate_sets() {
        let dir = TempDir::new().unwrap();
        let sets = vec![
            set(0, Bounds::from_corners(0.0, 6.0, 6.0, 0.0)),
            // two points only
            set(1, Bounds::from_corners(0.0, 1.0, 2.0, 0.0)),
            // single class
            set(2, Bounds::from_corners(0.0, 6.0, 3.0, 0.0)),
        ];
        let sampler = SamplerConfig::new(ModelType::Classifier)
            .with_pct_train(Some(0.8))
            .unwrap();
        let trainer = TrainerConfig::new(ModelType::Classifier, dir.path());
        let report = TrainingOrchestrator::new(2)
            .unwrap()
            .run(sets, &table(), &sampler, &trainer)
            .unwrap();

        assert_eq!(report.trained.len(), 1);
        assert_eq!(report.trained[0].set.id, SetId::new(0));
        assert_eq!(report.dropped.len(), 2);
        assert!(matches!(
            report.dropped[0].reason,
            DropReason::Insufficient { enclosed: 2, min_obs: 5 }
        ));
        assert!(matches!(report.dropped[1].reason, DropReason::Failed { enclosed: 18, .. }));

        assert_eq!(report.memberships.len(), 36);
        assert!(report.memberships.iter().all(|m| m.set_id == SetId::new(0)));
        assert_eq!(report.memberships.iter().filter(|m| m.role == Role::Train).count(), 29);
    }

    #[test]
    fn all_dropped_is_an_error() {
        let dir = TempDir::new().unwrap();
        let sets = vec![set(0, Bounds::from_corners(10.0, 20.0, 20.0, 10.0))];
        let err = TrainingOrchestrator::new(1)
            .unwrap()
            .run(
                sets,
                &table(),
                &SamplerConfig::new(ModelType::Classifier),
                &TrainerConfig::new(ModelType::Classifier, dir.path()),
            )
            .unwrap_err();
        assert!(matches!(err, EnsembleError::NoSetsTrained { n_sets: 1, n_dropped: 1 }));
    }

    #[test]
    fn worker_count_does_not_change_results() {
        let sets: Vec<SupportSet> = (0..6)
            .map(|k| set(k, Bounds::from_corners(0.0, 6.0, 6.0, 0.0)))
            .collect();
        let sampler = SamplerConfig::new(ModelType::Classifier).with_seed(3);
        let run = |n_jobs| {
            let dir = TempDir::new().unwrap();
            let trainer = TrainerConfig::new(ModelType::Classifier, dir.path());
            TrainingOrchestrator::new(n_jobs)
                .unwrap()
                .run(sets.clone(), &table(), &sampler, &trainer)
                .unwrap()
        };
        let serial = run(1);
        let parallel = run(4);
        assert_eq!(serial.memberships, parallel.memberships);
        for (a, b) in serial.trained.iter().zip(&parallel.trained) {
            assert_eq!(a.importances, b.importances);
        }
    }

    #[test]
    fn zero_jobs_rejected() {
        assert!(matches!(TrainingOrchestrator::new(0), Err(EnsembleError::InvalidJobCount)));
    }
}
