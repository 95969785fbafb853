//! Per-footprint sample selection and train/OOB partitioning.

use std::collections::BTreeMap;

use rand::Rng;
use rand::seq::SliceRandom;

use crate::domain::{ModelType, SampleTable, SupportSet};
use crate::rng::{Purpose, stream_rng};
use crate::EnsembleError;

/// Train/OOB partition of one footprint's samples.
///
/// All vectors hold positions into the [`SampleTable`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetSample {
    /// Rows the estimator is fitted on; a bootstrap may repeat positions.
    pub fit: Vec<usize>,
    /// Distinct samples with the train role, ascending.
    pub train: Vec<usize>,
    /// Samples with the OOB role, ascending. Disjoint from `train`.
    pub oob: Vec<usize>,
}

impl SetSample {
    /// Number of samples enclosed by the footprint.
    #[must_use]
    pub fn enclosed(&self) -> usize {
        self.train.len() + self.oob.len()
    }
}

/// Result of sampling one footprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SampleOutcome {
    /// Enough samples; ready to train.
    Sampled(SetSample),
    /// Fewer enclosed samples than the set's `min_obs`.
    Insufficient {
        /// Samples that were inside the footprint.
        enclosed: usize,
    },
}

/// Configuration for the train/OOB split.
///
/// With `pct_train` set, enclosed samples are shuffled and the first
/// `ceil(pct_train * n)` become train. Otherwise a bootstrap of size `n`
/// is drawn: drawn samples train (as a multiset), never-drawn ones are OOB.
///
/// # Defaults
///
/// | Parameter | Default |
/// |---|---|
/// | `pct_train` | `None` (bootstrap) |
/// | `min_per_class` | `None` |
/// | `seed` | `42` |
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    model_type: ModelType,
    pct_train: Option<f64>,
    min_per_class: Option<usize>,
    seed: u64,
}

impl SamplerConfig {
    /// Create a sampler for the given model type.
    #[must_use]
    pub fn new(model_type: ModelType) -> Self {
        Self {
            model_type,
            pct_train: None,
            min_per_class: None,
            seed: 42,
        }
    }

    /// Use a shuffled fractional split instead of a bootstrap.
    ///
    /// # Errors
    ///
    /// Returns [`EnsembleError::InvalidPctTrain`] outside `(0.0, 1.0]`.
    pub fn with_pct_train(mut self, pct_train: Option<f64>) -> Result<Self, EnsembleError> {
        if let Some(p) = pct_train
            && !(p > 0.0 && p <= 1.0)
        {
            return Err(EnsembleError::InvalidPctTrain { pct_train: p });
        }
        self.pct_train = pct_train;
        Ok(self)
    }

    /// Guarantee each class at least this many distinct train samples when possible.
    ///
    /// # Errors
    ///
    /// Returns [`EnsembleError::MinPerClassForRegressor`] for regressors.
    pub fn with_min_per_class(mut self, min_per_class: Option<usize>) -> Result<Self, EnsembleError> {
        if min_per_class.is_some() && self.model_type == ModelType::Regressor {
            return Err(EnsembleError::MinPerClassForRegressor);
        }
        self.min_per_class = min_per_class;
        Ok(self)
    }

    /// Set the run seed that per-set splits derive from.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Return the configured training fraction.
    #[must_use]
    pub fn pct_train(&self) -> Option<f64> {
        self.pct_train
    }

    /// Select the samples inside `set` and split them into train and OOB.
    ///
    /// Depends only on the run seed, the set id, and the samples, so the
    /// result is the same whichever worker calls it.
    #[must_use]
    pub fn sample(&self, set: &SupportSet, samples: &SampleTable) -> SampleOutcome {
        let enclosed = samples.enclosed(&set.bounds);
        if enclosed.len() < set.min_obs {
            return SampleOutcome::Insufficient {
                enclosed: enclosed.len(),
            };
        }

        let mut rng = stream_rng(self.seed, Purpose::Sampler, set.id.get());
        let (mut fit, mut in_train) = match self.pct_train {
            Some(pct) => {
                let mut order = enclosed.clone();
                order.shuffle(&mut rng);
                let n_train = ((pct * order.len() as f64).ceil() as usize).clamp(1, order.len());
                let mut in_train = vec![false; enclosed.len()];
                for pos in &order[..n_train] {
                    // enclosed is sorted, so binary search recovers the slot.
                    if let Ok(slot) = enclosed.binary_search(pos) {
                        in_train[slot] = true;
                    }
                }
                (order[..n_train].to_vec(), in_train)
            }
            None => {
                let mut in_train = vec![false; enclosed.len()];
                let fit: Vec<usize> = (0..enclosed.len())
                    .map(|_| {
                        let slot = rng.gen_range(0..enclosed.len());
                        in_train[slot] = true;
                        enclosed[slot]
                    })
                    .collect();
                (fit, in_train)
            }
        };

        if let Some(min) = self.min_per_class {
            self.top_up_classes(min, &enclosed, samples, &mut fit, &mut in_train);
        }

        let mut train = Vec::new();
        let mut oob = Vec::new();
        for (&pos, &is_train) in enclosed.iter().zip(&in_train) {
            if is_train {
                train.push(pos);
            } else {
                oob.push(pos);
            }
        }

        SampleOutcome::Sampled(SetSample { fit, train, oob })
    }

    /// Move OOB samples of under-represented classes into train.
    fn top_up_classes(
        &self,
        min: usize,
        enclosed: &[usize],
        samples: &SampleTable,
        fit: &mut Vec<usize>,
        in_train: &mut [bool],
    ) {
        let rows = samples.samples();
        let mut by_class: BTreeMap<u64, (usize, Vec<usize>)> = BTreeMap::new();
        for (slot, &pos) in enclosed.iter().enumerate() {
            let entry = by_class.entry(rows[pos].target.to_bits()).or_default();
            if in_train[slot] {
                entry.0 += 1;
            } else {
                entry.1.push(slot);
            }
        }

        for (n_train, oob_slots) in by_class.values() {
            for &slot in oob_slots.iter().take(min.saturating_sub(*n_train)) {
                in_train[slot] = true;
                fit.push(enclosed[slot]);
            }
        }
    }
}
