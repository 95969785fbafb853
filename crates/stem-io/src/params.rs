//! TOML parameter file: raw deserialization and one-shot validation.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use stem_ensemble::{
    DropExpr, EnsembleError, GridConfig, ModelType, OobConfig, OobMetric, SET_ATTRIBUTES, SamplerConfig, ScoreMapConfig, SnapGrid,
};
use tracing::{debug, instrument};

use crate::IoError;

/// Parameter file exactly as written on disk.
///
/// Unknown keys are rejected so that typos fail loudly instead of silently
/// falling back to a default.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParamFile {
    pub sample_txt: PathBuf,
    pub target_col: String,
    pub var_info: PathBuf,
    pub mosaic_path: PathBuf,
    pub out_dir: PathBuf,
    pub model_type: ModelType,
    pub cell_size: [f64; 2],
    pub support_size: [f64; 2],
    pub sets_per_cell: usize,
    pub min_obs: usize,
    pub out_dirname: Option<String>,
    pub max_features: Option<usize>,
    pub pct_train: Option<f64>,
    pub min_per_class: Option<usize>,
    pub min_oob: Option<f64>,
    pub oob_drop: Option<String>,
    pub n_jobs: Option<usize>,
    pub make_oob_map: Option<bool>,
    pub oob_map_metric: Option<String>,
    pub n_tiles: Option<[usize; 2]>,
    pub snap_coord: Option<[f64; 2]>,
    pub resolution: Option<f64>,
    pub constant_vars: Option<Vec<String>>,
    pub inventory_txt: Option<PathBuf>,
    pub max_target_val: Option<f64>,
    pub seed: Option<u64>,
    pub x_col: Option<String>,
    pub y_col: Option<String>,
}

/// Validated, default-filled run configuration.
///
/// # Defaults
///
/// | Parameter | Default |
/// |---|---|
/// | `out_dirname` | `target_col` |
/// | `n_jobs` | `1` |
/// | `make_oob_map` | `false` |
/// | `oob_map_metric` | `oob_rate` |
/// | `n_tiles` | `[40, 90]` |
/// | `resolution` | `30` (only used with `snap_coord`) |
/// | `x_col` / `y_col` | `"x"` / `"y"` |
/// | `seed` | drawn at run start and logged |
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// The parameter file this configuration was loaded from.
    pub params_path: PathBuf,
    pub sample_txt: PathBuf,
    pub var_info: PathBuf,
    pub mosaic_path: PathBuf,
    pub out_dir: PathBuf,
    pub out_dirname: String,
    pub target_col: String,
    pub x_col: String,
    pub y_col: String,
    pub model_type: ModelType,
    pub constant_vars: Vec<String>,
    pub max_features: Option<usize>,
    pub max_target_val: Option<f64>,
    pub n_jobs: usize,
    pub make_oob_map: bool,
    pub oob_map_metric: OobMetric,
    pub inventory_txt: Option<PathBuf>,
    pub seed: Option<u64>,
    /// Footprint generation, seed not yet applied.
    pub grid: GridConfig,
    /// Train/OOB split policy, seed not yet applied.
    pub sampler: SamplerConfig,
    /// OOB drop policy.
    pub oob: OobConfig,
    /// Score map tiling.
    pub score_map: ScoreMapConfig,
}

impl RunConfig {
    /// Read, deserialize, and validate a parameter file.
    ///
    /// # Errors
    ///
    /// | Variant | Condition |
    /// |---|---|
    /// | [`IoError::FileNotFound`] | the parameter file is unreadable |
    /// | [`IoError::ParseParams`] | bad TOML, unknown key, missing required key |
    /// | [`IoError::PathNotFound`] | an input path does not exist |
    /// | [`IoError::InvalidParam`] | a value is out of range or `oob_drop` does not parse |
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn load(path: &Path) -> Result<Self, IoError> {
        let text = std::fs::read_to_string(path).map_err(|e| IoError::FileNotFound {
            path: path.to_path_buf(),
            source: e,
        })?;
        let raw: ParamFile = toml::from_str(&text).map_err(|e| IoError::ParseParams {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config = Self::from_params(raw, path)?;
        debug!(
            model_type = config.model_type.as_str(),
            n_jobs = config.n_jobs,
            "parameters validated"
        );
        Ok(config)
    }

    /// Validate an already-deserialized parameter file.
    ///
    /// # Errors
    ///
    /// Same as [`RunConfig::load`], minus the read and parse failures.
    pub fn from_params(raw: ParamFile, params_path: &Path) -> Result<Self, IoError> {
        for (field, p) in [
            ("sample_txt", &raw.sample_txt),
            ("var_info", &raw.var_info),
            ("mosaic_path", &raw.mosaic_path),
        ] {
            if !p.exists() {
                return Err(IoError::PathNotFound {
                    field,
                    path: p.clone(),
                });
            }
        }
        if raw.target_col.trim().is_empty() {
            return Err(invalid("target_col", "must not be empty"));
        }

        let mut grid = GridConfig::new(
            (raw.cell_size[0], raw.cell_size[1]),
            (raw.support_size[0], raw.support_size[1]),
            raw.sets_per_cell,
            raw.min_obs,
        )
        .map_err(|e| invalid(grid_field(&e), e))?;
        if let Some([origin_x, origin_y]) = raw.snap_coord {
            let snap = SnapGrid {
                origin_x,
                origin_y,
                resolution: raw.resolution.unwrap_or(30.0),
            };
            grid = grid.with_snap(Some(snap)).map_err(|e| invalid(grid_field(&e), e))?;
        }
        if raw.max_features == Some(0) {
            return Err(invalid("max_features", "must be at least 1"));
        }
        grid = grid.with_max_features(raw.max_features);

        let sampler = SamplerConfig::new(raw.model_type)
            .with_pct_train(raw.pct_train)
            .map_err(|e| invalid("pct_train", e))?
            .with_min_per_class(raw.min_per_class)
            .map_err(|e| invalid("min_per_class", e))?;

        if let Some(min_oob) = raw.min_oob
            && !(min_oob.is_finite() && min_oob >= 0.0)
        {
            return Err(invalid("min_oob", format!("must be a non-negative number, got {min_oob}")));
        }
        let drop_expr = raw
            .oob_drop
            .as_deref()
            .map(DropExpr::parse)
            .transpose()
            .map_err(|e| invalid("oob_drop", e))?;
        let oob = OobConfig::new(raw.model_type)
            .with_min_oob(raw.min_oob)
            .with_drop_expr(drop_expr);

        let [rows, cols] = raw.n_tiles.unwrap_or([40, 90]);
        let score_map = ScoreMapConfig::new()
            .with_n_tiles(rows, cols)
            .map_err(|e| invalid("n_tiles", e))?;

        let n_jobs = raw.n_jobs.unwrap_or(1);
        if n_jobs == 0 {
            return Err(invalid("n_jobs", "must be at least 1"));
        }
        let oob_map_metric = match raw.oob_map_metric.as_deref() {
            Some(s) => s.parse().map_err(|e: String| invalid("oob_map_metric", e))?,
            None => OobMetric::OobRate,
        };
        if let Some(cap) = raw.max_target_val
            && !cap.is_finite()
        {
            return Err(invalid("max_target_val", "must be finite"));
        }

        let out_dirname = raw.out_dirname.unwrap_or_else(|| raw.target_col.clone());
        if out_dirname.is_empty() || out_dirname.contains(['/', '\\']) {
            return Err(invalid(
                "out_dirname",
                format!("\"{out_dirname}\" is not a plain directory name"),
            ));
        }

        let mut constant_vars = raw.constant_vars.unwrap_or_default();
        constant_vars.sort();
        constant_vars.dedup();

        Ok(Self {
            params_path: params_path.to_path_buf(),
            sample_txt: raw.sample_txt,
            var_info: raw.var_info,
            mosaic_path: raw.mosaic_path,
            out_dir: raw.out_dir,
            out_dirname,
            target_col: raw.target_col,
            x_col: raw.x_col.unwrap_or_else(|| "x".to_string()),
            y_col: raw.y_col.unwrap_or_else(|| "y".to_string()),
            model_type: raw.model_type,
            constant_vars,
            max_features: raw.max_features,
            max_target_val: raw.max_target_val,
            n_jobs,
            make_oob_map: raw.make_oob_map.unwrap_or(false),
            oob_map_metric,
            inventory_txt: raw.inventory_txt,
            seed: raw.seed,
            grid,
            sampler,
            oob,
            score_map,
        })
    }

    /// Check settings that depend on the resolved predictor columns.
    ///
    /// # Errors
    ///
    /// Returns [`IoError::InvalidParam`] when `max_features` exceeds the
    /// number of predictors, which would make every set fail to fit, or when
    /// `oob_drop` names a column no support set has.
    pub fn check_predictors(&self, predictor_names: &[String]) -> Result<(), IoError> {
        let n_predictors = predictor_names.len();
        if let Some(m) = self.max_features
            && m > n_predictors
        {
            return Err(invalid(
                "max_features",
                format!("{m} exceeds the {n_predictors} available predictors"),
            ));
        }
        let unknown = self.oob.unresolved_drop_columns(predictor_names);
        if !unknown.is_empty() {
            return Err(invalid(
                "oob_drop",
                format!(
                    "unknown column(s) {}; expected one of {} or importance_<predictor>",
                    unknown.join(", "),
                    SET_ATTRIBUTES.join(", ")
                ),
            ));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, message: impl ToString) -> IoError {
    IoError::InvalidParam {
        field,
        message: message.to_string(),
    }
}

/// Attribute a grid validation failure to the parameter that caused it.
fn grid_field(err: &EnsembleError) -> &'static str {
    match err {
        EnsembleError::InvalidSize { name, .. } => name,
        EnsembleError::InvalidSetsPerCell => "sets_per_cell",
        EnsembleError::InvalidMinObs => "min_obs",
        EnsembleError::InvalidResolution { .. } => "resolution",
        EnsembleError::SizeOffLattice { name, .. } => name,
        _ => "support_size",
    }
}
