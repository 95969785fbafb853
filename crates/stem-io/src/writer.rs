//! Run directory layout and the text artifacts written into it.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::IoError;
use crate::records::SetRecord;

/// Subdirectory holding one estimator file per trained set.
pub const MODEL_DIR: &str = "decisiontree_models";

/// Summary table of kept sets.
pub const SUPPORT_SETS_TXT: &str = "support_sets.txt";

/// Footprints of kept sets.
pub const KEPT_GEOJSON: &str = "support_sets.geojson";

/// Footprints of sets removed by the OOB policy.
pub const LOW_OOB_GEOJSON: &str = "low_oob_sets.geojson";

/// Timestamped output directory of one training run.
///
/// Layout:
///
/// ```text
/// <out_dir>/<stamp>/
///     <params file>
///     <stamp>.db
///     support_sets.txt
///     support_sets.geojson
///     low_oob_sets.geojson
///     decisiontree_models/<stamp>_decisiontree_<set_id>.bin
///     <stamp>_<metric>.tif, <stamp>_count.tif
/// ```
#[derive(Debug, Clone)]
pub struct RunWriter {
    run_dir: PathBuf,
    stamp: String,
}

impl RunWriter {
    /// Create `<out_dir>/<name>_<YYYYMMDD>_<HHMM>` and its model directory.
    ///
    /// The run directory itself must not exist yet; `out_dir` is created as needed.
    ///
    /// # Errors
    ///
    /// | Variant | Condition |
    /// |---|---|
    /// | [`IoError::RunDirExists`] | a run with the same stamp is already in `out_dir` |
    /// | [`IoError::OutputDirCreate`] | a directory cannot be created |
    #[instrument(skip(out_dir), fields(out_dir = %out_dir.display()))]
    pub fn create(out_dir: &Path, name: &str, now: NaiveDateTime) -> Result<Self, IoError> {
        let stamp = format!("{name}_{}", now.format("%Y%m%d_%H%M"));
        let run_dir = out_dir.join(&stamp);
        let dir_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source: std::io::Error| IoError::OutputDirCreate { path, source }
        };

        fs::create_dir_all(out_dir).map_err(dir_err(out_dir))?;
        match fs::create_dir(&run_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(IoError::RunDirExists { path: run_dir });
            }
            Err(e) => return Err(dir_err(&run_dir)(e)),
        }
        let models = run_dir.join(MODEL_DIR);
        fs::create_dir(&models).map_err(dir_err(&models))?;
        debug!(stamp = %stamp, "run directory ready");
        Ok(Self { run_dir, stamp })
    }

    /// Reopen an existing run directory; its name is the stamp.
    ///
    /// # Errors
    ///
    /// Returns [`IoError::FileNotFound`] if the directory does not exist.
    pub fn open(run_dir: &Path) -> Result<Self, IoError> {
        fs::metadata(run_dir).map_err(|e| IoError::FileNotFound {
            path: run_dir.to_path_buf(),
            source: e,
        })?;
        let stamp = run_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self {
            run_dir: run_dir.to_path_buf(),
            stamp,
        })
    }

    /// Run stamp, also the prefix of per-run file names.
    pub fn stamp(&self) -> &str {
        &self.stamp
    }

    /// The run directory.
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Where estimator files go.
    pub fn model_dir(&self) -> PathBuf {
        self.run_dir.join(MODEL_DIR)
    }

    /// `<run>/<stamp>.db`.
    pub fn db_path(&self) -> PathBuf {
        self.run_dir.join(format!("{}.db", self.stamp))
    }

    /// Copy the parameter file into the run directory under its own name.
    ///
    /// # Errors
    ///
    /// Returns [`IoError::WriteFile`] if the copy fails.
    pub fn copy_params(&self, params: &Path) -> Result<PathBuf, IoError> {
        let name = params
            .file_name()
            .map_or_else(|| "params.toml".into(), |n| n.to_os_string());
        let dest = self.run_dir.join(name);
        fs::copy(params, &dest).map_err(|e| IoError::WriteFile {
            path: dest.clone(),
            source: e,
        })?;
        Ok(dest)
    }

    /// The copied parameter file, if exactly one `.toml` is in the run directory.
    pub fn find_params(&self) -> Option<PathBuf> {
        let mut found = fs::read_dir(&self.run_dir)
            .ok()?
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "toml"));
        let first = found.next()?;
        found.next().is_none().then_some(first)
    }

    /// Write kept sets to `support_sets.txt`.
    ///
    /// # Errors
    ///
    /// | Variant | Condition |
    /// |---|---|
    /// | [`IoError::WriteFile`] | the file cannot be created |
    /// | [`IoError::CsvWrite`] | a row cannot be written |
    #[instrument(skip_all, fields(n_sets = kept.len()))]
    pub fn write_support_sets(&self, kept: &[SetRecord], predictor_names: &[String]) -> Result<PathBuf, IoError> {
        let path = self.run_dir.join(SUPPORT_SETS_TXT);
        let file = fs::File::create(&path).map_err(|e| IoError::WriteFile {
            path: path.clone(),
            source: e,
        })?;
        let csv_err = |e| IoError::CsvWrite {
            path: path.clone(),
            source: e,
        };
        let mut w = csv::WriterBuilder::new().delimiter(b'\t').from_writer(file);

        let mut header: Vec<String> = [
            "set_id",
            "ul_x",
            "ul_y",
            "lr_x",
            "lr_y",
            "min_obs",
            "max_features",
            "n_samples",
            "n_train",
            "n_oob",
            "oob_rate",
            "oob_count",
            "dt_file",
        ]
        .iter()
        .map(|s| (*s).to_string())
        .collect();
        header.extend(predictor_names.iter().map(|p| format!("importance_{p}")));
        w.write_record(&header).map_err(csv_err)?;

        for r in kept {
            let mut row = vec![
                r.set_id.to_string(),
                r.bounds.min_x.to_string(),
                r.bounds.max_y.to_string(),
                r.bounds.max_x.to_string(),
                r.bounds.min_y.to_string(),
                r.min_obs.to_string(),
                opt(r.max_features),
                r.n_samples.to_string(),
                opt(r.n_train),
                opt(r.n_oob),
                opt(r.oob_rate),
                opt(r.oob_count),
                r.dt_file.clone().unwrap_or_default(),
            ];
            row.extend((0..predictor_names.len()).map(|i| opt(r.importances.get(i))));
            w.write_record(&row).map_err(csv_err)?;
        }
        w.flush().map_err(|e| IoError::WriteFile {
            path: path.clone(),
            source: e,
        })?;
        info!(path = %path.display(), "support set table written");
        Ok(path)
    }

    /// Write footprints as a GeoJSON FeatureCollection named `file_name`.
    ///
    /// # Errors
    ///
    /// | Variant | Condition |
    /// |---|---|
    /// | [`IoError::Json`] | serialization failed |
    /// | [`IoError::WriteFile`] | the file cannot be written |
    #[instrument(skip(self, records), fields(n_sets = records.len()))]
    pub fn write_footprints(&self, file_name: &str, records: &[SetRecord]) -> Result<PathBuf, IoError> {
        let path = self.run_dir.join(file_name);
        let collection = FeatureCollection {
            kind: "FeatureCollection",
            features: records.iter().map(Feature::from).collect(),
        };
        let json = serde_json::to_string_pretty(&collection).map_err(|e| IoError::Json {
            path: path.clone(),
            source: e,
        })?;
        fs::write(&path, json).map_err(|e| IoError::WriteFile {
            path: path.clone(),
            source: e,
        })?;
        debug!(path = %path.display(), "footprints written");
        Ok(path)
    }
}

fn opt<T: ToString>(v: Option<T>) -> String {
    v.map(|v| v.to_string()).unwrap_or_default()
}

#[derive(Serialize)]
struct FeatureCollection<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    features: Vec<Feature<'a>>,
}

#[derive(Serialize)]
struct Feature<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    geometry: Polygon,
    properties: FeatureProperties<'a>,
}

#[derive(Serialize)]
struct Polygon {
    #[serde(rename = "type")]
    kind: &'static str,
    coordinates: [[[f64; 2]; 5]; 1],
}

#[derive(Serialize)]
struct FeatureProperties<'a> {
    set_id: u64,
    status: &'a str,
    n_samples: usize,
    oob_rate: Option<f64>,
    oob_count: Option<usize>,
}

impl<'a> From<&'a SetRecord> for Feature<'a> {
    fn from(r: &'a SetRecord) -> Self {
        let b = &r.bounds;
        // Exterior ring, counter-clockwise, closed.
        let ring = [
            [b.min_x, b.min_y],
            [b.max_x, b.min_y],
            [b.max_x, b.max_y],
            [b.min_x, b.max_y],
            [b.min_x, b.min_y],
        ];
        Feature {
            kind: "Feature",
            geometry: Polygon {
                kind: "Polygon",
                coordinates: [ring],
            },
            properties: FeatureProperties {
                set_id: r.set_id.get(),
                status: r.status.as_str(),
                n_samples: r.n_samples,
                oob_rate: r.oob_rate,
                oob_count: r.oob_count,
            },
        }
    }
}

/// One run's line in the shared inventory table.
#[derive(Debug, Clone, PartialEq)]
pub struct InventoryRow {
    pub stamp: String,
    pub n_sets: usize,
    pub n_samples: usize,
    pub support_size: (f64, f64),
    pub sets_per_cell: usize,
    pub max_features: Option<usize>,
    pub avg_oob: Option<f64>,
    pub avg_count: Option<f64>,
}

impl InventoryRow {
    fn fields(&self) -> [(&'static str, String); 7] {
        [
            ("n_sets", self.n_sets.to_string()),
            ("n_samples", self.n_samples.to_string()),
            (
                "support_size",
                format!("{},{}", self.support_size.0, self.support_size.1),
            ),
            ("sets_per_cell", self.sets_per_cell.to_string()),
            ("max_features", opt(self.max_features)),
            ("avg_oob", opt(self.avg_oob.map(|v| format!("{v:.4}")))),
            ("avg_count", opt(self.avg_count.map(|v| format!("{v:.1}")))),
        ]
    }
}

/// Insert or replace `row` in the tab-separated inventory at `path`.
///
/// Rows are keyed by the `stamp` column. Columns already present in the
/// file are kept, including ones this writer does not know about.
///
/// # Errors
///
/// | Variant | Condition |
/// |---|---|
/// | [`IoError::CsvParse`] | the existing inventory is malformed |
/// | [`IoError::MissingColumn`] | the existing inventory has no `stamp` column |
/// | [`IoError::WriteFile`] | the file cannot be written |
/// | [`IoError::CsvWrite`] | a row cannot be written |
#[instrument(skip_all, fields(path = %path.display(), stamp = %row.stamp))]
pub fn update_inventory(path: &Path, row: &InventoryRow) -> Result<(), IoError> {
    let (mut header, mut rows) = if path.exists() {
        read_inventory(path)?
    } else {
        (vec!["stamp".to_string()], Vec::new())
    };
    let stamp_col = header
        .iter()
        .position(|h| h == "stamp")
        .ok_or_else(|| IoError::MissingColumn {
            path: path.to_path_buf(),
            column: "stamp".to_string(),
        })?;
    let fields = row.fields();
    for (name, _) in &fields {
        if !header.iter().any(|h| h == name) {
            header.push((*name).to_string());
            rows.iter_mut().for_each(|r| r.push(String::new()));
        }
    }
    let col = |name: &str| header.iter().position(|h| h == name);

    let target = match rows.iter().position(|r| r[stamp_col] == row.stamp) {
        Some(i) => i,
        None => {
            let mut fresh = vec![String::new(); header.len()];
            fresh[stamp_col] = row.stamp.clone();
            rows.push(fresh);
            rows.len() - 1
        }
    };
    for (name, value) in fields {
        if let Some(c) = col(name) {
            rows[target][c] = value;
        }
    }

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|e| IoError::OutputDirCreate {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }
    let file = fs::File::create(path).map_err(|e| IoError::WriteFile {
        path: path.to_path_buf(),
        source: e,
    })?;
    let csv_err = |e| IoError::CsvWrite {
        path: path.to_path_buf(),
        source: e,
    };
    let mut w = csv::WriterBuilder::new().delimiter(b'\t').from_writer(file);
    w.write_record(&header).map_err(csv_err)?;
    for r in &rows {
        w.write_record(r).map_err(csv_err)?;
    }
    w.flush().map_err(|e| IoError::WriteFile {
        path: path.to_path_buf(),
        source: e,
    })?;
    info!(n_runs = rows.len(), "inventory updated");
    Ok(())
}

fn read_inventory(path: &Path) -> Result<(Vec<String>, Vec<Vec<String>>), IoError> {
    let csv_err = |e: csv::Error| IoError::CsvParse {
        path: path.to_path_buf(),
        offset: e.position().map_or(0, |p| p.byte()),
        source: e,
    };
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .map_err(csv_err)?;
    let header: Vec<String> = rdr.headers().map_err(csv_err)?.iter().map(String::from).collect();
    let mut rows = Vec::new();
    for result in rdr.records() {
        let record = result.map_err(csv_err)?;
        let mut row: Vec<String> = record.iter().map(String::from).collect();
        row.resize(header.len(), String::new());
        rows.push(row);
    }
    Ok((header, rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use stem_ensemble::{Bounds, SetId, SetStatus};
    use tempfile::TempDir;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, 7)
            .unwrap()
            .and_hms_opt(9, 5, 0)
            .unwrap()
    }

    fn kept(id: u64) -> SetRecord {
        SetRecord {
            set_id: SetId::new(id),
            status: SetStatus::Kept,
            bounds: Bounds::from_corners(0.0, 20.0, 10.0, 0.0),
            min_obs: 5,
            max_features: None,
            n_samples: 30,
            n_train: Some(20),
            n_oob: Some(10),
            dt_file: Some(format!("cover_decisiontree_{id}.bin")),
            oob_rate: Some(0.1),
            oob_count: Some(10),
            importances: vec![0.6, 0.4],
            message: None,
        }
    }

    fn inventory(stamp: &str, n_sets: usize) -> InventoryRow {
        InventoryRow {
            stamp: stamp.to_string(),
            n_sets,
            n_samples: 500,
            support_size: (9000.0, 9000.0),
            sets_per_cell: 10,
            max_features: Some(3),
            avg_oob: Some(0.125),
            avg_count: None,
        }
    }

    #[test]
    fn run_dir_named_by_stamp() {
        let dir = TempDir::new().unwrap();
        let run = RunWriter::create(dir.path(), "cover", now()).unwrap();
        assert_eq!(run.stamp(), "cover_20260307_0905");
        assert!(run.model_dir().is_dir());
        assert_eq!(run.db_path(), dir.path().join("cover_20260307_0905/cover_20260307_0905.db"));

        let reopened = RunWriter::open(run.run_dir()).unwrap();
        assert_eq!(reopened.stamp(), run.stamp());
    }

    #[test]
    fn params_copied_and_found() {
        let dir = TempDir::new().unwrap();
        let params = dir.path().join("cover.toml");
        std::fs::write(&params, "seed = 1\n").unwrap();
        let run = RunWriter::create(&dir.path().join("out"), "cover", now()).unwrap();
        let copied = run.copy_params(&params).unwrap();
        assert_eq!(std::fs::read_to_string(&copied).unwrap(), "seed = 1\n");
        assert_eq!(run.find_params(), Some(copied));
    }

    #[test]
    fn support_sets_txt_leads_with_set_id() {
        let dir = TempDir::new().unwrap();
        let run = RunWriter::create(dir.path(), "cover", now()).unwrap();
        let names = vec!["b1".to_string(), "b2".to_string()];
        let path = run.write_support_sets(&[kept(3), kept(8)], &names).unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        let mut lines = text.lines();
        let header: Vec<&str> = lines.next().unwrap().split('\t').collect();
        assert_eq!(header[0], "set_id");
        assert_eq!(header.last(), Some(&"importance_b2"));
        assert!(!header.iter().any(|h| h.contains("model")));
        let first: Vec<&str> = lines.next().unwrap().split('\t').collect();
        assert_eq!(first[0], "3");
        assert_eq!(lines.count(), 1);
    }

    #[test]
    fn footprints_are_closed_polygons() {
        let dir = TempDir::new().unwrap();
        let run = RunWriter::create(dir.path(), "cover", now()).unwrap();
        let path = run.write_footprints(KEPT_GEOJSON, &[kept(1)]).unwrap();
        let json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(json["type"], "FeatureCollection");
        let feature = &json["features"][0];
        assert_eq!(feature["properties"]["set_id"], 1);
        let ring = feature["geometry"]["coordinates"][0].as_array().unwrap();
        assert_eq!(ring.len(), 5);
        assert_eq!(ring[0], ring[4]);
    }

    #[test]
    fn same_minute_run_does_not_reuse_directory() {
        let dir = TempDir::new().unwrap();
        let first = RunWriter::create(dir.path(), "cover", now()).unwrap();
        std::fs::write(first.model_dir().join("cover_20260307_0905_decisiontree_0.bin"), b"tree").unwrap();

        let err = RunWriter::create(dir.path(), "cover", now()).unwrap_err();
        assert!(matches!(&err, IoError::RunDirExists { path } if path == first.run_dir()));
        let kept = std::fs::read(first.model_dir().join("cover_20260307_0905_decisiontree_0.bin")).unwrap();
        assert_eq!(kept, b"tree");

        let later = now() + chrono::Duration::minutes(1);
        let second = RunWriter::create(dir.path(), "cover", later).unwrap();
        assert_ne!(second.run_dir(), first.run_dir());
    }

    #[test]
    fn inventory_without_stamp_column_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("inventory.txt");
        std::fs::write(&path, "run	notes
old_run	baseline
").unwrap();

        let err = update_inventory(&path, &inventory("cover_1", 10)).unwrap_err();
        assert!(matches!(err, IoError::MissingColumn { column, .. } if column == "stamp"));
        let untouched = std::fs::read_to_string(&path).unwrap();
        assert_eq!(untouched, "run\tnotes\nold_run\tbaseline\n");
    }

    #[test]
    fn inventory_rows_replaced_by_stamp() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("inventory.txt");
        std::fs::write(&path, "stamp\tnotes\nold_run\tbaseline\n").unwrap();

        update_inventory(&path, &inventory("cover_1", 10)).unwrap();
        update_inventory(&path, &inventory("cover_1", 12)).unwrap();

        let mut rdr = csv::ReaderBuilder::new().delimiter(b'\t').from_path(&path).unwrap();
        let header = rdr.headers().unwrap().clone();
        let rows: Vec<csv::StringRecord> = rdr.records().map(Result::unwrap).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[0][1], "baseline");
        let n_sets = header.iter().position(|h| h == "n_sets").unwrap();
        assert_eq!(&rows[1][0], "cover_1");
        assert_eq!(&rows[1][n_sets], "12");
    }
}
