//! Tab-separated sample and variable tables.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use stem_ensemble::{Sample, SampleId, SampleTable};
use tracing::{debug, info, instrument};

use crate::IoError;

/// Column holding explicit sample ids. Optional; the row index is used otherwise.
pub const OBS_ID_COL: &str = "obs_id";

/// Column of the variable table listing predictor name fragments.
pub const VAR_NAME_COL: &str = "var_name";

/// A sample table together with the positions of its constant predictors.
#[derive(Debug)]
pub struct SampleData {
    /// Validated samples.
    pub table: SampleTable,
    /// Predictor positions of the `constant_vars` columns.
    pub constant_indices: Vec<usize>,
}

/// Read the `var_name` column of a variable table.
///
/// # Errors
///
/// | Variant | Condition |
/// |---|---|
/// | [`IoError::FileNotFound`] | file is unreadable |
/// | [`IoError::CsvParse`] | malformed record |
/// | [`IoError::MissingColumn`] | no `var_name` column |
/// | [`IoError::EmptyDataset`] | no variable names |
#[instrument(skip_all, fields(path = %path.display()))]
pub fn read_var_names(path: &Path) -> Result<Vec<String>, IoError> {
    let mut rdr = open_tsv(path)?;
    let header = rdr.headers().map_err(|e| csv_error(path, e))?.clone();
    let col = column_index(&header, VAR_NAME_COL, path)?;

    let mut names = Vec::new();
    for result in rdr.records() {
        let record = result.map_err(|e| csv_error(path, e))?;
        let name = record.get(col).unwrap_or("").trim();
        if !name.is_empty() {
            names.push(name.to_string());
        }
    }
    if names.is_empty() {
        return Err(IoError::EmptyDataset {
            path: path.to_path_buf(),
        });
    }
    debug!(n_vars = names.len(), "read variable names");
    Ok(names)
}

/// Reads the training sample table.
///
/// Expected format: tab-separated with a header holding the coordinate
/// columns, the target column, every predictor column, and optionally
/// `obs_id`. Other columns are ignored.
///
/// # Errors
///
/// | Variant | Condition |
/// |---|---|
/// | [`IoError::FileNotFound`] | file is unreadable |
/// | [`IoError::CsvParse`] | malformed record |
/// | [`IoError::MissingColumn`] | coordinate, target, or constant column absent |
/// | [`IoError::UnmatchedVarNames`] | a variable name matches no column |
/// | [`IoError::EmptyDataset`] | zero data rows |
/// | [`IoError::InconsistentRowLength`] | row length differs from header |
/// | [`IoError::NonFiniteValue`] | a used cell is NaN, Inf, or not a number |
/// | [`IoError::InvalidSampleId`] | `obs_id` is not a non-negative integer |
/// | [`IoError::DuplicateSampleId`] | same id twice |
pub struct SampleReader {
    path: PathBuf,
    x_col: String,
    y_col: String,
    target_col: String,
}

impl SampleReader {
    /// Create a reader for `path` with the given coordinate and target columns.
    pub fn new(path: &Path, x_col: &str, y_col: &str, target_col: &str) -> Self {
        Self {
            path: path.to_path_buf(),
            x_col: x_col.to_string(),
            y_col: y_col.to_string(),
            target_col: target_col.to_string(),
        }
    }

    /// Read samples, selecting predictors from `var_names` and `constant_vars`.
    ///
    /// Predictors are the columns whose name contains any variable name,
    /// sorted and de-duplicated, followed by the constant columns in sorted
    /// order.
    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub fn read(&self, var_names: &[String], constant_vars: &[String]) -> Result<SampleData, IoError> {
        let path = self.path.as_path();
        let mut rdr = open_tsv(path)?;
        let header = rdr.headers().map_err(|e| csv_error(path, e))?.clone();
        let expected_cols = header.len();

        let x_idx = column_index(&header, &self.x_col, path)?;
        let y_idx = column_index(&header, &self.y_col, path)?;
        let target_idx = column_index(&header, &self.target_col, path)?;
        let id_idx = header.iter().position(|h| h == OBS_ID_COL);

        let (predictor_names, constant_indices) =
            self.select_predictors(&header, var_names, constant_vars)?;
        let predictor_cols = predictor_names
            .iter()
            .map(|name| column_index(&header, name, path))
            .collect::<Result<Vec<_>, _>>()?;
        debug!(
            n_predictors = predictor_names.len(),
            n_constant = constant_indices.len(),
            "selected predictor columns"
        );

        let mut samples = Vec::new();
        let mut seen: HashMap<u64, usize> = HashMap::new();
        for (row_index, result) in rdr.records().enumerate() {
            let record = result.map_err(|e| csv_error(path, e))?;
            if record.len() != expected_cols {
                return Err(IoError::InconsistentRowLength {
                    path: path.to_path_buf(),
                    row_index,
                    expected: expected_cols,
                    got: record.len(),
                });
            }

            let id = match id_idx {
                Some(col) => {
                    let raw = record.get(col).unwrap_or("").trim();
                    raw.parse::<u64>().map_err(|_| IoError::InvalidSampleId {
                        path: path.to_path_buf(),
                        row_index,
                        raw: raw.to_string(),
                    })?
                }
                None => row_index as u64,
            };
            if let Some(&first_row) = seen.get(&id) {
                return Err(IoError::DuplicateSampleId {
                    path: path.to_path_buf(),
                    sample_id: id,
                    first_row,
                    second_row: row_index,
                });
            }
            seen.insert(id, row_index);

            let cell = |col: usize| parse_finite(path, &header, &record, row_index, col);
            let predictors = predictor_cols
                .iter()
                .map(|&col| cell(col))
                .collect::<Result<Vec<_>, _>>()?;
            samples.push(Sample {
                id: SampleId::new(id),
                x: cell(x_idx)?,
                y: cell(y_idx)?,
                predictors,
                target: cell(target_idx)?,
            });
        }

        if samples.is_empty() {
            return Err(IoError::EmptyDataset {
                path: path.to_path_buf(),
            });
        }

        let table = SampleTable::new(predictor_names, self.target_col.clone(), samples)?;
        info!(
            n_samples = table.len(),
            n_predictors = table.predictor_names().len(),
            target = %self.target_col,
            "loaded samples"
        );
        Ok(SampleData {
            table,
            constant_indices,
        })
    }

    fn select_predictors(
        &self,
        header: &csv::StringRecord,
        var_names: &[String],
        constant_vars: &[String],
    ) -> Result<(Vec<String>, Vec<usize>), IoError> {
        let reserved = [
            self.x_col.as_str(),
            self.y_col.as_str(),
            self.target_col.as_str(),
            OBS_ID_COL,
        ];
        let candidates: Vec<&str> = header.iter().filter(|h| !reserved.contains(h)).collect();

        let unmatched: Vec<String> = var_names
            .iter()
            .filter(|v| !candidates.iter().any(|c| c.contains(v.as_str())))
            .cloned()
            .collect();
        if !unmatched.is_empty() {
            return Err(IoError::UnmatchedVarNames {
                path: self.path.clone(),
                names: unmatched,
            });
        }

        let mut names: Vec<String> = candidates
            .iter()
            .filter(|c| !constant_vars.iter().any(|k| k == *c))
            .filter(|c| var_names.iter().any(|v| c.contains(v.as_str())))
            .map(|c| (*c).to_string())
            .collect();
        names.sort();
        names.dedup();

        let mut constant_indices = Vec::with_capacity(constant_vars.len());
        for name in constant_vars {
            if !candidates.contains(&name.as_str()) {
                return Err(IoError::MissingColumn {
                    path: self.path.clone(),
                    column: name.clone(),
                });
            }
            constant_indices.push(names.len());
            names.push(name.clone());
        }
        Ok((names, constant_indices))
    }
}

fn open_tsv(path: &Path) -> Result<csv::Reader<std::fs::File>, IoError> {
    let file = std::fs::File::open(path).map_err(|e| IoError::FileNotFound {
        path: path.to_path_buf(),
        source: e,
    })?;
    // flexible(true) so our own InconsistentRowLength check fires first.
    Ok(csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .flexible(true)
        .from_reader(file))
}

fn csv_error(path: &Path, e: csv::Error) -> IoError {
    IoError::CsvParse {
        path: path.to_path_buf(),
        offset: e.position().map_or(0, |p| p.byte()),
        source: e,
    }
}

fn column_index(header: &csv::StringRecord, column: &str, path: &Path) -> Result<usize, IoError> {
    header
        .iter()
        .position(|h| h == column)
        .ok_or_else(|| IoError::MissingColumn {
            path: path.to_path_buf(),
            column: column.to_string(),
        })
}

fn parse_finite(
    path: &Path,
    header: &csv::StringRecord,
    record: &csv::StringRecord,
    row_index: usize,
    col: usize,
) -> Result<f64, IoError> {
    let raw = record.get(col).unwrap_or("").trim();
    match raw.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(IoError::NonFiniteValue {
            path: path.to_path_buf(),
            row_index,
            column: header.get(col).unwrap_or("").to_string(),
            raw: raw.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn predictors_selected_by_substring_then_constants() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "s.txt",
            "x\ty\tcover\tndvi_2\tndvi_1\televation\taspect\tnotes\n\
             1.0\t2.0\t1\t0.5\t0.4\t300\t90\t7\n\
             3.0\t4.0\t0\t0.2\t0.1\t310\t180\t8\n",
        );
        let data = SampleReader::new(&path, "x", "y", "cover")
            .read(&names(&["ndvi"]), &names(&["aspect", "elevation"]))
            .unwrap();
        assert_eq!(
            data.table.predictor_names(),
            &names(&["ndvi_1", "ndvi_2", "aspect", "elevation"])[..]
        );
        assert_eq!(data.constant_indices, vec![2, 3]);
        assert_eq!(data.table.samples()[0].predictors, vec![0.4, 0.5, 90.0, 300.0]);
        assert_eq!(data.table.samples()[1].id, SampleId::new(1));
    }

    #[test]
    fn obs_id_column_used_when_present() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "s.txt", "obs_id\tx\ty\tt\tb1\n17\t0\t0\t1\t2\n4\t1\t1\t0\t3\n");
        let data = SampleReader::new(&path, "x", "y", "t").read(&names(&["b"]), &[]).unwrap();
        let ids: Vec<u64> = data.table.samples().iter().map(|s| s.id.get()).collect();
        assert_eq!(ids, vec![17, 4]);
    }

    #[test]
    fn unmatched_var_names_all_listed() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "s.txt", "x\ty\tt\tb1\n0\t0\t1\t2\n");
        let err = SampleReader::new(&path, "x", "y", "t")
            .read(&names(&["b", "slope", "tcb"]), &[])
            .unwrap_err();
        match err {
            IoError::UnmatchedVarNames { names, .. } => assert_eq!(names, vec!["slope", "tcb"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_target_column() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "s.txt", "x\ty\tb1\n0\t0\t2\n");
        let err = SampleReader::new(&path, "x", "y", "cover").read(&names(&["b"]), &[]).unwrap_err();
        assert!(matches!(err, IoError::MissingColumn { column, .. } if column == "cover"));
    }

    #[test]
    fn non_finite_value_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "s.txt", "x\ty\tt\tb1\n0\t0\t1\tNaN\n");
        let err = SampleReader::new(&path, "x", "y", "t").read(&names(&["b"]), &[]).unwrap_err();
        assert!(matches!(err, IoError::NonFiniteValue { row_index: 0, .. }));
    }

    #[test]
    fn duplicate_obs_id_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "s.txt", "obs_id\tx\ty\tt\tb1\n3\t0\t0\t1\t2\n3\t1\t1\t0\t3\n");
        let err = SampleReader::new(&path, "x", "y", "t").read(&names(&["b"]), &[]).unwrap_err();
        assert!(matches!(
            err,
            IoError::DuplicateSampleId {
                sample_id: 3,
                first_row: 0,
                second_row: 1,
                ..
            }
        ));
    }

    #[test]
    fn short_row_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "s.txt", "x\ty\tt\tb1\n0\t0\t1\t2\n0\t0\t1\n");
        let err = SampleReader::new(&path, "x", "y", "t").read(&names(&["b"]), &[]).unwrap_err();
        assert!(matches!(err, IoError::InconsistentRowLength { row_index: 1, got: 3, .. }));
    }

    #[test]
    fn var_names_read_and_blank_rows_skipped() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "v.txt", "var_name\tfile\nndvi\ta.tif\n\tb.tif\nelev\tc.tif\n");
        assert_eq!(read_var_names(&path).unwrap(), vec!["ndvi", "elev"]);
    }
}
